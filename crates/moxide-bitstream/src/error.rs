/// The error type for bitstream-level operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// More bits were requested than the stream holds.
    UnexpectedEof,
    /// `ZeroPadToByte` read non-zero bits.
    NonZeroPadding,
    /// Parsed value couldn't be represented with the given enum.
    InvalidEnum { name: &'static str, value: u32 },
    /// A value was out of range for every variant of a `U32` descriptor.
    U32OutOfRange(u32),
    /// The bitstream is invalid.
    ValidationFailed(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of bitstream"),
            Self::NonZeroPadding => write!(f, "ZeroPadToByte() read non-zero bits"),
            Self::InvalidEnum { name, value } => {
                write!(f, "Enum({}) read invalid enum value of {}", name, value)
            }
            Self::U32OutOfRange(value) => {
                write!(f, "value {} not representable by U32 descriptor", value)
            }
            Self::ValidationFailed(msg) => write!(f, "bitstream validation failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Shorthand for result type of `moxide_bitstream`.
pub type Result<T> = std::result::Result<T, Error>;
