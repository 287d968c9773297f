#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Input image is unusable: empty dimensions or its error flag is set.
    InvalidImage,
    InvalidMaTree,
    GlobalMaTreeNotAvailable,
    /// Learned tree didn't survive the tokenize/parse round trip; this is a
    /// programming error, not stream corruption.
    TreeRoundTripFailed,
    /// The option set asks for something contradictory, e.g. `force_no_wp`
    /// with the self-correcting predictor as the only candidate.
    InvalidOptions(&'static str),
    Bitstream(moxide_bitstream::Error),
    Coding(moxide_coding::Error),
}

impl From<moxide_bitstream::Error> for Error {
    fn from(err: moxide_bitstream::Error) -> Self {
        Self::Bitstream(err)
    }
}

impl From<moxide_coding::Error> for Error {
    fn from(err: moxide_coding::Error) -> Self {
        Self::Coding(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidImage => write!(f, "invalid image"),
            Self::InvalidMaTree => write!(f, "invalid meta-adaptive tree"),
            Self::GlobalMaTreeNotAvailable => {
                write!(f, "global meta-adaptive tree requested but unavailable")
            }
            Self::TreeRoundTripFailed => {
                write!(f, "learned tree failed the tokenize/parse round trip")
            }
            Self::InvalidOptions(msg) => write!(f, "invalid options: {msg}"),
            Self::Bitstream(err) => write!(f, "bitstream error: {}", err),
            Self::Coding(err) => write!(f, "entropy coder error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bitstream(err) => Some(err),
            Self::Coding(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
