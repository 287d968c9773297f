/// Errors returned from the entropy coder.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Histogram frequencies don't sum to the normalization total, or the
    /// alphabet is larger than the coder supports.
    InvalidAnsHistogram,
    /// ANS stream ended in an unexpected state, or ran out of bytes.
    InvalidAnsStream,
    /// Cluster map references a cluster that doesn't exist.
    InvalidClusterMap,
    /// A symbol was read from a cluster with an empty histogram.
    EmptyCluster(u8),
    Bitstream(moxide_bitstream::Error),
}

impl From<moxide_bitstream::Error> for Error {
    fn from(err: moxide_bitstream::Error) -> Self {
        Self::Bitstream(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAnsHistogram => write!(f, "invalid ANS histogram"),
            Self::InvalidAnsStream => write!(f, "ANS stream final state mismatch"),
            Self::InvalidClusterMap => write!(f, "invalid cluster map"),
            Self::EmptyCluster(cluster) => {
                write!(f, "symbol read from empty cluster {}", cluster)
            }
            Self::Bitstream(err) => write!(f, "bitstream error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bitstream(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
