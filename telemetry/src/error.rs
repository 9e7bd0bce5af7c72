use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

pub type Result<T> = std::result::Result<T, SinkErr>;

#[derive(Debug)]
pub enum SinkErr {
    Io(io::Error),
    Encode(serde_json::Error),
}

impl Display for SinkErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkErr::Io(e) => write!(f, "io error: {e}"),
            SinkErr::Encode(e) => write!(f, "failed to encode metric: {e}"),
        }
    }
}

impl Error for SinkErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SinkErr::Io(e) => Some(e),
            SinkErr::Encode(e) => Some(e),
        }
    }
}

impl From<io::Error> for SinkErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for SinkErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value)
    }
}
