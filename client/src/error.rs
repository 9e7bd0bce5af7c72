use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use model::ModelErr;

pub type Result<T> = std::result::Result<T, ClientErr>;

/// Client failures.
#[derive(Debug)]
pub enum ClientErr {
    /// The received parameters don't fit the local model, the round is abandoned.
    ParameterMismatch(ModelErr),
    Model(ModelErr),
    /// The broker or the registry could not be reached.
    TransportFailure(io::Error),
    /// Every registration attempt failed.
    RegistrationExhausted {
        attempts: usize,
    },
    /// The registry refused a request.
    Rejected(String),
    Config(String),
    Io(io::Error),
}

impl Display for ClientErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErr::ParameterMismatch(e) => write!(f, "parameter mismatch: {e}"),
            ClientErr::Model(e) => write!(f, "model error: {e}"),
            ClientErr::TransportFailure(e) => write!(f, "transport failure: {e}"),
            ClientErr::RegistrationExhausted { attempts } => {
                write!(f, "registration failed after {attempts} attempts")
            }
            ClientErr::Rejected(reason) => write!(f, "rejected by the registry: {reason}"),
            ClientErr::Config(detail) => write!(f, "invalid config: {detail}"),
            ClientErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for ClientErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientErr::ParameterMismatch(e) | ClientErr::Model(e) => Some(e),
            ClientErr::TransportFailure(e) | ClientErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelErr> for ClientErr {
    fn from(value: ModelErr) -> Self {
        match value {
            ModelErr::ParameterMismatch { .. } | ModelErr::ShapeMismatch { .. } => {
                Self::ParameterMismatch(value)
            }
            other => Self::Model(other),
        }
    }
}

impl From<io::Error> for ClientErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ClientErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Io(value.into())
    }
}

impl From<ClientErr> for io::Error {
    fn from(value: ClientErr) -> Self {
        match value {
            ClientErr::Io(e) | ClientErr::TransportFailure(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
