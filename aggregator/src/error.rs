use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use model::ModelErr;

/// The aggregator's result type.
pub type Result<T> = std::result::Result<T, AggregatorErr>;

/// Aggregator failures.
#[derive(Debug)]
pub enum AggregatorErr {
    /// The client id was never registered or is not in the feasible set.
    UnknownClient(String),
    /// A session for the client id is already open, the existing one must be reused.
    DuplicateSession(String),
    /// A round was about to start without any joined client.
    NoClients,
    /// The round deadline passed and the configured policy is to abort.
    RoundAborted {
        round: usize,
        missing: Vec<String>,
    },
    Model(ModelErr),
    Config(String),
    Io(io::Error),
}

impl Display for AggregatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorErr::UnknownClient(id) => write!(f, "unknown client {id}"),
            AggregatorErr::DuplicateSession(id) => write!(f, "client {id} already has a session"),
            AggregatorErr::NoClients => f.write_str("no joined clients to start the round with"),
            AggregatorErr::RoundAborted { round, missing } => {
                write!(f, "round {round} aborted, missing results from {missing:?}")
            }
            AggregatorErr::Model(e) => write!(f, "model error: {e}"),
            AggregatorErr::Config(detail) => write!(f, "invalid config: {detail}"),
            AggregatorErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for AggregatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AggregatorErr::Model(e) => Some(e),
            AggregatorErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AggregatorErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ModelErr> for AggregatorErr {
    fn from(value: ModelErr) -> Self {
        Self::Model(value)
    }
}

impl From<serde_json::Error> for AggregatorErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Io(value.into())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<AggregatorErr> for io::Error {
    fn from(value: AggregatorErr) -> Self {
        match value {
            AggregatorErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
