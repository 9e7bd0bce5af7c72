use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// The broker acknowledges every publish, it may be delivered more than once.
    AtLeastOnce,
    /// The broker acknowledges every publish and drops redelivered duplicates.
    #[default]
    ExactlyOnce,
}

impl Qos {
    /// Whether a publish with this level waits for the broker's acknowledgment.
    pub fn needs_ack(self) -> bool {
        self != Qos::AtMostOnce
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid qos level {other}, must be 0, 1 or 2")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(value: Qos) -> Self {
        value as u8
    }
}

impl Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels_from_json() {
        let levels: Vec<Qos> = serde_json::from_str("[0, 1, 2]").unwrap();
        assert_eq!(levels, vec![Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce]);
        assert!(serde_json::from_str::<Qos>("3").is_err());
    }
}
