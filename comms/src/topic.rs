const AGGREGATOR_ROLE: &str = "aggregator";
const CLIENT_ROLE: &str = "client";

/// The two topics a client talks over, named after the role that publishes on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPair {
    /// Where the aggregator publishes broadcasts for the client.
    pub to_client: String,
    /// Where the client publishes its results for the aggregator.
    pub to_aggregator: String,
}

impl TopicPair {
    /// Derives the topic pair of `client_id`, the same id always yields the same pair.
    pub fn for_client(client_id: &str) -> Self {
        Self {
            to_client: format!("/{AGGREGATOR_ROLE}/publish/{client_id}"),
            to_aggregator: format!("/{CLIENT_ROLE}/publish/{client_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_are_deterministic_and_disjoint() {
        let a = TopicPair::for_client("host_ab12");
        assert_eq!(a, TopicPair::for_client("host_ab12"));
        assert_eq!(a.to_client, "/aggregator/publish/host_ab12");
        assert_eq!(a.to_aggregator, "/client/publish/host_ab12");

        let b = TopicPair::for_client("host_cd34");
        assert_ne!(a.to_client, b.to_client);
        assert_ne!(a.to_aggregator, b.to_aggregator);
    }
}
