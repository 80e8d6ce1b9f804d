//! Server configuration.

use std::time::Duration;
use syncline_protocol::EntityType;

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Messages processed per batch; the rest are left for a later batch.
    pub max_batch: usize,
    /// Entity types whose changes are rejected.
    pub read_only_types: Vec<EntityType>,
    /// Artificial delay added to every request.
    pub latency: Option<Duration>,
    /// Fail every n-th request at the transport level.
    pub fail_every: Option<u64>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new() -> Self {
        Self {
            max_batch: 100,
            read_only_types: Vec::new(),
            latency: None,
            fail_every: None,
        }
    }

    /// Sets the maximum messages processed per batch.
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }

    /// Marks an entity type as read-only.
    pub fn with_read_only(mut self, entity_type: EntityType) -> Self {
        self.read_only_types.push(entity_type);
        self
    }

    /// Adds artificial latency to every request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails every n-th request (n >= 1).
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_batch, 100);
        assert!(config.read_only_types.is_empty());
        assert!(config.latency.is_none());
        assert!(config.fail_every.is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_batch(0)
            .with_read_only(EntityType::new(3))
            .with_fail_every(0)
            .with_latency(Duration::from_millis(5));

        assert_eq!(config.max_batch, 1);
        assert_eq!(config.read_only_types, vec![EntityType::new(3)]);
        assert_eq!(config.fail_every, Some(1));
        assert_eq!(config.latency, Some(Duration::from_millis(5)));
    }
}
