//! Hub configuration.

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum records per pull response.
    pub max_pull_batch: u32,
    /// Maximum records per push request.
    pub max_push_batch: u32,
}

impl ServerConfig {
    /// Creates a configuration with the default limits.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 500,
            max_push_batch: 500,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size.max(1);
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size.max(1);
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
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_pull_batch(50)
            .with_max_push_batch(0);

        assert_eq!(config.max_pull_batch, 50);
        assert_eq!(config.max_push_batch, 1);
    }
}
