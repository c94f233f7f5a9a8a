//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use ferrule_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_clients(2)
///     .timeout_secs(1)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn socket_dir(mut self, dir: &str) -> Self {
        self.config.channel.socket_dir = dir.to_string();
        self
    }

    pub fn max_clients(mut self, n: u32) -> Self {
        self.config.channel.max_clients = n;
        self
    }

    pub fn max_sessions(mut self, n: u32) -> Self {
        self.config.channel.max_sessions = n;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.channel.timeout_secs = secs;
        self
    }

    pub fn socket_mode(mut self, mode: &str) -> Self {
        self.config.channel.socket_mode = mode.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
