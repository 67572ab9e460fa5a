//! Core relay state
//!
//! The Relay struct bundles everything the accept/receive loops and the
//! per-connection tasks share.

use super::relay::ForwardOptions;
use super::session::SessionTable;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::filter::FilterPipeline;

/// Immutable relay state shared as `Arc<Relay>`
#[derive(Debug)]
pub struct Relay {
    pub config: RelayConfig,
    /// Compiled filter rules
    pub pipeline: FilterPipeline,
    /// Datagram sessions (unused by the stream relay)
    pub sessions: SessionTable,
}

impl Relay {
    /// Validate the config and compile its filter rules
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Create a new relay builder
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions::from_config(&self.config)
    }
}

/// Builder for constructing a Relay
#[derive(Default)]
pub struct RelayBuilder {
    config: Option<RelayConfig>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set relay configuration
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the relay
    ///
    /// Fails if no config was set, the config is invalid or a filter rule does
    /// not compile
    pub fn build(self) -> Result<Relay> {
        let config = self
            .config
            .ok_or_else(|| RelayError::Config("relay config is required".to_string()))?;
        config.validate()?;
        let pipeline = FilterPipeline::compile(&config.filters)?;

        Ok(Relay {
            config,
            pipeline,
            sessions: SessionTable::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, FilterRules, TransportKind};
    use std::time::Duration;

    fn test_config() -> RelayConfig {
        RelayConfig::new(
            TransportKind::Tcp,
            Endpoint::parse("127.0.0.1:0", "0.0.0.0").unwrap(),
            Endpoint::parse("127.0.0.1:9", "0.0.0.0").unwrap(),
        )
    }

    #[test]
    fn test_relay_new() {
        let relay = Relay::new(test_config()).unwrap();
        assert!(relay.pipeline.is_empty());
        assert!(relay.sessions.is_empty());
    }

    #[test]
    fn test_relay_builder_requires_config() {
        let err = Relay::builder().build().unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_relay_rejects_invalid_config() {
        let mut config = test_config();
        config.buffer_size = 0;
        assert!(Relay::new(config).is_err());

        let mut config = test_config();
        config.filters = FilterRules {
            drop_reg: vec!["(".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Relay::new(config).unwrap_err(),
            RelayError::Filter { .. }
        ));
    }

    #[test]
    fn test_forward_options() {
        let mut config = test_config();
        config.buffer_size = 1500;
        config.idle_timeout = Duration::from_secs(3);
        let relay = Relay::new(config).unwrap();

        let opts = relay.forward_options();
        assert_eq!(opts.buffer_size, 1500);
        assert_eq!(opts.idle_timeout, Some(Duration::from_secs(3)));
    }
}
