// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Engine configuration
//!
//! Plain serde structures with defaults, so a host can load them from any
//! serde format and only override what it needs.
//!

use crate::{
    shutdown::ShutdownConfig, summary::StartupSummaryLevel, supervising::SupervisingConfig,
    Error,
};

use serde::{Deserialize, Serialize};

/// Per-message pipeline configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Recycle the advice state arrays.
    pub pooled: bool,
    /// Maximum number of recycled state arrays per route.
    pub pool_capacity: usize,
    /// Record the message history of every exchange.
    pub message_history: bool,
    /// Trace every exchange at debug level.
    pub tracing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pooled: true,
            pool_capacity: 100,
            message_history: false,
            tracing: false,
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub shutdown: ShutdownConfig,
    /// Use the supervising route controller when set.
    pub supervising: Option<SupervisingConfig>,
    pub startup_summary_level: StartupSummaryLevel,
    pub pipeline: PipelineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "rush-routes".to_owned(),
            shutdown: ShutdownConfig::default(),
            supervising: None,
            startup_summary_level: StartupSummaryLevel::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.shutdown.validate()?;
        if let Some(supervising) = &self.supervising {
            supervising.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pipeline.pooled);
        assert_eq!(config.pipeline.pool_capacity, 100);
        assert_eq!(config.startup_summary_level, StartupSummaryLevel::Default);
    }

    #[test]
    fn test_validation_reaches_nested_configs() {
        let mut config = EngineConfig::default();
        config.shutdown.timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(Error::InvalidTimeout));

        let config = EngineConfig {
            supervising: Some(SupervisingConfig {
                thread_pool_size: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }
}
