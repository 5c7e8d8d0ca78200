// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

/// Error type for the routing engine.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A timeout that must be positive was zero.
    #[error("Timeout must be a positive value.")]
    InvalidTimeout,
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The route is not registered.
    #[error("Route {0} not found.")]
    RouteNotFound(String),
    /// A route with the same id is already registered.
    #[error("Route {0} already exists.")]
    RouteExists(String),
    /// Two routes claim the same explicit startup order.
    #[error("Startup order {order} of route {route} is already in use by route {existing}.")]
    StartupOrderInUse {
        order: u32,
        route: String,
        existing: String,
    },
    /// Starting a route or one of its services failed.
    #[error("Failed to start route {0}: {1}")]
    Start(String, String),
    /// Stopping a route or one of its services failed.
    #[error("Failed to stop route {0}: {1}")]
    Stop(String, String),
    /// Suspending a route failed.
    #[error("Failed to suspend route {0}: {1}")]
    Suspend(String, String),
    /// Resuming a route failed.
    #[error("Failed to resume route {0}: {1}")]
    Resume(String, String),
    /// Removing a route failed.
    #[error("Failed to remove route {0}: {1}")]
    Remove(String, String),
    /// The shutdown procedure failed.
    #[error("Shutdown error: {0}")]
    Shutdown(String),
    /// Business failure while processing an exchange.
    #[error("Processing error: {0}")]
    Processing(String),
    /// The engine is forcing a shutdown and rejects new work.
    #[error("Rejected execution of exchange {0}: engine is forcing shutdown.")]
    RejectedExecution(String),
    /// Error that does not compromise the operation of the system.
    #[error("Error: {0}")]
    Functional(String),
}

impl Error {
    /// True if this is a rejection caused by a forced shutdown.
    pub fn is_rejected_execution(&self) -> bool {
        matches!(self, Error::RejectedExecution(_))
    }
}

/// Lifecycle phase in which a route error happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Start,
    Stop,
    Suspend,
    Resume,
    Remove,
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Suspend => "suspend",
            Phase::Resume => "resume",
            Phase::Remove => "remove",
            Phase::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// Last error recorded on a route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteError {
    pub phase: Phase,
    pub error: Error,
    /// Marks the route as unhealthy for health checks.
    pub unhealthy: bool,
}

impl RouteError {
    pub fn new(phase: Phase, error: Error) -> Self {
        Self {
            phase,
            error,
            unhealthy: false,
        }
    }

    pub fn unhealthy(phase: Phase, error: Error) -> Self {
        Self {
            phase,
            error,
            unhealthy: true,
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}
