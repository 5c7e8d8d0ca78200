// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Route controllers
//!
//! The entry points operators use to drive single routes. The default
//! controller delegates straight to the orchestrator, the supervising one
//! (see [`crate::SupervisingRouteController`]) adds restart with backoff.
//!

use crate::{Error, LifecycleOrchestrator, Route, RouteStatus};

use async_trait::async_trait;

use std::{sync::Arc, time::Duration};

/// Route controller.
#[async_trait]
pub trait RouteController: Send + Sync {
    async fn start_route(&self, id: &str) -> Result<(), Error>;

    async fn stop_route(&self, id: &str) -> Result<(), Error>;

    async fn stop_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error>;

    /// Returns `false` if the stop timed out and was aborted.
    async fn stop_route_with_abort(
        &self,
        id: &str,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error>;

    async fn suspend_route(&self, id: &str) -> Result<(), Error>;

    async fn suspend_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error>;

    async fn resume_route(&self, id: &str) -> Result<(), Error>;

    fn route_status(&self, id: &str) -> Option<RouteStatus>;

    /// True if the controller starts the routes itself.
    fn is_supervising(&self) -> bool {
        false
    }

    /// Called once a route has been registered.
    async fn on_route_added(&self, _route: &Arc<Route>) -> Result<(), Error> {
        Ok(())
    }

    /// Called once a route has been removed.
    async fn on_route_removed(&self, _route: &Arc<Route>) {}

    /// Starts the routes the controller is in charge of.
    async fn on_engine_started(&self) -> Result<(), Error>;

    /// Called before the engine shuts the routes down.
    async fn on_engine_stopping(&self) {}
}

/// Controller that delegates every operation to the orchestrator.
pub struct DefaultRouteController {
    orchestrator: Arc<LifecycleOrchestrator>,
}

impl DefaultRouteController {
    pub fn new(orchestrator: Arc<LifecycleOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl RouteController for DefaultRouteController {
    async fn start_route(&self, id: &str) -> Result<(), Error> {
        self.orchestrator.start_route(id).await
    }

    async fn stop_route(&self, id: &str) -> Result<(), Error> {
        self.orchestrator.stop_route(id).await
    }

    async fn stop_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        self.orchestrator.stop_route_with_timeout(id, timeout).await
    }

    async fn stop_route_with_abort(
        &self,
        id: &str,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error> {
        self.orchestrator
            .stop_route_with_abort(id, timeout, abort_after_timeout)
            .await
    }

    async fn suspend_route(&self, id: &str) -> Result<(), Error> {
        self.orchestrator.suspend_route(id).await
    }

    async fn suspend_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        self.orchestrator.suspend_route_with_timeout(id, timeout).await
    }

    async fn resume_route(&self, id: &str) -> Result<(), Error> {
        self.orchestrator.resume_route(id).await
    }

    fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.orchestrator.route_status(id)
    }

    async fn on_engine_started(&self) -> Result<(), Error> {
        self.orchestrator.start_all_routes().await
    }
}
