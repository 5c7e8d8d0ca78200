// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Engine
//!
//! The [`Engine`] owns the route registry, the inflight repository, the
//! shutdown strategy and the orchestrator, and picks the route controller
//! from the configuration. Hosts add route definitions and then start and
//! stop the engine as a whole.
//!

use crate::{
    advice::Debugger,
    config::EngineConfig,
    controller::{DefaultRouteController, RouteController},
    route::RouteDefinition,
    shutdown::ShutdownSignal,
    summary::{log_summary, startup_summary, stop_summary, SummaryLine},
    Error, InflightRepository, LifecycleOrchestrator, Route, RouteRegistry, RouteStatus,
    ShutdownStrategy, SupervisingRouteController,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

/// Engine status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl EngineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineStatus::Starting,
            2 => EngineStatus::Started,
            3 => EngineStatus::Stopping,
            _ => EngineStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineStatus::Stopped => 0,
            EngineStatus::Starting => 1,
            EngineStatus::Started => 2,
            EngineStatus::Stopping => 3,
        }
    }
}

/// Engine builder.
pub struct EngineBuilder {
    config: EngineConfig,
    debugger: Option<Arc<dyn Debugger>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            debugger: None,
        }
    }

    /// Debugger called around the processor of every route.
    pub fn debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        self.config.validate()?;
        let registry = Arc::new(RouteRegistry::new());
        let inflight = Arc::new(InflightRepository::new());
        let signal = Arc::new(ShutdownSignal::default());
        let shutdown = Arc::new(ShutdownStrategy::new(
            self.config.shutdown.clone(),
            signal,
            inflight.clone(),
        ));
        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            registry.clone(),
            inflight.clone(),
            shutdown.clone(),
            self.config.pipeline.clone(),
            self.debugger,
        ));

        let supervising = match &self.config.supervising {
            Some(config) => Some(SupervisingRouteController::new(
                orchestrator.clone(),
                config.clone(),
                self.config.startup_summary_level,
            )?),
            None => None,
        };
        let controller: Arc<dyn RouteController> = match &supervising {
            Some(supervising) => supervising.clone(),
            None => Arc::new(DefaultRouteController::new(orchestrator.clone())),
        };

        debug!("Engine {} created.", self.config.name);
        Ok(Engine {
            config: self.config,
            registry,
            inflight,
            shutdown,
            orchestrator,
            controller,
            supervising,
            status: AtomicU8::new(EngineStatus::Stopped.as_u8()),
        })
    }
}

/// Routing engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<RouteRegistry>,
    inflight: Arc<InflightRepository>,
    shutdown: Arc<ShutdownStrategy>,
    orchestrator: Arc<LifecycleOrchestrator>,
    controller: Arc<dyn RouteController>,
    supervising: Option<Arc<SupervisingRouteController>>,
    status: AtomicU8,
}

impl Engine {
    /// Engine with the given configuration and no debugger.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        EngineBuilder::new(config).build()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Registers a route. Once the engine is started the route is started
    /// right away if it is an auto startup route.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<Arc<Route>, Error> {
        let route = self.orchestrator.add_route(definition).await?;
        self.controller.on_route_added(&route).await?;
        if self.status() == EngineStatus::Started
            && !self.controller.is_supervising()
            && route.is_auto_startup()
        {
            self.orchestrator.start_route(route.id()).await?;
        }
        Ok(route)
    }

    /// Removes a stopped route. Returns `false` if the route is not stopped.
    pub async fn remove_route(&self, id: &str) -> Result<bool, Error> {
        let route = self.orchestrator.route(id)?;
        let removed = self.orchestrator.remove_route(id).await?;
        if removed {
            self.controller.on_route_removed(&route).await;
        }
        Ok(removed)
    }

    /// Starts the routes. A failure stops whatever was started.
    pub async fn start(&self) -> Result<(), Error> {
        if self.status() == EngineStatus::Started {
            return Ok(());
        }
        let started = Instant::now();
        info!("Engine {} is starting.", self.name());
        self.set_status(EngineStatus::Starting);
        self.shutdown.signal().reset();

        if let Err(error) = self.controller.on_engine_started().await {
            warn!("Engine {} failed to start: {}", self.name(), error);
            self.shutdown.signal().set_stopping(true);
            self.controller.on_engine_stopping().await;
            if let Err(stop_error) = self.orchestrator.stop_all_routes().await {
                debug!("Error stopping routes after failed start: {}", stop_error);
            }
            self.shutdown.signal().set_stopping(false);
            self.set_status(EngineStatus::Stopped);
            return Err(error);
        }

        self.set_status(EngineStatus::Started);
        if !self.controller.is_supervising() {
            log_summary(&self.startup_summary());
        }
        info!("Engine {} started in {:?}", self.name(), started.elapsed());
        Ok(())
    }

    /// Lines of the startup summary of the engine.
    pub fn startup_summary(&self) -> Vec<String> {
        let lines: Vec<SummaryLine> = self
            .orchestrator
            .startup_orders()
            .iter()
            .map(|order| {
                let route = &order.route;
                let status = route.status();
                if !route.is_auto_startup() && status.is_stopped() {
                    SummaryLine::of(route, "Disabled")
                } else {
                    SummaryLine::of(route, &status.to_string())
                }
            })
            .collect();
        startup_summary(self.config.startup_summary_level, &lines)
    }

    /// Gracefully shuts every route down within the shutdown timeout.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.status() == EngineStatus::Stopped {
            return Ok(());
        }
        let started = Instant::now();
        info!("Engine {} is shutting down.", self.name());
        self.set_status(EngineStatus::Stopping);
        self.shutdown.signal().set_stopping(true);
        self.controller.on_engine_stopping().await;

        let result = self.orchestrator.stop_all_routes().await;
        if let Ok(routes) = &result {
            log_summary(&self.stop_summary(routes));
        }
        self.set_status(EngineStatus::Stopped);
        info!("Engine {} shutdown in {:?}", self.name(), started.elapsed());
        result.map(|_| ())
    }

    fn stop_summary(&self, routes: &[Arc<Route>]) -> Vec<String> {
        let lines: Vec<SummaryLine> = routes
            .iter()
            .map(|route| {
                if route.is_forced_shutdown() {
                    SummaryLine::of(route, "Forced stopped")
                } else {
                    SummaryLine::of(route, &route.status().to_string())
                }
            })
            .collect();
        stop_summary(self.config.startup_summary_level, &lines)
    }

    /// Waits for the token to be cancelled, then stops the engine.
    pub async fn stop_on(&self, token: CancellationToken) -> Result<(), Error> {
        token.cancelled().await;
        debug!("Stop requested for engine {}.", self.name());
        self.stop().await
    }

    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.registry.get(id)
    }

    /// All routes in startup order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.orchestrator
            .startup_orders()
            .into_iter()
            .map(|order| order.route)
            .collect()
    }

    pub fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.controller.route_status(id)
    }

    /// Routes whose last error marks them unhealthy.
    pub fn unhealthy_routes(&self) -> Vec<Arc<Route>> {
        self.routes()
            .into_iter()
            .filter(|route| route.last_error().is_some_and(|error| error.unhealthy))
            .collect()
    }

    pub fn route_controller(&self) -> &Arc<dyn RouteController> {
        &self.controller
    }

    pub fn supervising_controller(&self) -> Option<&Arc<SupervisingRouteController>> {
        self.supervising.as_ref()
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn inflight_repository(&self) -> &Arc<InflightRepository> {
        &self.inflight
    }

    pub fn shutdown_strategy(&self) -> &Arc<ShutdownStrategy> {
        &self.shutdown
    }
}
