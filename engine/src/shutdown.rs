// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Graceful shutdown
//!
//! [`ShutdownStrategy`] stops or suspends a set of routes in two phases.
//! Routes that can be silenced right away are, the others are deferred
//! until the in-flight exchanges drained. The whole procedure runs on a
//! spawned task bounded by a timeout. When the timeout expires the caller
//! either aborts, forces the remaining routes down, or leaves them be.
//!

use crate::{
    route::{sort_startup_order, Route, RouteStartupOrder, ShutdownRoute, ShutdownRunningTask},
    service::{flatten_services, pending_exchanges, ShutdownAware},
    Error, InflightRepository,
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Shutdown configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Budget for the whole graceful procedure.
    pub timeout: Duration,
    /// Force the remaining routes down when the timeout expires.
    pub shutdown_now_on_timeout: bool,
    pub shutdown_routes_in_reverse_order: bool,
    pub suppress_logging_on_timeout: bool,
    /// Log the remaining inflight exchanges at info instead of debug.
    pub log_inflight_exchanges_on_timeout: bool,
    /// Pause between two checks of the pending exchanges.
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            shutdown_now_on_timeout: true,
            shutdown_routes_in_reverse_order: true,
            suppress_logging_on_timeout: false,
            log_inflight_exchanges_on_timeout: true,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ShutdownConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "Shutdown poll interval must be a positive value.".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Flags shared between the shutdown strategy and the route pipelines.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    force: AtomicBool,
    stopping: AtomicBool,
    timeout_occurred: AtomicBool,
}

impl ShutdownSignal {
    /// New exchanges are rejected while this is set.
    pub fn is_force_shutdown(&self) -> bool {
        self.force.load(Ordering::Acquire)
    }

    pub fn set_force_shutdown(&self, force: bool) {
        self.force.store(force, Ordering::Release);
    }

    /// The engine is stopping.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::Release);
    }

    pub fn has_timeout_occurred(&self) -> bool {
        self.timeout_occurred.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeout_occurred(&self, occurred: bool) {
        self.timeout_occurred.store(occurred, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.set_force_shutdown(false);
        self.set_stopping(false);
        self.set_timeout_occurred(false);
    }
}

/// Shutdown strategy.
pub struct ShutdownStrategy {
    config: ShutdownConfig,
    signal: Arc<ShutdownSignal>,
    inflight: Arc<InflightRepository>,
}

impl ShutdownStrategy {
    pub fn new(
        config: ShutdownConfig,
        signal: Arc<ShutdownSignal>,
        inflight: Arc<InflightRepository>,
    ) -> Self {
        Self {
            config,
            signal,
            inflight,
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn signal(&self) -> &Arc<ShutdownSignal> {
        &self.signal
    }

    pub fn is_force_shutdown(&self) -> bool {
        self.signal.is_force_shutdown()
    }

    pub fn has_timeout_occurred(&self) -> bool {
        self.signal.has_timeout_occurred()
    }

    /// Lets a single route operation leave the engine accepting work again.
    pub(crate) fn clear_force_shutdown(&self) {
        self.signal.set_force_shutdown(false);
    }

    /// Gracefully shuts the routes down within the configured timeout.
    pub async fn shutdown(&self, routes: Vec<RouteStartupOrder>) -> Result<(), Error> {
        self.do_shutdown(routes, self.config.timeout, false, false, false)
            .await
            .map(|_| ())
    }

    pub async fn shutdown_with_timeout(
        &self,
        routes: Vec<RouteStartupOrder>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.do_shutdown(routes, timeout, false, false, false)
            .await
            .map(|_| ())
    }

    /// Like [`shutdown`](Self::shutdown), but forces the routes down on
    /// timeout regardless of `shutdown_now_on_timeout`.
    pub async fn shutdown_forced(&self, routes: Vec<RouteStartupOrder>) -> Result<(), Error> {
        self.do_shutdown(routes, self.config.timeout, false, false, true)
            .await
            .map(|_| ())
    }

    /// Gracefully suspends the routes.
    pub async fn suspend(&self, routes: Vec<RouteStartupOrder>) -> Result<(), Error> {
        self.do_shutdown(routes, self.config.timeout, true, false, false)
            .await
            .map(|_| ())
    }

    pub async fn suspend_with_timeout(
        &self,
        routes: Vec<RouteStartupOrder>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.do_shutdown(routes, timeout, true, false, false)
            .await
            .map(|_| ())
    }

    /// Shuts one route down. Returns `false` if the timeout expired and
    /// `abort_after_timeout` asked to give up instead of forcing.
    pub async fn shutdown_route(
        &self,
        route: RouteStartupOrder,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error> {
        self.do_shutdown(vec![route], timeout, false, abort_after_timeout, false)
            .await
    }

    async fn do_shutdown(
        &self,
        mut routes: Vec<RouteStartupOrder>,
        timeout: Duration,
        suspend_only: bool,
        abort_after_timeout: bool,
        force_shutdown: bool,
    ) -> Result<bool, Error> {
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        if routes.is_empty() {
            return Ok(true);
        }

        let started = Instant::now();
        sort_startup_order(&mut routes, self.config.shutdown_routes_in_reverse_order);
        info!(
            "Starting to graceful {} {} routes (timeout {:?})",
            if suspend_only { "suspend" } else { "shutdown" },
            routes.len(),
            timeout
        );

        self.signal.set_timeout_occurred(false);
        let token = CancellationToken::new();
        let task = ShutdownTask {
            routes: routes.clone(),
            suspend_only,
            abort_after_timeout,
            deadline: started + timeout,
            token: token.clone(),
            inflight: self.inflight.clone(),
            signal: self.signal.clone(),
            config: self.config.clone(),
        };
        let mut handle = tokio::spawn(task.run());

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                return Err(Error::Shutdown(error.to_string()));
            }
            Err(_) => {
                self.signal.set_timeout_occurred(true);

                if !force_shutdown && abort_after_timeout {
                    interrupt(&token, &mut handle).await;
                    warn!(
                        "Timeout occurred during graceful shutdown. Aborting the shutdown now. \
                         Notice: some resources may still be running as graceful shutdown did not complete successfully."
                    );
                    log_inflight_exchanges(
                        &self.inflight,
                        &routes,
                        self.config.log_inflight_exchanges_on_timeout,
                    );
                    return Ok(false);
                }

                if force_shutdown || self.config.shutdown_now_on_timeout {
                    // Set before interrupting so the task prepares with forced=true.
                    self.signal.set_force_shutdown(true);
                    interrupt(&token, &mut handle).await;
                    warn!(
                        "Timeout occurred during graceful shutdown. Forcing the routes to be shutdown now. \
                         Notice: some resources may still be running as graceful shutdown did not complete successfully."
                    );
                    log_inflight_exchanges(
                        &self.inflight,
                        &routes,
                        self.config.log_inflight_exchanges_on_timeout,
                    );
                    shutdown_routes_now(&routes).await;
                    for order in &routes {
                        prepare_route(
                            &order.route,
                            false,
                            true,
                            self.config.suppress_logging_on_timeout,
                        )
                        .await;
                    }
                } else {
                    interrupt(&token, &mut handle).await;
                    warn!(
                        "Timeout occurred during graceful shutdown. Will ignore shutting down the remainder routes. \
                         Notice: some resources may still be running as graceful shutdown did not complete successfully."
                    );
                    log_inflight_exchanges(
                        &self.inflight,
                        &routes,
                        self.config.log_inflight_exchanges_on_timeout,
                    );
                }
            }
        }

        info!(
            "Graceful {} of {} routes completed in {:?}",
            if suspend_only { "suspend" } else { "shutdown" },
            routes.len(),
            started.elapsed()
        );
        Ok(true)
    }
}

/// The graceful procedure, run on its own task.
struct ShutdownTask {
    routes: Vec<RouteStartupOrder>,
    suspend_only: bool,
    abort_after_timeout: bool,
    deadline: Instant,
    token: CancellationToken,
    inflight: Arc<InflightRepository>,
    signal: Arc<ShutdownSignal>,
    config: ShutdownConfig,
}

impl ShutdownTask {
    async fn run(self) {
        debug!(
            "There are {} routes to {}",
            self.routes.len(),
            if self.suspend_only { "suspend" } else { "shutdown" }
        );

        // Consumers stopped at the end, once the inflight exchanges drained.
        let mut deferred: Vec<Arc<Route>> = Vec::new();
        for order in &self.routes {
            let route = &order.route;
            trace!(
                "{} route: {} with options [{:?},{:?}]",
                if self.suspend_only { "Suspending" } else { "Shutting down" },
                route.id(),
                route.shutdown_route(),
                route.shutdown_running_task()
            );

            let mut shutdown = route.shutdown_route() != ShutdownRoute::Defer;
            let mut suspend = false;
            if shutdown {
                if let Some(aware) = route.consumer().shutdown_aware() {
                    shutdown = !aware.defer_shutdown(route.shutdown_running_task());
                }
                if shutdown && route.supports_suspension() {
                    suspend = true;
                }
            }

            if suspend {
                suspend_now(route).await;
                deferred.push(route.clone());
                debug!(
                    "Route: {} suspended and shutdown deferred, was consuming from: {}",
                    route.id(),
                    route.endpoint_uri()
                );
            } else if shutdown {
                shutdown_now(route).await;
                info!(
                    "Route: {} shutdown complete, was consuming from: {}",
                    route.id(),
                    route.endpoint_uri()
                );
            } else {
                deferred.push(route.clone());
                debug!(
                    "Route: {} {}",
                    route.id(),
                    if self.suspend_only {
                        "suspension deferred."
                    } else {
                        "shutdown deferred."
                    }
                );
            }
        }

        for order in &self.routes {
            for service in flatten_services(order.route.services()) {
                if let Some(aware) = service.as_shutdown_aware() {
                    prepare(aware, order.route.id(), self.suspend_only, false, false).await;
                }
            }
        }

        if !self.drain().await {
            return;
        }

        let suppress = self.config.suppress_logging_on_timeout;
        for route in &deferred {
            if let Some(aware) = route.consumer().shutdown_aware() {
                trace!("Route: {} preparing to shutdown.", route.id());
                let forced = self.signal.is_force_shutdown();
                prepare(aware, route.id(), self.suspend_only, forced, suppress).await;
                debug!("Route: {} preparing to shutdown complete.", route.id());
            }
        }

        for route in &deferred {
            if self.suspend_only {
                suspend_now(route).await;
                info!(
                    "Route: {} suspend complete, was consuming from: {}",
                    route.id(),
                    route.endpoint_uri()
                );
            } else {
                shutdown_now(route).await;
                info!(
                    "Route: {} shutdown complete, was consuming from: {}",
                    route.id(),
                    route.endpoint_uri()
                );
            }
        }

        for order in &self.routes {
            let forced = self.signal.is_force_shutdown();
            prepare_route(&order.route, self.suspend_only, forced, suppress).await;
        }
    }

    /// Waits until no exchange is pending. Returns `false` if interrupted
    /// with abort requested.
    async fn drain(&self) -> bool {
        loop {
            if self.token.is_cancelled() {
                return self.interrupted();
            }

            let mut size = 0;
            let mut per_route = Vec::new();
            for order in &self.routes {
                let id = order.route.id();
                let pending = self.inflight.size_of(id) + route_pending(&order.route);
                if pending > 0 {
                    trace!("{} inflight and pending exchanges for route: {}", pending, id);
                    per_route.push(format!("{} = {}", id, pending));
                    size += pending;
                }
            }
            if size == 0 {
                return true;
            }

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            info!(
                "Waiting as there are still {} inflight and pending exchanges to complete, timeout in {} seconds. Inflights per route: [{}]",
                size,
                remaining.as_secs(),
                per_route.join(", ")
            );
            log_inflight_exchanges(
                &self.inflight,
                &self.routes,
                self.config.log_inflight_exchanges_on_timeout,
            );

            tokio::select! {
                _ = self.token.cancelled() => {
                    return self.interrupted();
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    fn interrupted(&self) -> bool {
        if self.abort_after_timeout {
            warn!("Interrupted while waiting during graceful shutdown, will abort.");
            false
        } else {
            warn!("Interrupted while waiting during graceful shutdown, will force shutdown now.");
            true
        }
    }
}

/// Inflight exchanges of a route plus what its services hold, consumer
/// included.
fn route_pending(route: &Route) -> usize {
    let consumer = route
        .consumer()
        .shutdown_aware()
        .map(|aware| aware.pending_exchanges())
        .unwrap_or(0);
    consumer + pending_exchanges(route.services())
}

/// How long an interrupted shutdown task may take to wind down.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Cancels the shutdown task and waits briefly for it, so it does not
/// outlive the flags the caller resets afterwards.
async fn interrupt(token: &CancellationToken, handle: &mut JoinHandle<()>) {
    token.cancel();
    match tokio::time::timeout(INTERRUPT_GRACE, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!("Interrupted shutdown task failed: {}", error),
        Err(_) => debug!(
            "Interrupted shutdown task still running after {:?}, leaving it detached.",
            INTERRUPT_GRACE
        ),
    }
}

/// Stops every consumer immediately and marks the routes as forced.
async fn shutdown_routes_now(routes: &[RouteStartupOrder]) {
    for order in routes {
        let route = &order.route;
        let current = route.shutdown_running_task();
        if current != ShutdownRunningTask::CompleteCurrentTaskOnly {
            debug!(
                "Changing shutdown running task from {:?} to {:?} on route {} to shutdown faster",
                current,
                ShutdownRunningTask::CompleteCurrentTaskOnly,
                route.id()
            );
            route.set_shutdown_running_task(ShutdownRunningTask::CompleteCurrentTaskOnly);
        }
        route.set_forced_shutdown(true);
        shutdown_now(route).await;
    }
}

async fn shutdown_now(route: &Route) {
    trace!("Shutting down: {}", route.endpoint_uri());
    if let Err(error) = route.consumer().stop().await {
        warn!(
            "Error occurred while shutting down route: {}. This error will be ignored: {}",
            route.id(),
            error
        );
    }
    trace!("Shutdown complete for: {}", route.endpoint_uri());
}

/// Suspends the consumer, or stops it if it cannot be suspended.
async fn suspend_now(route: &Route) {
    trace!("Suspending: {}", route.endpoint_uri());
    let result = if route.supports_suspension() {
        route.consumer().suspend().await
    } else {
        route.consumer().stop().await
    };
    if let Err(error) = result {
        warn!(
            "Error occurred while suspending route: {}. This error will be ignored: {}",
            route.id(),
            error
        );
    }
    trace!("Suspend complete for: {}", route.endpoint_uri());
}

/// Prepares the consumer and every child service of the route.
async fn prepare_route(route: &Route, suspend_only: bool, forced: bool, suppress: bool) {
    if let Some(aware) = route.consumer().shutdown_aware() {
        prepare(aware, route.id(), suspend_only, forced, suppress).await;
    }
    for service in flatten_services(route.services()) {
        if let Some(aware) = service.as_shutdown_aware() {
            prepare(aware, route.id(), suspend_only, forced, suppress).await;
        }
    }
}

async fn prepare(
    aware: &dyn ShutdownAware,
    route_id: &str,
    suspend_only: bool,
    forced: bool,
    suppress: bool,
) {
    trace!("Preparing (forced: {}) shutdown on route: {}", forced, route_id);
    if let Err(error) = aware.prepare_shutdown(suspend_only, forced).await {
        if suppress {
            trace!(
                "Error during prepare shutdown on route {}. This error will be ignored: {}",
                route_id,
                error
            );
        } else {
            warn!(
                "Error during prepare shutdown on route {}. This error will be ignored: {}",
                route_id,
                error
            );
        }
    }
}

/// Logs the inflight exchanges of the given routes only.
fn log_inflight_exchanges(
    inflight: &InflightRepository,
    routes: &[RouteStartupOrder],
    info_level: bool,
) {
    let ids: Vec<String> = routes
        .iter()
        .map(|order| order.route.id().to_owned())
        .collect();
    let filtered = inflight.browse_from_routes(&ids);
    if filtered.is_empty() {
        return;
    }

    let mut message = format!("There are {} inflight exchanges:", filtered.len());
    for exchange in &filtered {
        message.push_str(&format!(
            "\n\tInflightExchange: [exchangeId={}, fromRouteId={}, atRouteId={}, nodeId={}, elapsed={:?}]",
            exchange.exchange_id,
            exchange.from_route_id.as_deref().unwrap_or("-"),
            exchange.at_route_id.as_deref().unwrap_or("-"),
            exchange.node_id.as_deref().unwrap_or("-"),
            exchange.elapsed()
        ));
    }
    if info_level {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}
