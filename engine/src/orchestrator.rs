// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Lifecycle orchestrator
//!
//! Drives routes through their states. Every public operation takes one
//! process-wide lock, then calls private transitions that receive the
//! locked [`Lifecycle`] state explicitly instead of locking again. This is
//! what lets a suspend fall back to a stop, or an aborted stop restart the
//! route, without a reentrant lock.
//!

use crate::{
    advice::{
        Debugger, DebuggerAdvice, InflightAdvice, MessageHistoryAdvice, RoutePolicyAdvice,
        TracingAdvice, UnitOfWorkAdvice,
    },
    config::PipelineConfig,
    error::{Phase, RouteError},
    route::{sort_startup_order, RouteDefinition, RouteStartupOrder},
    service::{ManagedConsumer, Service},
    Error, InflightRepository, PipelineBuilder, Route, RouteRegistry, RouteStatus,
    ShutdownStrategy,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// First startup order handed out to routes without an explicit one.
pub const DEFAULT_STARTUP_ORDER_BASE: u32 = 1000;

/// State guarded by the lifecycle lock.
pub(crate) struct Lifecycle {
    next_order: u32,
    orders: BTreeMap<u32, String>,
    started_endpoints: HashSet<String>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            next_order: DEFAULT_STARTUP_ORDER_BASE,
            orders: BTreeMap::new(),
            started_endpoints: HashSet::new(),
        }
    }

    /// Next free automatic order. Values taken by explicit orders are skipped.
    fn next_auto_order(&mut self) -> u32 {
        loop {
            let order = self.next_order;
            self.next_order += 1;
            if !self.orders.contains_key(&order) {
                return order;
            }
        }
    }
}

/// Lifecycle orchestrator.
pub struct LifecycleOrchestrator {
    registry: Arc<RouteRegistry>,
    inflight: Arc<InflightRepository>,
    shutdown: Arc<ShutdownStrategy>,
    pipeline: PipelineConfig,
    debugger: Option<Arc<dyn Debugger>>,
    lifecycle: Mutex<Lifecycle>,
}

impl LifecycleOrchestrator {
    pub fn new(
        registry: Arc<RouteRegistry>,
        inflight: Arc<InflightRepository>,
        shutdown: Arc<ShutdownStrategy>,
        pipeline: PipelineConfig,
        debugger: Option<Arc<dyn Debugger>>,
    ) -> Self {
        Self {
            registry,
            inflight,
            shutdown,
            pipeline,
            debugger,
            lifecycle: Mutex::new(Lifecycle::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn shutdown_strategy(&self) -> &Arc<ShutdownStrategy> {
        &self.shutdown
    }

    pub fn route(&self, id: &str) -> Result<Arc<Route>, Error> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::RouteNotFound(id.to_owned()))
    }

    pub fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.registry.get(id).map(|route| route.status())
    }

    /// Routes paired with their order, ascending.
    pub fn startup_orders(&self) -> Vec<RouteStartupOrder> {
        let mut orders: Vec<RouteStartupOrder> = self
            .registry
            .all()
            .into_iter()
            .map(RouteStartupOrder::new)
            .collect();
        sort_startup_order(&mut orders, false);
        orders
    }

    /// Builds and registers a route. The route is not started.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<Arc<Route>, Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.registry.get(definition.id()).is_some() {
            return Err(Error::RouteExists(definition.id().to_owned()));
        }

        let order = match definition.startup_order {
            Some(order) => {
                if let Some(existing) = lifecycle.orders.get(&order) {
                    return Err(Error::StartupOrderInUse {
                        order,
                        route: definition.id().to_owned(),
                        existing: existing.clone(),
                    });
                }
                order
            }
            None => lifecycle.next_auto_order(),
        };

        let pipeline = Arc::new(self.build_pipeline(&definition));
        let consumer = definition.from.create_consumer(pipeline.clone())?;
        let route = Arc::new(Route::new(
            definition,
            order,
            ManagedConsumer::new(consumer),
            pipeline,
        ));
        lifecycle.orders.insert(order, route.id().to_owned());
        for policy in route.policies() {
            policy.on_init(&route);
        }
        self.registry.add(route.clone());
        debug!(
            "Route {} added with startup order {}, consuming from: {}",
            route.id(),
            order,
            route.endpoint_uri()
        );
        Ok(route)
    }

    fn build_pipeline(&self, definition: &RouteDefinition) -> crate::Pipeline {
        let id = definition.id();
        let signal = self.shutdown.signal().clone();
        let mut builder = PipelineBuilder::new(id, definition.processor.clone(), signal.clone())
            .pooled(self.pipeline.pooled, self.pipeline.pool_capacity)
            .advice(Arc::new(UnitOfWorkAdvice::new(id)))
            .advice(Arc::new(InflightAdvice::new(id, self.inflight.clone())));
        if !definition.policies.is_empty() {
            builder = builder.advice(Arc::new(RoutePolicyAdvice::new(
                id,
                definition.policies.clone(),
                signal,
            )));
        }
        if self.pipeline.message_history {
            builder = builder.advice(Arc::new(MessageHistoryAdvice::new(
                id,
                &format!("{}-processor", id),
                self.inflight.clone(),
            )));
        }
        if self.pipeline.tracing {
            builder = builder.advice(Arc::new(TracingAdvice::new(id)));
        }
        if let Some(debugger) = &self.debugger {
            builder = builder.advice(Arc::new(DebuggerAdvice::new(id, debugger.clone())));
        }
        builder.advices(definition.advices.clone()).build()
    }

    pub async fn start_route(&self, id: &str) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let route = self.route(id)?;
        route.set_last_error(None);
        let result = self.do_start_route(&mut lifecycle, &route).await;
        record(&route, Phase::Start, result)
    }

    /// Stops the route gracefully within the configured timeout.
    pub async fn stop_route(&self, id: &str) -> Result<(), Error> {
        self.stop_route_with_timeout(id, self.shutdown.timeout()).await
    }

    pub async fn stop_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        self.stop_route_with_abort(id, timeout, false).await.map(|_| ())
    }

    /// Stops the route. Returns `false` if the timeout expired and the stop
    /// was aborted, in which case the route is started again.
    pub async fn stop_route_with_abort(
        &self,
        id: &str,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let route = self.route(id)?;
        route.set_last_error(None);
        let result = self
            .do_stop_route(&mut lifecycle, &route, timeout, abort_after_timeout)
            .await;
        self.release_force_shutdown();
        record(&route, Phase::Stop, result)
    }

    pub async fn suspend_route(&self, id: &str) -> Result<(), Error> {
        self.suspend_route_with_timeout(id, self.shutdown.timeout()).await
    }

    /// Suspends the route, or stops it if its consumer cannot be suspended.
    pub async fn suspend_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let route = self.route(id)?;
        route.set_last_error(None);
        let result = self.do_suspend_route(&mut lifecycle, &route, timeout).await;
        self.release_force_shutdown();
        record(&route, Phase::Suspend, result)
    }

    /// Resumes the route, or starts it if its consumer cannot be suspended.
    pub async fn resume_route(&self, id: &str) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let route = self.route(id)?;
        route.set_last_error(None);
        let result = self.do_resume_route(&mut lifecycle, &route).await;
        record(&route, Phase::Resume, result)
    }

    /// Removes a stopped route and releases the endpoints only it used.
    /// Returns `false` if the route is not stopped.
    pub async fn remove_route(&self, id: &str) -> Result<bool, Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let route = self.route(id)?;
        route.set_last_error(None);
        if !route.status().is_stopped() {
            debug!("Route {} is {} and cannot be removed.", id, route.status());
            return Ok(false);
        }
        let result = self.do_remove_route(&mut lifecycle, &route).await;
        record(&route, Phase::Remove, result).map(|_| true)
    }

    /// Starts every auto startup route that is not running, in ascending
    /// startup order. Stops at the first failure.
    pub async fn start_all_routes(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        for order in self.startup_orders() {
            let route = order.route;
            if !route.is_auto_startup() || !route.status().is_stopped() {
                continue;
            }
            route.set_last_error(None);
            let result = self.do_start_route(&mut lifecycle, &route).await;
            record(&route, Phase::Start, result)?;
        }
        Ok(())
    }

    /// Gracefully shuts down every running route, then stops their services
    /// and the endpoints. Returns the routes that were shut down.
    pub async fn stop_all_routes(&self) -> Result<Vec<Arc<Route>>, Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut orders: Vec<RouteStartupOrder> = self
            .startup_orders()
            .into_iter()
            .filter(|order| !order.route.status().is_stopped())
            .collect();
        for order in &orders {
            order.route.set_status(RouteStatus::Stopping);
        }

        if let Err(error) = self.shutdown.shutdown(orders.clone()).await {
            for order in &orders {
                order.route.set_status(RouteStatus::Failed);
                order
                    .route
                    .set_last_error(Some(RouteError::new(Phase::Shutdown, error.clone())));
            }
            return Err(error);
        }

        sort_startup_order(
            &mut orders,
            self.shutdown.config().shutdown_routes_in_reverse_order,
        );
        let mut first_error = None;
        for order in &orders {
            let route = &order.route;
            match stop_route_services(route).await {
                Ok(()) => {
                    route.set_status(RouteStatus::Stopped);
                    for policy in route.policies() {
                        policy.on_stop(route);
                    }
                }
                Err(error) => {
                    route.set_status(RouteStatus::Failed);
                    route.set_last_error(Some(RouteError::new(Phase::Shutdown, error.clone())));
                    first_error.get_or_insert(error);
                }
            }
        }

        self.stop_endpoints(&mut lifecycle).await;
        match first_error {
            Some(error) => Err(error),
            None => Ok(orders.into_iter().map(|order| order.route).collect()),
        }
    }

    /// Leaves the pipelines accepting work after a single route was forced
    /// down, unless the whole engine is stopping.
    fn release_force_shutdown(&self) {
        if !self.shutdown.signal().is_stopping() {
            self.shutdown.clear_force_shutdown();
        }
    }

    pub(crate) async fn do_start_route(
        &self,
        lifecycle: &mut Lifecycle,
        route: &Arc<Route>,
    ) -> Result<(), Error> {
        match route.status() {
            RouteStatus::Started => return Ok(()),
            RouteStatus::Suspended => return resume_suspended(route).await,
            _ => {}
        }

        debug!("Starting route {}.", route.id());
        route.set_forced_shutdown(false);
        route.set_status(RouteStatus::Starting);
        match self.start_route_services(lifecycle, route).await {
            Ok(()) => {
                route.set_status(RouteStatus::Started);
                for policy in route.policies() {
                    policy.on_start(route);
                }
                info!(
                    "Route: {} started and consuming from: {}",
                    route.id(),
                    route.endpoint_uri()
                );
                Ok(())
            }
            Err(error) => {
                route.set_status(RouteStatus::Failed);
                Err(error)
            }
        }
    }

    /// Endpoints first, then child services, then the consumer. On failure
    /// whatever the route started is stopped again.
    async fn start_route_services(
        &self,
        lifecycle: &mut Lifecycle,
        route: &Route,
    ) -> Result<(), Error> {
        for endpoint in route.endpoints() {
            if lifecycle.started_endpoints.contains(endpoint.uri()) {
                continue;
            }
            endpoint
                .start()
                .await
                .map_err(|error| Error::Start(route.id().to_owned(), error.to_string()))?;
            lifecycle.started_endpoints.insert(endpoint.uri().to_owned());
        }

        let mut started: Vec<&Arc<dyn Service>> = Vec::new();
        let mut failure = None;
        for service in route.services() {
            match service.start().await {
                Ok(()) => started.push(service),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Err(error) = route.consumer().start().await {
                failure = Some(error);
            }
        }

        let Some(error) = failure else {
            return Ok(());
        };
        warn!("Error starting route {}: {}", route.id(), error);
        for service in started.into_iter().rev() {
            if let Err(error) = service.stop().await {
                debug!("Error stopping service {} after failed start: {}", service.name(), error);
            }
        }
        Err(Error::Start(route.id().to_owned(), error.to_string()))
    }

    pub(crate) async fn do_stop_route(
        &self,
        _lifecycle: &mut Lifecycle,
        route: &Arc<Route>,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error> {
        if route.status().is_stopped() {
            return Ok(true);
        }
        route.set_status(RouteStatus::Stopping);

        let completed = match self
            .shutdown
            .shutdown_route(RouteStartupOrder::new(route.clone()), timeout, abort_after_timeout)
            .await
        {
            Ok(completed) => completed,
            Err(error) => {
                route.set_status(RouteStatus::Failed);
                return Err(error);
            }
        };

        if !completed {
            warn!("Stopping route {} was aborted, starting it again.", route.id());
            // Child services were only prepared for shutdown, never stopped.
            route.set_status(RouteStatus::Starting);
            if let Err(error) = route.consumer().start().await {
                route.set_status(RouteStatus::Failed);
                return Err(Error::Start(route.id().to_owned(), error.to_string()));
            }
            route.set_status(RouteStatus::Started);
            return Ok(false);
        }

        if let Err(error) = stop_route_services(route).await {
            route.set_status(RouteStatus::Failed);
            return Err(error);
        }
        route.set_status(RouteStatus::Stopped);
        for policy in route.policies() {
            policy.on_stop(route);
        }
        info!(
            "Route: {} is stopped, was consuming from: {}",
            route.id(),
            route.endpoint_uri()
        );
        Ok(true)
    }

    async fn do_suspend_route(
        &self,
        lifecycle: &mut Lifecycle,
        route: &Arc<Route>,
        timeout: Duration,
    ) -> Result<(), Error> {
        if !route.supports_suspension() {
            debug!("Route {} does not support suspension, stopping it instead.", route.id());
            return self
                .do_stop_route(lifecycle, route, timeout, false)
                .await
                .map(|_| ());
        }
        if route.status() != RouteStatus::Started {
            return Ok(());
        }

        route.set_status(RouteStatus::Suspending);
        if let Err(error) = self
            .shutdown
            .suspend_with_timeout(vec![RouteStartupOrder::new(route.clone())], timeout)
            .await
        {
            route.set_status(RouteStatus::Failed);
            return Err(error);
        }
        route.set_status(RouteStatus::Suspended);
        for policy in route.policies() {
            policy.on_suspend(route);
        }
        info!(
            "Route: {} is suspended, was consuming from: {}",
            route.id(),
            route.endpoint_uri()
        );
        Ok(())
    }

    async fn do_resume_route(
        &self,
        lifecycle: &mut Lifecycle,
        route: &Arc<Route>,
    ) -> Result<(), Error> {
        if !route.supports_suspension() || route.status().is_stopped() {
            return self.do_start_route(lifecycle, route).await;
        }
        if route.status() != RouteStatus::Suspended {
            return Ok(());
        }
        resume_suspended(route).await
    }

    async fn do_remove_route(&self, lifecycle: &mut Lifecycle, route: &Arc<Route>) -> Result<(), Error> {
        // Endpoints in use by each route, this one included.
        let mut usage: HashMap<String, usize> = HashMap::new();
        for other in self.registry.all() {
            let uris: HashSet<&str> = other.endpoints().iter().map(|endpoint| endpoint.uri()).collect();
            for uri in uris {
                *usage.entry(uri.to_owned()).or_insert(0) += 1;
            }
        }

        self.registry.remove(route.id());
        lifecycle.orders.remove(&route.startup_order());
        self.inflight.remove_route(route.id());
        for policy in route.policies() {
            policy.on_remove(route);
        }

        let mut released = HashSet::new();
        for endpoint in route.endpoints() {
            let uri = endpoint.uri();
            if usage.get(uri).copied().unwrap_or(0) > 1 || !released.insert(uri.to_owned()) {
                continue;
            }
            debug!("Removing: {} which was only in use by route: {}", uri, route.id());
            if lifecycle.started_endpoints.remove(uri) {
                endpoint
                    .stop()
                    .await
                    .map_err(|error| Error::Remove(route.id().to_owned(), error.to_string()))?;
            }
        }
        info!("Route: {} removed.", route.id());
        Ok(())
    }

    async fn stop_endpoints(&self, lifecycle: &mut Lifecycle) {
        let mut stopped = HashSet::new();
        for route in self.registry.all() {
            for endpoint in route.endpoints() {
                let uri = endpoint.uri();
                if !lifecycle.started_endpoints.contains(uri) || !stopped.insert(uri.to_owned()) {
                    continue;
                }
                if let Err(error) = endpoint.stop().await {
                    warn!("Error stopping endpoint {}. This error will be ignored: {}", uri, error);
                }
            }
        }
        lifecycle.started_endpoints.clear();
    }
}

async fn resume_suspended(route: &Route) -> Result<(), Error> {
    route.set_status(RouteStatus::Starting);
    if let Err(error) = route.consumer().resume().await {
        route.set_status(RouteStatus::Failed);
        return Err(Error::Resume(route.id().to_owned(), error.to_string()));
    }
    route.set_status(RouteStatus::Started);
    for policy in route.policies() {
        policy.on_resume(route);
    }
    info!(
        "Route: {} resumed and consuming from: {}",
        route.id(),
        route.endpoint_uri()
    );
    Ok(())
}

/// Consumer first, then child services in reverse order.
async fn stop_route_services(route: &Route) -> Result<(), Error> {
    route
        .consumer()
        .stop()
        .await
        .map_err(|error| Error::Stop(route.id().to_owned(), error.to_string()))?;
    let mut first_error = None;
    for service in route.services().iter().rev() {
        if let Err(error) = service.stop().await {
            warn!("Error stopping service {} of route {}: {}", service.name(), route.id(), error);
            first_error.get_or_insert(Error::Stop(route.id().to_owned(), error.to_string()));
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Records a failed transition as the route's last error.
fn record<T>(route: &Route, phase: Phase, result: Result<T, Error>) -> Result<T, Error> {
    if let Err(error) = &result {
        route.set_last_error(Some(RouteError::new(phase, error.clone())));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_orders_skip_explicit_ones() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.orders.insert(1001, "explicit".to_owned());
        assert_eq!(lifecycle.next_auto_order(), 1000);
        assert_eq!(lifecycle.next_auto_order(), 1002);
        assert_eq!(lifecycle.next_auto_order(), 1003);
    }
}
