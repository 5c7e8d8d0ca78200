// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Supervising route controller
//!
//! A route controller that takes over the startup of the routes it
//! supervises. A supervised route whose start fails is not fatal to the
//! engine: it is handed to a [`BackOffTimer`] that keeps retrying the start
//! until it succeeds, the backoff is exhausted, or an operator starts or
//! stops the route by hand.
//!
//! Routes are classified once, when they are added:
//!
//! * A route with auto startup explicitly disabled is left alone.
//! * A route matching `exclude_routes`, or not matching `include_routes`,
//!   is controlled but not supervised. It starts with the engine, and a
//!   failure fails the engine start.
//! * Every other route is supervised.
//!
//! Patterns are matched against the route id and its `from` endpoint uri
//! (see [`crate::pattern`]).
//!

use crate::{
    backoff::{BackOff, BackOffStatus, BackOffTask, BackOffTaskState, BackOffTimer},
    controller::RouteController,
    error::{Phase, RouteError},
    pattern::match_any,
    route::lock,
    summary::{log_summary, supervised_startup_summary, StartupSummaryLevel, SummaryLine},
    Error, LifecycleOrchestrator, Route, RouteStatus,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

/// Result of one restart attempt, `true` to retry.
type Attempt = BoxFuture<'static, bool>;

/// Supervising controller configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisingConfig {
    /// Comma separated patterns of the routes to supervise.
    pub include_routes: Option<String>,
    /// Comma separated patterns of the routes not to supervise. Wins over
    /// `include_routes`.
    pub exclude_routes: Option<String>,
    /// Restart attempts that may run at the same time.
    pub thread_pool_size: usize,
    /// Delay before the supervised routes are first started.
    pub initial_delay: Duration,
    pub backoff_delay: Duration,
    pub backoff_max_delay: Option<Duration>,
    pub backoff_max_elapsed_time: Option<Duration>,
    pub backoff_max_attempts: Option<u64>,
    pub backoff_multiplier: f64,
    /// Record the last restart error as an unhealthy route error once the
    /// backoff is exhausted.
    pub unhealthy_on_exhausted: bool,
}

impl Default for SupervisingConfig {
    fn default() -> Self {
        Self {
            include_routes: None,
            exclude_routes: None,
            thread_pool_size: 1,
            initial_delay: Duration::ZERO,
            backoff_delay: Duration::from_secs(2),
            backoff_max_delay: None,
            backoff_max_elapsed_time: None,
            backoff_max_attempts: None,
            backoff_multiplier: 1.0,
            unhealthy_on_exhausted: false,
        }
    }
}

impl SupervisingConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.thread_pool_size == 0 {
            return Err(Error::InvalidConfiguration(
                "Supervising thread pool size must be at least 1.".to_owned(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfiguration(format!(
                "Backoff multiplier must be a finite value of at least 1.0, got {}.",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    pub fn to_backoff(&self) -> BackOff {
        BackOff {
            delay: self.backoff_delay,
            max_delay: self.backoff_max_delay,
            max_elapsed_time: self.backoff_max_elapsed_time,
            max_attempts: self.backoff_max_attempts,
            multiplier: self.backoff_multiplier,
        }
    }

    fn patterns(patterns: &Option<String>) -> Option<&str> {
        patterns
            .as_deref()
            .map(str::trim)
            .filter(|patterns| !patterns.is_empty())
    }
}

struct RouteHolder {
    order: u32,
    index: u64,
    route: Arc<Route>,
}

#[derive(Default)]
struct Holders {
    routes: Vec<RouteHolder>,
    non_supervised: BTreeSet<String>,
    next_index: u64,
}

impl Holders {
    fn add(&mut self, route: &Arc<Route>, supervised: bool) -> bool {
        if self.routes.iter().any(|holder| holder.route.id() == route.id()) {
            return false;
        }
        self.next_index += 1;
        self.routes.push(RouteHolder {
            order: route.startup_order(),
            index: self.next_index,
            route: route.clone(),
        });
        self.routes.sort_by_key(|holder| (holder.order, holder.index));
        if !supervised {
            self.non_supervised.insert(route.id().to_owned());
        }
        true
    }

    fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|holder| holder.route.id() == id)
            .map(|holder| holder.route.clone())
    }

    fn remove(&mut self, id: &str) {
        self.routes.retain(|holder| holder.route.id() != id);
        self.non_supervised.remove(id);
    }
}

/// Supervising route controller.
pub struct SupervisingRouteController {
    me: Weak<SupervisingRouteController>,
    orchestrator: Arc<LifecycleOrchestrator>,
    config: SupervisingConfig,
    summary_level: StartupSummaryLevel,
    backoff: BackOff,
    timer: BackOffTimer,
    lock: Mutex<()>,
    holders: StdMutex<Holders>,
    restarting: DashMap<String, Arc<BackOffTask>>,
    exhausted: DashMap<String, Arc<BackOffTask>>,
    exceptions: DashMap<String, Error>,
    engine_started: AtomicBool,
}

impl SupervisingRouteController {
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator>,
        config: SupervisingConfig,
        summary_level: StartupSummaryLevel,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let backoff = config.to_backoff();
        let timer = BackOffTimer::new("supervising-route-controller", config.thread_pool_size);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            orchestrator,
            config,
            summary_level,
            backoff,
            timer,
            lock: Mutex::new(()),
            holders: StdMutex::new(Holders::default()),
            restarting: DashMap::new(),
            exhausted: DashMap::new(),
            exceptions: DashMap::new(),
            engine_started: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SupervisingConfig {
        &self.config
    }

    /// Backoff applied to every supervised route.
    pub fn backoff(&self) -> &BackOff {
        &self.backoff
    }

    /// Routes known to the controller, supervised or not, in startup order.
    pub fn controlled_routes(&self) -> Vec<Arc<Route>> {
        lock(&self.holders)
            .routes
            .iter()
            .map(|holder| holder.route.clone())
            .collect()
    }

    /// Routes with a pending restart.
    pub fn restarting_routes(&self) -> Vec<Arc<Route>> {
        self.controlled_routes()
            .into_iter()
            .filter(|route| self.restarting.contains_key(route.id()))
            .collect()
    }

    /// Routes whose restart backoff was exhausted.
    pub fn exhausted_routes(&self) -> Vec<Arc<Route>> {
        self.controlled_routes()
            .into_iter()
            .filter(|route| self.exhausted.contains_key(route.id()))
            .collect()
    }

    /// Ids of the controlled routes that are not supervised.
    pub fn non_controlled_route_ids(&self) -> BTreeSet<String> {
        lock(&self.holders).non_supervised.clone()
    }

    /// State of the restart task of the route, pending or exhausted.
    pub fn restarting_route_state(&self, id: &str) -> Option<BackOffTaskState> {
        self.restarting
            .get(id)
            .map(|task| task.snapshot())
            .or_else(|| self.exhausted.get(id).map(|task| task.snapshot()))
    }

    /// Last error of a failed restart of the route.
    pub fn restart_exception(&self, id: &str) -> Option<Error> {
        self.exceptions.get(id).map(|error| error.clone())
    }

    fn controlled(&self, id: &str) -> Option<Arc<Route>> {
        lock(&self.holders).get(id)
    }

    fn is_supervised(&self, id: &str) -> bool {
        !lock(&self.holders).non_supervised.contains(id)
    }

    /// Stopped routes known to the controller, split by supervision.
    fn stopped_routes(&self, supervised: bool) -> Vec<Arc<Route>> {
        let holders = lock(&self.holders);
        holders
            .routes
            .iter()
            .filter(|holder| holder.route.status().is_stopped())
            .filter(|holder| !holders.non_supervised.contains(holder.route.id()) == supervised)
            .map(|holder| holder.route.clone())
            .collect()
    }

    /// Hands the route over to a manual operation. Cancels the pending
    /// restart and forgets the previous restart outcome.
    fn release(&self, id: &str) -> bool {
        self.exceptions.remove(id);
        self.exhausted.remove(id);
        match self.restarting.remove(id) {
            Some((_, task)) => {
                debug!("Cancelling restart task for route: {}", id);
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Schedules restarts of the route unless one is pending already.
    fn supervise(&self, route: &Arc<Route>) {
        route.set_supervised(true);
        let id = route.id().to_owned();
        self.restarting.entry(id.clone()).or_insert_with(|| {
            debug!("Supervising route: {} with back-off: {}", id, self.backoff);
            let attempt_me = self.me.clone();
            let attempt_id = id.clone();
            let complete_me = self.me.clone();
            let complete_id = id.clone();
            self.timer.schedule(
                &id,
                self.backoff.clone(),
                move |task: Arc<BackOffTask>| -> Attempt {
                    let me = attempt_me.clone();
                    let id = attempt_id.clone();
                    async move {
                        match me.upgrade() {
                            Some(controller) => controller.restart(&id, &task).await,
                            None => false,
                        }
                    }
                    .boxed()
                },
                move |task: Arc<BackOffTask>| -> BoxFuture<'static, ()> {
                    async move {
                        if let Some(controller) = complete_me.upgrade() {
                            controller.restart_completed(&complete_id, task).await;
                        }
                    }
                    .boxed()
                },
            )
        });
    }

    async fn restart(&self, id: &str, task: &BackOffTask) -> bool {
        let _guard = self.lock.lock().await;
        if !task.is_active() {
            return false;
        }
        let attempt = task.attempts();
        info!("Restarting route: {} attempt: {}", id, attempt);
        match self.orchestrator.start_route(id).await {
            Ok(()) => {
                info!("Route: {} started after {} attempts", id, attempt);
                false
            }
            Err(error) => {
                info!(
                    "Failed restarting route: {} attempt: {} due: {}",
                    id, attempt, error
                );
                self.exceptions.insert(id.to_owned(), error);
                true
            }
        }
    }

    async fn restart_completed(&self, id: &str, task: Arc<BackOffTask>) {
        let _guard = self.lock.lock().await;
        if task.status() == BackOffStatus::Exhausted {
            if let Some(route) = self.controlled(id) {
                let status = route.status();
                if status.is_stopped() || status == RouteStatus::Stopping {
                    warn!(
                        "Restarting route: {} is exhausted after {} attempts. No more attempts will be made and the route is no longer supervised by this route controller and remains as stopped.",
                        id,
                        task.attempts()
                    );
                    route.set_supervised(false);
                    self.exhausted.insert(id.to_owned(), task.clone());
                    if self.config.unhealthy_on_exhausted {
                        if let Some(error) = self.restart_exception(id) {
                            route.set_last_error(Some(RouteError::unhealthy(Phase::Start, error)));
                        }
                    }
                }
            }
        }
        self.restarting
            .remove_if(id, |_, current| Arc::ptr_eq(current, &task));
    }

    /// Starts a controlled route by hand. A failed start is handed to the
    /// backoff and still returned to the caller.
    async fn start_controlled(&self, route: &Arc<Route>) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        self.release(route.id());
        let result = self.orchestrator.start_route(route.id()).await;
        if let Err(error) = &result {
            debug!("Route {} failed to start, supervising it: {}", route.id(), error);
            self.supervise(route);
        }
        result
    }

    async fn start_non_supervised_routes(&self) -> Result<(), Error> {
        for route in self.stopped_routes(false) {
            debug!("Starting non-supervised route {}", route.id());
            self.orchestrator.start_route(route.id()).await?;
        }
        Ok(())
    }

    async fn start_supervised_routes(&self) {
        let routes = self.stopped_routes(true);
        debug!("Starting {} supervised routes", routes.len());
        for route in routes {
            if let Err(error) = self.start_controlled(&route).await {
                debug!("Supervised route {} did not start: {}", route.id(), error);
            }
        }
        self.log_startup_summary();
    }

    /// Lines of the startup summary: started routes, then the restarting
    /// and the exhausted ones.
    pub fn startup_summary(&self) -> Vec<String> {
        let routes = self.controlled_routes();
        let mut lines: Vec<SummaryLine> = routes
            .iter()
            .filter(|route| route.status().is_started())
            .map(|route| SummaryLine::of(route, "Started"))
            .collect();
        lines.extend(
            routes
                .iter()
                .filter(|route| self.restarting.contains_key(route.id()))
                .map(|route| {
                    SummaryLine::of(route, "Restarting").with_detail(self.backoff.to_string())
                }),
        );
        lines.extend(
            routes
                .iter()
                .filter(|route| self.exhausted.contains_key(route.id()))
                .map(|route| SummaryLine::of(route, "Exhausted")),
        );
        supervised_startup_summary(self.summary_level, &lines)
    }

    fn log_startup_summary(&self) {
        log_summary(&self.startup_summary());
    }

    async fn stop_controlled<F, Fut, T>(&self, id: &str, stop: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let Some(route) = self.controlled(id) else {
            return stop().await;
        };
        let _guard = self.lock.lock().await;
        self.release(id);
        debug!("Route {} has been requested to stop", id);
        route.set_supervised(false);
        stop().await
    }
}

#[async_trait]
impl RouteController for SupervisingRouteController {
    async fn start_route(&self, id: &str) -> Result<(), Error> {
        match self.controlled(id) {
            Some(route) => self.start_controlled(&route).await,
            None => self.orchestrator.start_route(id).await,
        }
    }

    async fn stop_route(&self, id: &str) -> Result<(), Error> {
        self.stop_controlled(id, || self.orchestrator.stop_route(id))
            .await
    }

    async fn stop_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        self.stop_controlled(id, || self.orchestrator.stop_route_with_timeout(id, timeout))
            .await
    }

    async fn stop_route_with_abort(
        &self,
        id: &str,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, Error> {
        self.stop_controlled(id, || {
            self.orchestrator
                .stop_route_with_abort(id, timeout, abort_after_timeout)
        })
        .await
    }

    async fn suspend_route(&self, id: &str) -> Result<(), Error> {
        self.stop_controlled(id, || self.orchestrator.suspend_route(id))
            .await
    }

    async fn suspend_route_with_timeout(&self, id: &str, timeout: Duration) -> Result<(), Error> {
        self.stop_controlled(id, || {
            self.orchestrator.suspend_route_with_timeout(id, timeout)
        })
        .await
    }

    /// Resuming a controlled route is a manual start.
    async fn resume_route(&self, id: &str) -> Result<(), Error> {
        match self.controlled(id) {
            Some(route) => self.start_controlled(&route).await,
            None => self.orchestrator.resume_route(id).await,
        }
    }

    fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.orchestrator.route_status(id)
    }

    fn is_supervising(&self) -> bool {
        true
    }

    async fn on_route_added(&self, route: &Arc<Route>) -> Result<(), Error> {
        let id = route.id();
        if route.explicit_auto_startup() == Some(false) {
            info!(
                "Route: {} will not be supervised (Reason: has explicit auto-startup flag set to false)",
                id
            );
            return Ok(());
        }

        let uri = route.endpoint_uri();
        let matches = |patterns: &str| match_any(id, patterns) || match_any(uri, patterns);
        let excluded = SupervisingConfig::patterns(&self.config.exclude_routes)
            .is_some_and(|patterns| matches(patterns));
        let included = SupervisingConfig::patterns(&self.config.include_routes)
            .map_or(true, |patterns| matches(patterns));

        let engine_started = self.engine_started.load(Ordering::Acquire);
        if excluded || !included {
            debug!("Route: {} excluded from being supervised", id);
            if !lock(&self.holders).add(route, false) {
                return Ok(());
            }
            route.set_auto_startup(true);
            if engine_started {
                return self.orchestrator.start_route(id).await;
            }
            return Ok(());
        }

        if !lock(&self.holders).add(route, true) {
            return Ok(());
        }
        route.set_auto_startup(false);
        route.set_supervised(true);

        if !engine_started {
            debug!("Engine is not yet started. Deferring starting route: {}", id);
            return Ok(());
        }
        debug!("Engine is already started: attempt to start route {}", id);
        let delay = self.config.initial_delay;
        if delay.is_zero() {
            if let Err(error) = self.start_controlled(route).await {
                debug!("Route {} did not start: {}", id, error);
            }
            return Ok(());
        }
        debug!("Route {} will be started in {:?}", id, delay);
        let me = self.me.clone();
        let route = route.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = me.upgrade() {
                if let Err(error) = controller.start_controlled(&route).await {
                    debug!("Route {} did not start: {}", route.id(), error);
                }
            }
        });
        Ok(())
    }

    async fn on_route_removed(&self, route: &Arc<Route>) {
        let _guard = self.lock.lock().await;
        self.release(route.id());
        lock(&self.holders).remove(route.id());
    }

    /// Starts the non-supervised routes, failing on the first error, then
    /// the supervised ones, whose failures are retried.
    async fn on_engine_started(&self) -> Result<(), Error> {
        if self.engine_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.start_non_supervised_routes().await?;

        let delay = self.config.initial_delay;
        if delay.is_zero() {
            self.start_supervised_routes().await;
            return Ok(());
        }
        debug!("Supervised routes will be started in {:?}", delay);
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = me.upgrade() {
                controller.start_supervised_routes().await;
            }
        });
        Ok(())
    }

    /// Cancels every pending restart.
    async fn on_engine_stopping(&self) {
        let _guard = self.lock.lock().await;
        self.engine_started.store(false, Ordering::Release);
        self.restarting.retain(|id, task| {
            debug!("Cancelling restart task for route: {}", id);
            task.cancel();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{Consumer, Endpoint, Engine, EngineConfig, Exchange, Pipeline, RouteDefinition, Service};

    use tracing_test::traced_test;

    struct Down;

    #[async_trait]
    impl Service for Down {
        async fn start(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    impl Endpoint for Down {
        fn uri(&self) -> &str {
            "kafka:down"
        }

        fn create_consumer(&self, _pipeline: Arc<Pipeline>) -> Result<Arc<dyn Consumer>, Error> {
            Ok(Arc::new(DownConsumer))
        }
    }

    struct DownConsumer;

    #[async_trait]
    impl Service for DownConsumer {
        async fn start(&self) -> Result<(), Error> {
            Err(Error::Functional("broker unreachable".to_owned()))
        }

        async fn stop(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    impl Consumer for DownConsumer {
        fn endpoint_uri(&self) -> &str {
            "kafka:down"
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_start_is_supervised() {
        let engine = Engine::new(EngineConfig {
            supervising: Some(SupervisingConfig {
                backoff_delay: Duration::from_millis(100),
                backoff_max_attempts: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        let processor = Arc::new(|_exchange: &mut Exchange| -> Result<(), Error> { Ok(()) });
        engine
            .add_route(RouteDefinition::new("down", Arc::new(Down), processor))
            .await
            .unwrap();

        engine.start().await.unwrap();
        assert!(logs_contain("Supervising route: down with back-off: BackOff[delay=100ms"));
        assert!(logs_contain("Routes startup (total:1 started:0 restarting:1 exhausted:0)"));
        assert!(logs_contain("Restarting down (kafka:down) with BackOff[delay=100ms"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let supervising = engine.supervising_controller().unwrap();
        let state = supervising.restarting_route_state("down").unwrap();
        assert_eq!(state.status, BackOffStatus::Exhausted);
        assert_eq!(state.attempts, 2);
        assert!(!logs_contain("Routes startup (total:1 started:1)"));
    }

    #[test]
    fn test_default_config() {
        let config = SupervisingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.thread_pool_size, 1);
        let backoff = config.to_backoff();
        assert_eq!(backoff.delay, Duration::from_secs(2));
        assert_eq!(backoff.multiplier, 1.0);
        assert_eq!(backoff.max_attempts, None);
    }

    #[test]
    fn test_invalid_config() {
        let config = SupervisingConfig {
            thread_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
        let config = SupervisingConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
        let config = SupervisingConfig {
            backoff_multiplier: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        assert_eq!(SupervisingConfig::patterns(&Some("  ".to_owned())), None);
        assert_eq!(SupervisingConfig::patterns(&Some("a*".to_owned())), Some("a*"));
        assert_eq!(SupervisingConfig::patterns(&None), None);
    }
}
