// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Built-in advices
//!
//! The advices every route pipeline is assembled from, plus the
//! [`RoutePolicy`] and [`Debugger`] hooks they call into.
//!

use crate::{
    exchange::MessageHistory,
    pipeline::{Advice, AdviceState},
    shutdown::ShutdownSignal,
    Error, Exchange, InflightRepository, Route,
};

use tracing::{debug, trace, warn};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Highest precedence, runs `before` first.
pub const HIGHEST: i32 = i32::MIN;
/// Lowest precedence, runs `before` last, right before the processor.
pub const LOWEST: i32 = i32::MAX;

pub const UNIT_OF_WORK_ORDER: i32 = HIGHEST + 1000;
pub const INFLIGHT_ORDER: i32 = HIGHEST + 2000;
pub const ROUTE_POLICY_ORDER: i32 = HIGHEST + 3000;
pub const MESSAGE_HISTORY_ORDER: i32 = HIGHEST + 4000;
pub const TRACING_ORDER: i32 = LOWEST - 1;
pub const DEBUGGER_ORDER: i32 = LOWEST;

/// Callbacks around the lifecycle of a route and its exchanges.
pub trait RoutePolicy: Send + Sync {
    fn on_init(&self, _route: &Route) {}

    fn on_start(&self, _route: &Route) {}

    fn on_stop(&self, _route: &Route) {}

    fn on_suspend(&self, _route: &Route) {}

    fn on_resume(&self, _route: &Route) {}

    fn on_remove(&self, _route: &Route) {}

    /// Errors are logged and ignored.
    fn on_exchange_begin(&self, _route_id: &str, _exchange: &Exchange) -> Result<(), Error> {
        Ok(())
    }

    /// Not called while the engine is stopping. Errors are logged and ignored.
    fn on_exchange_done(&self, _route_id: &str, _exchange: &Exchange) -> Result<(), Error> {
        Ok(())
    }
}

/// Host supplied debugger, called right around the processor.
pub trait Debugger: Send + Sync {
    fn before_process(&self, route_id: &str, exchange: &Exchange);

    fn after_process(&self, route_id: &str, exchange: &Exchange, taken: Duration);
}

fn started(state: Option<AdviceState>) -> Option<Instant> {
    state
        .and_then(|state| state.downcast::<Instant>().ok())
        .map(|instant| *instant)
}

/// Opens a unit of work on exchanges that have none, and completes it.
pub struct UnitOfWorkAdvice {
    route_id: String,
}

impl UnitOfWorkAdvice {
    pub fn new(route_id: &str) -> Self {
        Self {
            route_id: route_id.to_owned(),
        }
    }
}

impl Advice for UnitOfWorkAdvice {
    fn name(&self) -> &str {
        "unit-of-work"
    }

    fn order(&self) -> i32 {
        UNIT_OF_WORK_ORDER
    }

    fn has_state(&self) -> bool {
        true
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        if exchange.from_route_id().is_none() {
            exchange.set_from_route_id(&self.route_id);
        }
        if exchange.has_unit_of_work() {
            return Ok(None);
        }
        exchange.set_unit_of_work(true);
        Ok(Some(Box::new(true)))
    }

    fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>) {
        // Only the advice that opened the unit of work completes it.
        if state.is_some() {
            trace!("Unit of work done for exchange {}.", exchange.id());
            exchange.done();
            exchange.set_unit_of_work(false);
        }
    }
}

/// Keeps the inflight repository up to date.
pub struct InflightAdvice {
    route_id: String,
    repository: Arc<InflightRepository>,
}

impl InflightAdvice {
    pub fn new(route_id: &str, repository: Arc<InflightRepository>) -> Self {
        Self {
            route_id: route_id.to_owned(),
            repository,
        }
    }
}

impl Advice for InflightAdvice {
    fn name(&self) -> &str {
        "inflight"
    }

    fn order(&self) -> i32 {
        INFLIGHT_ORDER
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        self.repository.add(exchange, &self.route_id);
        Ok(None)
    }

    fn after(&self, exchange: &mut Exchange, _state: Option<AdviceState>) {
        self.repository.remove(exchange, &self.route_id);
    }
}

/// Notifies the route policies of each exchange.
pub struct RoutePolicyAdvice {
    route_id: String,
    policies: Vec<Arc<dyn RoutePolicy>>,
    signal: Arc<ShutdownSignal>,
}

impl RoutePolicyAdvice {
    pub fn new(
        route_id: &str,
        policies: Vec<Arc<dyn RoutePolicy>>,
        signal: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            route_id: route_id.to_owned(),
            policies,
            signal,
        }
    }
}

impl Advice for RoutePolicyAdvice {
    fn name(&self) -> &str {
        "route-policy"
    }

    fn order(&self) -> i32 {
        ROUTE_POLICY_ORDER
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        for policy in &self.policies {
            if let Err(error) = policy.on_exchange_begin(&self.route_id, exchange) {
                warn!(
                    "Error occurred during on_exchange_begin on route {}. This error will be ignored: {}",
                    self.route_id, error
                );
            }
        }
        Ok(None)
    }

    fn after(&self, exchange: &mut Exchange, _state: Option<AdviceState>) {
        // A policy must not restart a consumer while the engine is stopping.
        if self.signal.is_stopping() {
            return;
        }
        for policy in &self.policies {
            if let Err(error) = policy.on_exchange_done(&self.route_id, exchange) {
                warn!(
                    "Error occurred during on_exchange_done on route {}. This error will be ignored: {}",
                    self.route_id, error
                );
            }
        }
    }
}

/// Records the route and node each exchange passed through.
pub struct MessageHistoryAdvice {
    route_id: String,
    node_id: String,
    repository: Arc<InflightRepository>,
}

impl MessageHistoryAdvice {
    pub fn new(route_id: &str, node_id: &str, repository: Arc<InflightRepository>) -> Self {
        Self {
            route_id: route_id.to_owned(),
            node_id: node_id.to_owned(),
            repository,
        }
    }
}

impl Advice for MessageHistoryAdvice {
    fn name(&self) -> &str {
        "message-history"
    }

    fn order(&self) -> i32 {
        MESSAGE_HISTORY_ORDER
    }

    fn has_state(&self) -> bool {
        true
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        self.repository.set_node(exchange.id(), &self.node_id);
        Ok(Some(Box::new(Instant::now())))
    }

    fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>) {
        let elapsed = started(state)
            .map(|instant| instant.elapsed())
            .unwrap_or_default();
        exchange.add_history(MessageHistory {
            route_id: self.route_id.clone(),
            node_id: self.node_id.clone(),
            elapsed,
        });
    }
}

/// Logs each exchange and the time its processing took.
pub struct TracingAdvice {
    route_id: String,
}

impl TracingAdvice {
    pub fn new(route_id: &str) -> Self {
        Self {
            route_id: route_id.to_owned(),
        }
    }
}

impl Advice for TracingAdvice {
    fn name(&self) -> &str {
        "tracing"
    }

    fn order(&self) -> i32 {
        TRACING_ORDER
    }

    fn has_state(&self) -> bool {
        true
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        debug!("Route {} processing exchange {}.", self.route_id, exchange.id());
        Ok(Some(Box::new(Instant::now())))
    }

    fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>) {
        let taken = started(state)
            .map(|instant| instant.elapsed())
            .unwrap_or_default();
        match exchange.exception() {
            Some(error) => debug!(
                "Route {} failed exchange {} in {:?}: {}",
                self.route_id,
                exchange.id(),
                taken,
                error
            ),
            None => debug!(
                "Route {} processed exchange {} in {:?}.",
                self.route_id,
                exchange.id(),
                taken
            ),
        }
    }
}

/// Hands each exchange to a [`Debugger`].
pub struct DebuggerAdvice {
    route_id: String,
    debugger: Arc<dyn Debugger>,
}

impl DebuggerAdvice {
    pub fn new(route_id: &str, debugger: Arc<dyn Debugger>) -> Self {
        Self {
            route_id: route_id.to_owned(),
            debugger,
        }
    }
}

impl Advice for DebuggerAdvice {
    fn name(&self) -> &str {
        "debugger"
    }

    fn order(&self) -> i32 {
        DEBUGGER_ORDER
    }

    fn has_state(&self) -> bool {
        true
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        self.debugger.before_process(&self.route_id, exchange);
        Ok(Some(Box::new(Instant::now())))
    }

    fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>) {
        let taken = started(state)
            .map(|instant| instant.elapsed())
            .unwrap_or_default();
        self.debugger.after_process(&self.route_id, exchange, taken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::PipelineBuilder;

    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl RoutePolicy for Recording {
        fn on_exchange_begin(&self, route_id: &str, _exchange: &Exchange) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("begin:{}", route_id));
            Err(Error::Functional("ignored".to_owned()))
        }

        fn on_exchange_done(&self, route_id: &str, _exchange: &Exchange) -> Result<(), Error> {
            self.calls.lock().unwrap().push(format!("done:{}", route_id));
            Ok(())
        }
    }

    fn processor() -> Arc<dyn crate::Processor> {
        Arc::new(|exchange: &mut Exchange| -> Result<(), Error> {
            exchange.set_body("processed");
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_unit_of_work_runs_completions_and_tracks_inflight() {
        let repository = Arc::new(InflightRepository::new());
        let signal = Arc::new(ShutdownSignal::default());
        let pipeline = PipelineBuilder::new("foo", processor(), signal)
            .advice(Arc::new(InflightAdvice::new("foo", repository.clone())))
            .advice(Arc::new(UnitOfWorkAdvice::new("foo")))
            .advice(Arc::new(MessageHistoryAdvice::new("foo", "to1", repository.clone())))
            .build();

        let completed = Arc::new(Mutex::new(None));
        let mut exchange = Exchange::new();
        let slot = completed.clone();
        exchange.add_on_completion(move |exchange| {
            *slot.lock().unwrap() = exchange.body().map(str::to_owned);
        });

        let exchange = pipeline.process_and_wait(exchange).await;
        assert_eq!(exchange.from_route_id(), Some("foo"));
        assert!(!exchange.has_unit_of_work());
        assert_eq!(exchange.history().len(), 1);
        assert_eq!(exchange.history()[0].node_id, "to1");
        assert_eq!(completed.lock().unwrap().as_deref(), Some("processed"));
        assert_eq!(repository.size_of("foo"), 0);
    }

    #[tokio::test]
    async fn test_policy_errors_are_ignored_and_done_skipped_when_stopping() {
        let policy = Arc::new(Recording::default());
        let signal = Arc::new(ShutdownSignal::default());
        let pipeline = PipelineBuilder::new("foo", processor(), signal.clone())
            .advice(Arc::new(RoutePolicyAdvice::new(
                "foo",
                vec![policy.clone()],
                signal.clone(),
            )))
            .build();

        let exchange = pipeline.process_and_wait(Exchange::new()).await;
        assert!(!exchange.is_failed());

        signal.set_stopping(true);
        pipeline.process_and_wait(Exchange::new()).await;

        assert_eq!(
            *policy.calls.lock().unwrap(),
            vec!["begin:foo", "done:foo", "begin:foo"]
        );
    }
}
