// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Routes
//!
//! A [`RouteDefinition`] describes a route before it is registered. The
//! orchestrator builds it into a [`Route`], which carries the runtime state.
//! Only the orchestrator mutates a route's status.
//!

use crate::{
    advice::RoutePolicy,
    error::RouteError,
    pipeline::{Advice, Processor},
    service::{Endpoint, ManagedConsumer, Service},
    Pipeline,
};

use serde::{Deserialize, Serialize};

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// Route status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Suspending,
    Suspended,
    Stopping,
    Failed,
}

impl RouteStatus {
    /// Stopped or failed, so the route can be started or removed.
    pub fn is_stopped(&self) -> bool {
        matches!(self, RouteStatus::Stopped | RouteStatus::Failed)
    }

    pub fn is_started(&self) -> bool {
        matches!(self, RouteStatus::Started)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, RouteStatus::Suspended)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RouteStatus::Starting,
            2 => RouteStatus::Started,
            3 => RouteStatus::Suspending,
            4 => RouteStatus::Suspended,
            5 => RouteStatus::Stopping,
            6 => RouteStatus::Failed,
            _ => RouteStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RouteStatus::Stopped => 0,
            RouteStatus::Starting => 1,
            RouteStatus::Started => 2,
            RouteStatus::Suspending => 3,
            RouteStatus::Suspended => 4,
            RouteStatus::Stopping => 5,
            RouteStatus::Failed => 6,
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a route takes part in a graceful shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownRoute {
    #[default]
    Default,
    /// Keep running until the other routes drained their in-flight work.
    Defer,
}

/// How much pending work a consumer completes before shutting down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownRunningTask {
    #[default]
    CompleteCurrentTaskOnly,
    CompleteAllTasks,
}

/// Origin of a route. Only used for summary output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatedBy {
    #[default]
    Plain,
    Kamelet,
    RouteTemplate,
    RestDsl,
}

impl fmt::Display for CreatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CreatedBy::Plain => "plain",
            CreatedBy::Kamelet => "kamelet",
            CreatedBy::RouteTemplate => "route-template",
            CreatedBy::RestDsl => "rest-dsl",
        };
        write!(f, "{}", name)
    }
}

/// Route definition.
pub struct RouteDefinition {
    pub(crate) id: String,
    pub(crate) group: Option<String>,
    pub(crate) startup_order: Option<u32>,
    pub(crate) shutdown_route: ShutdownRoute,
    pub(crate) shutdown_running_task: ShutdownRunningTask,
    pub(crate) auto_startup: Option<bool>,
    pub(crate) configuration_id: Option<String>,
    pub(crate) created_by: CreatedBy,
    pub(crate) from: Arc<dyn Endpoint>,
    pub(crate) to: Vec<Arc<dyn Endpoint>>,
    pub(crate) services: Vec<Arc<dyn Service>>,
    pub(crate) policies: Vec<Arc<dyn RoutePolicy>>,
    pub(crate) advices: Vec<Arc<dyn Advice>>,
    pub(crate) processor: Arc<dyn Processor>,
}

impl RouteDefinition {
    /// Creates a route consuming from `from` and processing with `processor`.
    pub fn new(
        id: &str,
        from: Arc<dyn Endpoint>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            group: None,
            startup_order: None,
            shutdown_route: ShutdownRoute::Default,
            shutdown_running_task: ShutdownRunningTask::CompleteCurrentTaskOnly,
            auto_startup: None,
            configuration_id: None,
            created_by: CreatedBy::Plain,
            from,
            to: Vec::new(),
            services: Vec::new(),
            policies: Vec::new(),
            advices: Vec::new(),
            processor,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_owned());
        self
    }

    pub fn startup_order(mut self, order: u32) -> Self {
        self.startup_order = Some(order);
        self
    }

    pub fn shutdown_route(mut self, shutdown_route: ShutdownRoute) -> Self {
        self.shutdown_route = shutdown_route;
        self
    }

    pub fn shutdown_running_task(
        mut self,
        running_task: ShutdownRunningTask,
    ) -> Self {
        self.shutdown_running_task = running_task;
        self
    }

    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = Some(auto_startup);
        self
    }

    pub fn configuration_id(mut self, configuration_id: &str) -> Self {
        self.configuration_id = Some(configuration_id.to_owned());
        self
    }

    pub fn created_by(mut self, created_by: CreatedBy) -> Self {
        self.created_by = created_by;
        self
    }

    /// Adds an endpoint the route produces to.
    pub fn to(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.to.push(endpoint);
        self
    }

    /// Adds a child service started before and stopped after the consumer.
    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn advice(mut self, advice: Arc<dyn Advice>) -> Self {
        self.advices.push(advice);
        self
    }
}

impl fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("id", &self.id)
            .field("from", &self.from.uri())
            .field("startup_order", &self.startup_order)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A registered route.
pub struct Route {
    id: String,
    group: Option<String>,
    startup_order: u32,
    shutdown_route: ShutdownRoute,
    complete_all_tasks: AtomicBool,
    explicit_auto_startup: Option<bool>,
    auto_startup: AtomicBool,
    configuration_id: Option<String>,
    created_by: CreatedBy,
    endpoint: Arc<dyn Endpoint>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    consumer: ManagedConsumer,
    services: Vec<Arc<dyn Service>>,
    policies: Vec<Arc<dyn RoutePolicy>>,
    pipeline: Arc<Pipeline>,
    status: AtomicU8,
    forced: AtomicBool,
    supervised: AtomicBool,
    last_error: Mutex<Option<RouteError>>,
}

impl Route {
    pub(crate) fn new(
        definition: RouteDefinition,
        startup_order: u32,
        consumer: ManagedConsumer,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        let mut endpoints = vec![definition.from.clone()];
        endpoints.extend(definition.to);
        Self {
            id: definition.id,
            group: definition.group,
            startup_order,
            shutdown_route: definition.shutdown_route,
            complete_all_tasks: AtomicBool::new(
                definition.shutdown_running_task
                    == ShutdownRunningTask::CompleteAllTasks,
            ),
            explicit_auto_startup: definition.auto_startup,
            auto_startup: AtomicBool::new(
                definition.auto_startup.unwrap_or(true),
            ),
            configuration_id: definition.configuration_id,
            created_by: definition.created_by,
            endpoint: definition.from,
            endpoints,
            consumer,
            services: definition.services,
            policies: definition.policies,
            pipeline,
            status: AtomicU8::new(RouteStatus::Stopped.as_u8()),
            forced: AtomicBool::new(false),
            supervised: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn startup_order(&self) -> u32 {
        self.startup_order
    }

    pub fn shutdown_route(&self) -> ShutdownRoute {
        self.shutdown_route
    }

    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        if self.complete_all_tasks.load(Ordering::Acquire) {
            ShutdownRunningTask::CompleteAllTasks
        } else {
            ShutdownRunningTask::CompleteCurrentTaskOnly
        }
    }

    pub(crate) fn set_shutdown_running_task(
        &self,
        running_task: ShutdownRunningTask,
    ) {
        self.complete_all_tasks.store(
            running_task == ShutdownRunningTask::CompleteAllTasks,
            Ordering::Release,
        );
    }

    /// Auto startup as written in the definition, if it was set at all.
    pub fn explicit_auto_startup(&self) -> Option<bool> {
        self.explicit_auto_startup
    }

    pub fn is_auto_startup(&self) -> bool {
        self.auto_startup.load(Ordering::Acquire)
    }

    pub(crate) fn set_auto_startup(&self, auto_startup: bool) {
        self.auto_startup.store(auto_startup, Ordering::Release);
    }

    pub fn configuration_id(&self) -> Option<&str> {
        self.configuration_id.as_deref()
    }

    pub fn created_by(&self) -> CreatedBy {
        self.created_by
    }

    /// The endpoint the route consumes from.
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn endpoint_uri(&self) -> &str {
        self.endpoint.uri()
    }

    /// Every endpoint the route uses, input first.
    pub fn endpoints(&self) -> &[Arc<dyn Endpoint>] {
        &self.endpoints
    }

    pub fn consumer(&self) -> &ManagedConsumer {
        &self.consumer
    }

    pub fn supports_suspension(&self) -> bool {
        self.consumer.capabilities().suspendable
    }

    /// Child services, without the consumer.
    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    pub fn policies(&self) -> &[Arc<dyn RoutePolicy>] {
        &self.policies
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn status(&self) -> RouteStatus {
        RouteStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: RouteStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// True if the last shutdown of the route was forced.
    pub fn is_forced_shutdown(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    pub(crate) fn set_forced_shutdown(&self, forced: bool) {
        self.forced.store(forced, Ordering::Release);
    }

    /// True if the supervising controller starts this route.
    pub fn is_supervised(&self) -> bool {
        self.supervised.load(Ordering::Acquire)
    }

    pub(crate) fn set_supervised(&self, supervised: bool) {
        self.supervised.store(supervised, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<RouteError> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<RouteError>) {
        *lock(&self.last_error) = error;
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("startup_order", &self.startup_order)
            .field("status", &self.status())
            .finish()
    }
}

/// A route paired with its order, computed for one start or stop pass.
#[derive(Clone, Debug)]
pub struct RouteStartupOrder {
    pub order: u32,
    pub route: Arc<Route>,
}

impl RouteStartupOrder {
    pub fn new(route: Arc<Route>) -> Self {
        Self {
            order: route.startup_order(),
            route,
        }
    }
}

/// Sorts by startup order, reversed on request.
pub fn sort_startup_order(orders: &mut [RouteStartupOrder], reverse: bool) {
    if reverse {
        orders.sort_by(|a, b| b.order.cmp(&a.order));
    } else {
        orders.sort_by(|a, b| a.order.cmp(&b.order));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_atomic() {
        for status in [
            RouteStatus::Stopped,
            RouteStatus::Starting,
            RouteStatus::Started,
            RouteStatus::Suspending,
            RouteStatus::Suspended,
            RouteStatus::Stopping,
            RouteStatus::Failed,
        ] {
            assert_eq!(RouteStatus::from_u8(status.as_u8()), status);
        }
        assert!(RouteStatus::Failed.is_stopped());
        assert!(!RouteStatus::Suspended.is_stopped());
    }
}
