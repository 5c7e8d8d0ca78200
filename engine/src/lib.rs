// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Rush Routes Engine
//!
//! The lifecycle and graceful shutdown core of an integration routing
//! engine. A *route* consumes messages from one input endpoint and runs each
//! of them, as an [`Exchange`], through a per-message [`Pipeline`]. This
//! crate does not move messages itself. It decides when routes start, stop,
//! suspend and resume, in which order, and how in-flight work is drained
//! before a route goes down.
//!
//! ## Overview
//!
//! The engine is made of a few cooperating parts:
//!
//! - [`RouteRegistry`]: the table of registered routes, safe to read while
//!   messages are being processed.
//! - [`LifecycleOrchestrator`]: drives single routes through their states.
//!   All lifecycle operations are serialized by one coarse lock.
//! - [`ShutdownStrategy`]: the two phase graceful shutdown, with a drain
//!   loop bounded by a timeout and escalation to a forced shutdown.
//! - [`SupervisingRouteController`]: an alternative route controller that
//!   retries failed route starts with a backoff instead of failing the
//!   engine start.
//! - [`Pipeline`]: the ordered chain of [`Advice`]s wrapped around the
//!   processor of a route.
//! - [`Engine`]: the facade owning all of the above.
//!
//! ## Route lifecycle
//!
//! ```text
//!            start                suspend
//!  Stopped ---------> Started -------------> Suspended
//!     ^                 |  ^                    |
//!     |      stop       |  |       resume       |
//!     +-----------------+  +--------------------+
//! ```
//!
//! A failed transition leaves the route `Failed`, which counts as stopped:
//! it can be started or removed again. The failure is kept as the route's
//! [`RouteError`], tagged with the [`Phase`] it happened in.
//!
//! Routes start in ascending startup order and stop in the reverse order,
//! unless configured otherwise. Within a route the consumer is started last
//! and stopped first, so no message enters a route whose services are not
//! ready.
//!
//! ## Graceful shutdown
//!
//! Stopping a route first silences the consumers that can go right away,
//! then waits for the in-flight exchanges of the routes to drain, then
//! stops the deferred consumers. If the drain does not finish in time the
//! remaining routes are forced down, and new exchanges are rejected with
//! [`Error::RejectedExecution`] while the force flag is set.
//!
//! ## Getting started
//!
//! ```ignore
//! use engine::{Engine, EngineConfig, Exchange, RouteDefinition, Error};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!
//!     // `timer` is any `Endpoint` implementation able to create a consumer.
//!     let definition = RouteDefinition::new(
//!         "ticks",
//!         timer,
//!         Arc::new(|exchange: &mut Exchange| -> Result<(), Error> {
//!             exchange.set_header("seen", "true");
//!             Ok(())
//!         }),
//!     )
//!     .startup_order(10);
//!     engine.add_route(definition).await?;
//!
//!     engine.start().await?;
//!     // ...
//!     engine.stop().await
//! }
//! ```
//!
//! ## Supervision
//!
//! With [`EngineConfig::supervising`] set, the engine hands route startup to
//! the [`SupervisingRouteController`]. Include and exclude patterns (see
//! [`pattern`]) choose the supervised routes. A supervised route that fails
//! to start is retried by a [`BackOffTimer`] until it starts, the backoff is
//! exhausted, or an operator takes over by starting or stopping it by hand.
//!

mod advice;
mod backoff;
mod config;
mod controller;
mod engine;
mod error;
mod exchange;
mod inflight;
mod orchestrator;
pub mod pattern;
mod pipeline;
mod registry;
mod route;
mod service;
mod shutdown;
mod summary;
mod supervising;

pub use advice::{
    Debugger, DebuggerAdvice, InflightAdvice, MessageHistoryAdvice, RoutePolicy,
    RoutePolicyAdvice, TracingAdvice, UnitOfWorkAdvice, DEBUGGER_ORDER, HIGHEST,
    INFLIGHT_ORDER, LOWEST, MESSAGE_HISTORY_ORDER, ROUTE_POLICY_ORDER, TRACING_ORDER,
    UNIT_OF_WORK_ORDER,
};
pub use crate::backoff::{
    BackOff, BackOffCursor, BackOffStatus, BackOffTask, BackOffTaskState, BackOffTimer,
};
pub use config::{EngineConfig, PipelineConfig};
pub use controller::{DefaultRouteController, RouteController};
pub use engine::{Engine, EngineBuilder, EngineStatus};
pub use error::{Error, Phase, RouteError};
pub use exchange::{Exchange, MessageHistory, OnCompletion};
pub use inflight::{InflightExchange, InflightRepository};
pub use orchestrator::{LifecycleOrchestrator, DEFAULT_STARTUP_ORDER_BASE};
pub use pipeline::{Advice, AdviceState, AsyncCallback, Pipeline, PipelineBuilder, Processor};
pub use registry::RouteRegistry;
pub use route::{
    sort_startup_order, CreatedBy, Route, RouteDefinition, RouteStartupOrder, RouteStatus,
    ShutdownRoute, ShutdownRunningTask,
};
pub use service::{
    flatten_services, pending_exchanges, Consumer, ConsumerCapabilities, Endpoint,
    ManagedConsumer, Service, ServiceState, ShutdownAware, Suspendable,
};
pub use shutdown::{ShutdownConfig, ShutdownSignal, ShutdownStrategy};
pub use summary::{StartupSummaryLevel, SummaryLine};
pub use supervising::{SupervisingConfig, SupervisingRouteController};
