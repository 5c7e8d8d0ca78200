// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Core library for the Rush Routes framework.
//! Provides the lifecycle orchestration of message routes: ordered startup,
//! graceful shutdown with in-flight draining, and supervised restarts of
//! routes that fail to start.
//! Route consumers, endpoints and processors are supplied by the host through
//! the traits re-exported here.

pub use engine::{
    pattern, Advice, AdviceState, AsyncCallback, BackOff, BackOffStatus, BackOffTask,
    BackOffTaskState, BackOffTimer, Consumer, CreatedBy, Debugger, DefaultRouteController,
    Endpoint, Engine, EngineBuilder, EngineConfig, EngineStatus, Error, Exchange,
    InflightExchange, InflightRepository, LifecycleOrchestrator, Phase, Pipeline,
    PipelineBuilder, PipelineConfig, Processor, Route, RouteController, RouteDefinition,
    RouteError, RoutePolicy, RouteRegistry, RouteStatus, Service, ShutdownAware, ShutdownConfig,
    ShutdownRoute, ShutdownRunningTask, ShutdownSignal, ShutdownStrategy, StartupSummaryLevel,
    Suspendable, SupervisingConfig, SupervisingRouteController,
};
