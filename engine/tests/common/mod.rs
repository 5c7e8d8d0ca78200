// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use engine::{
    Consumer, Endpoint, EngineConfig, Error, Exchange, Pipeline, Processor, RouteDefinition,
    Service, ShutdownAware, Suspendable,
};

use async_trait::async_trait;
use tokio::time::Instant;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Shared, ordered record of lifecycle calls.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`, with the prefix removed.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(prefix).map(str::to_owned))
            .collect()
    }
}

/// Capabilities of the consumer created by a [`TestEndpoint`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConsumerKind {
    Plain,
    Suspendable,
    /// Suspendable, and always reports this many pending exchanges.
    Pending(usize),
}

/// Endpoint recording its own start and stop, and creating a recording
/// consumer.
pub struct TestEndpoint {
    uri: String,
    kind: ConsumerKind,
    log: CallLog,
    starts: AtomicUsize,
    stops: AtomicUsize,
    /// Consumer starts left to fail.
    failures: Arc<AtomicUsize>,
    consumer_starts: Arc<Mutex<Vec<Instant>>>,
}

impl TestEndpoint {
    pub fn new(uri: &str, log: &CallLog) -> Arc<Self> {
        Self::with_kind(uri, ConsumerKind::Plain, log)
    }

    pub fn with_kind(uri: &str, kind: ConsumerKind, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_owned(),
            kind,
            log: log.clone(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            failures: Arc::new(AtomicUsize::new(0)),
            consumer_starts: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Makes the next `count` consumer starts fail.
    pub fn fail_starts(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// When each consumer start was attempted, failed ones included.
    pub fn consumer_starts(&self) -> Vec<Instant> {
        self.consumer_starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Service for TestEndpoint {
    fn name(&self) -> &str {
        &self.uri
    }

    async fn start(&self) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("endpoint-start:{}", self.uri));
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("endpoint-stop:{}", self.uri));
        Ok(())
    }
}

impl Endpoint for TestEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_consumer(&self, pipeline: Arc<Pipeline>) -> Result<Arc<dyn Consumer>, Error> {
        Ok(Arc::new(TestConsumer {
            uri: self.uri.clone(),
            kind: self.kind,
            log: self.log.clone(),
            failures: self.failures.clone(),
            starts: self.consumer_starts.clone(),
            pipeline,
        }))
    }
}

/// Consumer recording `start:`, `stop:`, `suspend:` and `resume:` calls.
pub struct TestConsumer {
    uri: String,
    kind: ConsumerKind,
    log: CallLog,
    failures: Arc<AtomicUsize>,
    starts: Arc<Mutex<Vec<Instant>>>,
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl Service for TestConsumer {
    async fn start(&self) -> Result<(), Error> {
        self.starts.lock().unwrap().push(Instant::now());
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            self.log.push(format!("failed-start:{}", self.uri));
            return Err(Error::Functional(format!("{} is not reachable", self.uri)));
        }
        self.log.push(format!("start:{}", self.uri));
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.log.push(format!("stop:{}", self.uri));
        Ok(())
    }

    fn as_shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        match self.kind {
            ConsumerKind::Pending(_) => Some(self),
            _ => None,
        }
    }
}

#[async_trait]
impl Suspendable for TestConsumer {
    async fn suspend(&self) -> Result<(), Error> {
        self.log.push(format!("suspend:{}", self.uri));
        Ok(())
    }

    async fn resume(&self) -> Result<(), Error> {
        self.log.push(format!("resume:{}", self.uri));
        Ok(())
    }
}

impl ShutdownAware for TestConsumer {
    fn pending_exchanges(&self) -> usize {
        match self.kind {
            ConsumerKind::Pending(pending) => pending,
            _ => 0,
        }
    }
}

impl Consumer for TestConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        match self.kind {
            ConsumerKind::Plain => None,
            _ => Some(self),
        }
    }
}

/// Child service counting its starts and stops, and recording the
/// shutdown hooks it receives.
#[derive(Default)]
pub struct CountingService {
    starts: AtomicUsize,
    stops: AtomicUsize,
    events: CallLog,
}

impl CountingService {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// `prepare:<forced>` and `stop` entries, in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.entries()
    }
}

#[async_trait]
impl Service for CountingService {
    async fn start(&self) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.events.push("stop".to_owned());
        Ok(())
    }

    fn as_shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        Some(self)
    }
}

#[async_trait]
impl ShutdownAware for CountingService {
    async fn prepare_shutdown(&self, _suspend_only: bool, forced: bool) -> Result<(), Error> {
        self.events.push(format!("prepare:{}", forced));
        Ok(())
    }
}

/// Processor that does nothing.
pub fn noop() -> Arc<dyn Processor> {
    Arc::new(|_exchange: &mut Exchange| -> Result<(), Error> { Ok(()) })
}

pub fn route(id: &str, endpoint: &Arc<TestEndpoint>) -> RouteDefinition {
    RouteDefinition::new(id, endpoint.clone(), noop())
}

/// Default configuration with a short shutdown timeout.
pub fn config(timeout: Duration) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.shutdown.timeout = timeout;
    config
}
