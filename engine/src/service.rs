// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Services
//!
//! The contracts a route needs from its collaborators. A consumer is the
//! input boundary of a route, and may optionally support suspension or
//! deferred shutdown. Those capabilities are resolved once, when the route
//! is registered, into [`ConsumerCapabilities`].
//!

use crate::{route::ShutdownRunningTask, Error, Pipeline};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

/// A startable and stoppable piece of a route.
#[async_trait]
pub trait Service: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start(&self) -> Result<(), Error>;

    async fn stop(&self) -> Result<(), Error>;

    /// Nested services, walked recursively when counting pending work.
    fn children(&self) -> Vec<Arc<dyn Service>> {
        Vec::new()
    }

    /// Shutdown capability, if the service wants to take part in it.
    fn as_shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        None
    }
}

/// Capability of services that cooperate with a graceful shutdown.
#[async_trait]
pub trait ShutdownAware: Send + Sync {
    /// Whether the service must keep running until in-flight work drains.
    fn defer_shutdown(&self, _running_task: ShutdownRunningTask) -> bool {
        false
    }

    /// Last chance hook before the service is suspended or stopped.
    async fn prepare_shutdown(
        &self,
        _suspend_only: bool,
        _forced: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Exchanges the service holds that the inflight repository does not see.
    fn pending_exchanges(&self) -> usize {
        0
    }
}

/// Capability of consumers that can pause intake without stopping.
#[async_trait]
pub trait Suspendable: Send + Sync {
    async fn suspend(&self) -> Result<(), Error>;

    async fn resume(&self) -> Result<(), Error>;
}

/// The input boundary of a route.
pub trait Consumer: Service {
    fn endpoint_uri(&self) -> &str;

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        None
    }
}

/// A resolved endpoint. Routes reference endpoints by uri, and an endpoint
/// is only released once no remaining route uses it.
pub trait Endpoint: Service {
    fn uri(&self) -> &str;

    /// Creates the consumer feeding the given pipeline.
    fn create_consumer(
        &self,
        _pipeline: Arc<Pipeline>,
    ) -> Result<Arc<dyn Consumer>, Error> {
        Err(Error::Functional(format!(
            "Endpoint {} does not support consumers.",
            self.uri()
        )))
    }
}

/// Capabilities of a consumer, resolved once at registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerCapabilities {
    pub suspendable: bool,
    pub shutdown_aware: bool,
}

impl ConsumerCapabilities {
    pub fn of(consumer: &dyn Consumer) -> Self {
        Self {
            suspendable: consumer.as_suspendable().is_some(),
            shutdown_aware: consumer.as_shutdown_aware().is_some(),
        }
    }
}

/// Run state of a managed consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Started,
    Suspended,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Started,
            2 => ServiceState::Suspended,
            _ => ServiceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::Started => 1,
            ServiceState::Suspended => 2,
        }
    }
}

/// Wraps a route consumer and makes its transitions idempotent, so a
/// forced shutdown racing a graceful one never stops a consumer twice.
pub struct ManagedConsumer {
    consumer: Arc<dyn Consumer>,
    capabilities: ConsumerCapabilities,
    state: AtomicU8,
    op: Mutex<()>,
}

impl ManagedConsumer {
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        let capabilities = ConsumerCapabilities::of(consumer.as_ref());
        Self {
            consumer,
            capabilities,
            state: AtomicU8::new(ServiceState::Stopped.as_u8()),
            op: Mutex::new(()),
        }
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    pub fn capabilities(&self) -> ConsumerCapabilities {
        self.capabilities
    }

    pub fn endpoint_uri(&self) -> &str {
        self.consumer.endpoint_uri()
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        self.consumer.as_shutdown_aware()
    }

    /// Starts the consumer, resuming it if it was suspended.
    pub async fn start(&self) -> Result<(), Error> {
        let _guard = self.op.lock().await;
        match self.state() {
            ServiceState::Started => Ok(()),
            ServiceState::Suspended => {
                self.do_resume().await?;
                self.set_state(ServiceState::Started);
                Ok(())
            }
            ServiceState::Stopped => {
                trace!("Starting consumer {}.", self.endpoint_uri());
                self.consumer.start().await?;
                self.set_state(ServiceState::Started);
                Ok(())
            }
        }
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let _guard = self.op.lock().await;
        if self.state() == ServiceState::Stopped {
            return Ok(());
        }
        trace!("Stopping consumer {}.", self.endpoint_uri());
        self.consumer.stop().await?;
        self.set_state(ServiceState::Stopped);
        Ok(())
    }

    pub async fn suspend(&self) -> Result<(), Error> {
        let _guard = self.op.lock().await;
        if self.state() != ServiceState::Started {
            return Ok(());
        }
        let Some(suspendable) = self.consumer.as_suspendable() else {
            return Err(Error::Functional(format!(
                "Consumer {} is not suspendable.",
                self.endpoint_uri()
            )));
        };
        trace!("Suspending consumer {}.", self.endpoint_uri());
        suspendable.suspend().await?;
        self.set_state(ServiceState::Suspended);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), Error> {
        let _guard = self.op.lock().await;
        if self.state() != ServiceState::Suspended {
            return Ok(());
        }
        self.do_resume().await?;
        self.set_state(ServiceState::Started);
        Ok(())
    }

    async fn do_resume(&self) -> Result<(), Error> {
        match self.consumer.as_suspendable() {
            Some(suspendable) => {
                trace!("Resuming consumer {}.", self.endpoint_uri());
                suspendable.resume().await
            }
            None => Err(Error::Functional(format!(
                "Consumer {} is not suspendable.",
                self.endpoint_uri()
            ))),
        }
    }
}

/// Flattens services and their children, depth first.
pub fn flatten_services(services: &[Arc<dyn Service>]) -> Vec<Arc<dyn Service>> {
    let mut all = Vec::new();
    for service in services {
        all.push(service.clone());
        all.extend(flatten_services(&service.children()));
    }
    all
}

/// Pending exchanges self-reported by the services, children included.
pub fn pending_exchanges(services: &[Arc<dyn Service>]) -> usize {
    flatten_services(services)
        .iter()
        .filter_map(|service| {
            service.as_shutdown_aware().map(|aware| aware.pending_exchanges())
        })
        .sum()
}
