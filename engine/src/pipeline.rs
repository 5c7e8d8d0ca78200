// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Per-message pipeline
//!
//! Every route wraps its processor in a [`Pipeline`]. The pipeline runs a
//! fixed chain of [`Advice`]s around each exchange:
//!
//! - `before` hooks run in ascending order.
//! - The processor runs, synchronously or by completing the callback later.
//! - `after` hooks run in descending order, on success and on failure.
//!
//! The chain is sorted once, when the pipeline is built. Advices that carry
//! state get one slot each in a state array, and the arrays are recycled
//! through a bounded pool.
//!
//! If the engine is forcing a shutdown, new exchanges are rejected with
//! [`Error::RejectedExecution`] before any advice runs.
//!

use crate::{route::lock, shutdown::ShutdownSignal, Error, Exchange};

use tracing::{debug, trace};

use std::{
    any::Any,
    fmt,
    sync::{Arc, Mutex},
};

/// Per invocation state carried by an advice from `before` to `after`.
pub type AdviceState = Box<dyn Any + Send>;

/// Completion callback. The flag tells whether processing completed on
/// the calling thread.
pub type AsyncCallback = Box<dyn FnOnce(Exchange, bool) + Send>;

/// Cross-cutting hook around the processing of each exchange.
pub trait Advice: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Lower orders run their `before` first and their `after` last.
    fn order(&self) -> i32 {
        0
    }

    /// Whether the value returned by `before` must be kept for `after`.
    fn has_state(&self) -> bool {
        false
    }

    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error>;

    fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>);
}

/// The business step of a route.
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), Error>;

    /// Processes the exchange and completes the callback exactly once.
    /// Returns `true` if the callback was completed before returning.
    fn process_async(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if let Err(error) = self.process(&mut exchange) {
            exchange.set_exception(error);
        }
        callback(exchange, true);
        true
    }
}

impl<F> Processor for F
where
    F: Fn(&mut Exchange) -> Result<(), Error> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), Error> {
        self(exchange)
    }
}

type States = Vec<Option<AdviceState>>;

/// Bounded pool of state arrays.
struct StatePool {
    capacity: usize,
    slots: usize,
    free: Mutex<Vec<States>>,
}

impl StatePool {
    fn new(slots: usize, capacity: usize) -> Self {
        Self {
            capacity,
            slots,
            free: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> States {
        match lock(&self.free).pop() {
            Some(states) => states,
            None => Self::fresh(self.slots),
        }
    }

    fn release(&self, mut states: States) {
        states.iter_mut().for_each(|slot| *slot = None);
        let mut free = lock(&self.free);
        if free.len() < self.capacity {
            free.push(states);
        }
    }

    fn fresh(slots: usize) -> States {
        (0..slots).map(|_| None).collect()
    }

    fn available(&self) -> usize {
        lock(&self.free).len()
    }
}

/// The sorted advice chain, shared with pending completions.
struct Chain {
    advices: Vec<Arc<dyn Advice>>,
    /// State slot of each advice, if it has state.
    slots: Vec<Option<usize>>,
    stateful: usize,
    pool: Option<StatePool>,
}

impl Chain {
    fn acquire(&self) -> States {
        match &self.pool {
            Some(pool) => pool.acquire(),
            None => StatePool::fresh(self.stateful),
        }
    }

    fn release(&self, states: States) {
        if let Some(pool) = &self.pool {
            pool.release(states);
        }
    }

    /// Runs `after` of the first `ran` advices, last one first.
    fn unwind(&self, exchange: &mut Exchange, mut states: States, ran: usize) {
        for index in (0..ran).rev() {
            let state = self.slots[index].and_then(|slot| states[slot].take());
            self.advices[index].after(exchange, state);
        }
        self.release(states);
    }
}

/// Builds a [`Pipeline`].
pub struct PipelineBuilder {
    route_id: String,
    processor: Arc<dyn Processor>,
    signal: Arc<ShutdownSignal>,
    advices: Vec<Arc<dyn Advice>>,
    pooled: bool,
    pool_capacity: usize,
}

impl PipelineBuilder {
    pub fn new(
        route_id: &str,
        processor: Arc<dyn Processor>,
        signal: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            route_id: route_id.to_owned(),
            processor,
            signal,
            advices: Vec::new(),
            pooled: true,
            pool_capacity: 100,
        }
    }

    pub fn advice(mut self, advice: Arc<dyn Advice>) -> Self {
        self.advices.push(advice);
        self
    }

    pub fn advices<I>(mut self, advices: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Advice>>,
    {
        self.advices.extend(advices);
        self
    }

    /// Recycle state arrays through a pool of the given capacity.
    pub fn pooled(mut self, pooled: bool, capacity: usize) -> Self {
        self.pooled = pooled;
        self.pool_capacity = capacity;
        self
    }

    pub fn build(mut self) -> Pipeline {
        // Stable, so advices with the same order keep registration order.
        self.advices.sort_by_key(|advice| advice.order());
        let mut stateful = 0;
        let slots = self
            .advices
            .iter()
            .map(|advice| {
                if advice.has_state() {
                    stateful += 1;
                    Some(stateful - 1)
                } else {
                    None
                }
            })
            .collect();
        let pool = if self.pooled && stateful > 0 {
            Some(StatePool::new(stateful, self.pool_capacity))
        } else {
            None
        };
        debug!(
            "Built pipeline for route {} with {} advices.",
            self.route_id,
            self.advices.len()
        );
        Pipeline {
            route_id: self.route_id,
            processor: self.processor,
            signal: self.signal,
            chain: Arc::new(Chain {
                advices: self.advices,
                slots,
                stateful,
                pool,
            }),
        }
    }
}

/// Pipeline.
pub struct Pipeline {
    route_id: String,
    processor: Arc<dyn Processor>,
    signal: Arc<ShutdownSignal>,
    chain: Arc<Chain>,
}

impl Pipeline {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Advice names in execution order.
    pub fn advice_names(&self) -> Vec<String> {
        self.chain
            .advices
            .iter()
            .map(|advice| advice.name().to_owned())
            .collect()
    }

    /// State arrays currently waiting in the pool.
    pub fn pooled_states(&self) -> usize {
        self.chain.pool.as_ref().map(StatePool::available).unwrap_or(0)
    }

    /// Processes one exchange. The callback is completed exactly once.
    /// Returns `true` if it was completed before this call returned.
    pub fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        if self.signal.is_force_shutdown() {
            debug!(
                "Rejecting exchange {} on route {} as the engine is forcing shutdown.",
                exchange.id(),
                self.route_id
            );
            exchange.set_exception(Error::RejectedExecution(exchange.id().to_owned()));
            callback(exchange, true);
            return true;
        }

        let mut states = self.chain.acquire();
        for (index, advice) in self.chain.advices.iter().enumerate() {
            match advice.before(&mut exchange) {
                Ok(state) => {
                    if let Some(slot) = self.chain.slots[index] {
                        states[slot] = state;
                    }
                }
                Err(error) => {
                    debug!(
                        "Advice {} failed on exchange {}: {}",
                        advice.name(),
                        exchange.id(),
                        error
                    );
                    exchange.set_exception(error);
                    self.chain.unwind(&mut exchange, states, index);
                    callback(exchange, true);
                    return true;
                }
            }
        }

        let ran = self.chain.advices.len();
        if exchange.is_route_stop() {
            trace!("Exchange {} marked to stop routing.", exchange.id());
            self.chain.unwind(&mut exchange, states, ran);
            callback(exchange, true);
            return true;
        }

        if exchange.is_transacted() {
            if let Err(error) = self.processor.process(&mut exchange) {
                exchange.set_exception(error);
            }
            self.chain.unwind(&mut exchange, states, ran);
            callback(exchange, true);
            return true;
        }

        let chain = self.chain.clone();
        self.processor.process_async(
            exchange,
            Box::new(move |mut exchange, done_sync| {
                chain.unwind(&mut exchange, states, ran);
                callback(exchange, done_sync);
            }),
        )
    }

    /// Processes the exchange and waits for its completion.
    pub async fn process_and_wait(&self, exchange: Exchange) -> Exchange {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let id = exchange.id().to_owned();
        self.process(
            exchange,
            Box::new(move |exchange, _| {
                let _ = sender.send(exchange);
            }),
        );
        match receiver.await {
            Ok(exchange) => exchange,
            Err(_) => {
                let mut exchange = Exchange::new();
                exchange.set_exception(Error::Processing(format!(
                    "Exchange {} was dropped without completion.",
                    id
                )));
                exchange
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("route_id", &self.route_id)
            .field("advices", &self.advice_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ordered(i32, &'static str);

    impl Advice for Ordered {
        fn name(&self) -> &str {
            self.1
        }

        fn order(&self) -> i32 {
            self.0
        }

        fn has_state(&self) -> bool {
            true
        }

        fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
            let body = format!("{}>{}", exchange.body().unwrap_or_default(), self.1);
            exchange.set_body(&body);
            Ok(Some(Box::new(self.1)))
        }

        fn after(&self, exchange: &mut Exchange, state: Option<AdviceState>) {
            let name = state
                .and_then(|state| state.downcast::<&'static str>().ok())
                .map(|name| *name)
                .unwrap_or("?");
            let body = format!("{}<{}", exchange.body().unwrap_or_default(), name);
            exchange.set_body(&body);
        }
    }

    fn pipeline(advices: Vec<Arc<dyn Advice>>) -> Pipeline {
        let processor = |exchange: &mut Exchange| -> Result<(), Error> {
            let body = format!("{}|", exchange.body().unwrap_or_default());
            exchange.set_body(&body);
            Ok(())
        };
        PipelineBuilder::new("foo", Arc::new(processor), Arc::new(ShutdownSignal::default()))
            .advices(advices)
            .build()
    }

    #[tokio::test]
    async fn test_advices_are_sorted_once_at_build() {
        let pipeline = pipeline(vec![
            Arc::new(Ordered(20, "c")),
            Arc::new(Ordered(-5, "a")),
            Arc::new(Ordered(10, "b")),
        ]);
        assert_eq!(pipeline.advice_names(), vec!["a", "b", "c"]);

        let exchange = pipeline.process_and_wait(Exchange::with_body("")).await;
        assert_eq!(exchange.body(), Some(">a>b>c|<c<b<a"));
    }

    #[tokio::test]
    async fn test_state_arrays_are_recycled() {
        let pipeline = pipeline(vec![Arc::new(Ordered(0, "a"))]);
        assert_eq!(pipeline.pooled_states(), 0);
        pipeline.process_and_wait(Exchange::new()).await;
        pipeline.process_and_wait(Exchange::new()).await;
        assert_eq!(pipeline.pooled_states(), 1);
    }
}
