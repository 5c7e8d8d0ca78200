// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::CallLog;
use engine::{
    Advice, AdviceState, AsyncCallback, Error, Exchange, PipelineBuilder, Processor,
    ShutdownSignal,
};

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Stateful advice recording its hooks, optionally failing in `before`.
struct Recording {
    name: &'static str,
    order: i32,
    fail: bool,
    log: CallLog,
}

impl Recording {
    fn new(name: &'static str, order: i32, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name,
            order,
            fail: false,
            log: log.clone(),
        })
    }

    fn failing(name: &'static str, order: i32, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name,
            order,
            fail: true,
            log: log.clone(),
        })
    }
}

impl Advice for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn has_state(&self) -> bool {
        true
    }

    fn before(&self, _exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        self.log.push(format!("before:{}", self.name));
        if self.fail {
            return Err(Error::Processing(format!("{} refused the exchange", self.name)));
        }
        Ok(Some(Box::new(self.name)))
    }

    fn after(&self, _exchange: &mut Exchange, state: Option<AdviceState>) {
        let state = state
            .and_then(|state| state.downcast::<&'static str>().ok())
            .map(|name| *name)
            .unwrap_or("none");
        self.log.push(format!("after:{}:{}", self.name, state));
    }
}

/// Counts its invocations.
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

impl Processor for Counting {
    fn process(&self, _exchange: &mut Exchange) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Completes every exchange later, on another task.
struct Deferred {
    log: CallLog,
}

impl Processor for Deferred {
    fn process(&self, _exchange: &mut Exchange) -> Result<(), Error> {
        Ok(())
    }

    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            log.push("processed".to_owned());
            callback(exchange, false);
        });
        false
    }
}

/// Callback counting its completions and keeping the exchange.
fn counting_callback(
    count: &Arc<AtomicUsize>,
    exception: &Arc<std::sync::Mutex<Option<Error>>>,
) -> AsyncCallback {
    let count = count.clone();
    let exception = exception.clone();
    Box::new(move |exchange: Exchange, _done_sync: bool| {
        count.fetch_add(1, Ordering::SeqCst);
        *exception.lock().unwrap() = exchange.exception().cloned();
    })
}

#[tokio::test]
async fn test_failing_advice_unwinds_what_ran() {
    let log = CallLog::default();
    let processor = Arc::new(Counting::default());
    let pipeline = PipelineBuilder::new("advised", processor.clone(), Arc::new(ShutdownSignal::default()))
        .advice(Recording::new("first", 1, &log))
        .advice(Recording::failing("second", 2, &log))
        .advice(Recording::new("third", 3, &log))
        .build();

    let count = Arc::new(AtomicUsize::new(0));
    let exception = Arc::new(std::sync::Mutex::new(None));
    let done_sync = pipeline.process(Exchange::new(), counting_callback(&count, &exception));

    assert!(done_sync);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        log.entries(),
        vec!["before:first", "before:second", "after:first:first"]
    );
    assert!(matches!(
        exception.lock().unwrap().as_ref(),
        Some(Error::Processing(_))
    ));
}

#[tokio::test]
async fn test_force_shutdown_rejects_before_any_advice() {
    let log = CallLog::default();
    let signal = Arc::new(ShutdownSignal::default());
    let processor = Arc::new(Counting::default());
    let pipeline = PipelineBuilder::new("rejecting", processor.clone(), signal.clone())
        .advice(Recording::new("first", 1, &log))
        .build();

    signal.set_force_shutdown(true);
    let count = Arc::new(AtomicUsize::new(0));
    let exception = Arc::new(std::sync::Mutex::new(None));
    let done_sync = pipeline.process(Exchange::new(), counting_callback(&count, &exception));

    assert!(done_sync);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    assert!(log.entries().is_empty());
    assert!(exception
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(Error::is_rejected_execution));

    signal.set_force_shutdown(false);
    let exchange = pipeline.process_and_wait(Exchange::new()).await;
    assert!(!exchange.is_failed());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_afters_run_in_reverse_once_async_processing_completes() {
    let log = CallLog::default();
    let processor = Arc::new(Deferred { log: log.clone() });
    let pipeline = PipelineBuilder::new("async", processor, Arc::new(ShutdownSignal::default()))
        .advice(Recording::new("outer", 1, &log))
        .advice(Recording::new("inner", 2, &log))
        .build();

    let exchange = pipeline.process_and_wait(Exchange::new()).await;

    assert!(!exchange.is_failed());
    assert_eq!(
        log.entries(),
        vec![
            "before:outer",
            "before:inner",
            "processed",
            "after:inner:inner",
            "after:outer:outer"
        ]
    );
}

#[tokio::test]
async fn test_transacted_exchange_is_processed_synchronously() {
    let log = CallLog::default();
    let processor = Arc::new(Deferred { log: log.clone() });
    let pipeline = PipelineBuilder::new("tx", processor, Arc::new(ShutdownSignal::default()))
        .advice(Recording::new("only", 1, &log))
        .build();

    let mut exchange = Exchange::new();
    exchange.set_transacted(true);
    let count = Arc::new(AtomicUsize::new(0));
    let exception = Arc::new(std::sync::Mutex::new(None));
    let done_sync = pipeline.process(exchange, counting_callback(&count, &exception));

    assert!(done_sync);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // The synchronous path never hands the exchange to another task.
    assert_eq!(log.entries(), vec!["before:only", "after:only:only"]);
}

#[tokio::test]
async fn test_route_stop_skips_processor() {
    let log = CallLog::default();
    let processor = Arc::new(Counting::default());
    let pipeline = PipelineBuilder::new("stop", processor.clone(), Arc::new(ShutdownSignal::default()))
        .advice(Arc::new(Halt))
        .advice(Recording::new("later", 10, &log))
        .build();

    let exchange = pipeline.process_and_wait(Exchange::new()).await;

    assert!(!exchange.is_failed());
    assert!(exchange.is_route_stop());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(log.entries(), vec!["before:later", "after:later:later"]);
}

/// Marks every exchange to stop routing.
struct Halt;

impl Advice for Halt {
    fn before(&self, exchange: &mut Exchange) -> Result<Option<AdviceState>, Error> {
        exchange.set_route_stop(true);
        Ok(None)
    }

    fn after(&self, _exchange: &mut Exchange, _state: Option<AdviceState>) {}
}
