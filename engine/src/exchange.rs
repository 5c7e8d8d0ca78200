// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Exchange
//!
//! One message's processing instance as it flows through a route.
//!

use crate::Error;

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

/// Hook run when the unit of work of an exchange completes.
pub type OnCompletion = Box<dyn FnOnce(&Exchange) + Send>;

/// A step recorded by the message history advice.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageHistory {
    pub route_id: String,
    pub node_id: String,
    pub elapsed: Duration,
}

/// Exchange.
pub struct Exchange {
    id: String,
    created: Instant,
    from_route_id: Option<String>,
    body: Option<String>,
    headers: HashMap<String, String>,
    exception: Option<Error>,
    transacted: bool,
    route_stop: bool,
    unit_of_work: bool,
    history: Vec<MessageHistory>,
    on_completions: Vec<OnCompletion>,
}

impl Exchange {
    /// Creates an empty exchange with a fresh id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: Instant::now(),
            from_route_id: None,
            body: None,
            headers: HashMap::new(),
            exception: None,
            transacted: false,
            route_stop: false,
            unit_of_work: false,
            history: Vec::new(),
            on_completions: Vec::new(),
        }
    }

    /// Creates an exchange carrying the given body.
    pub fn with_body(body: &str) -> Self {
        let mut exchange = Self::new();
        exchange.body = Some(body.to_owned());
        exchange
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time since the exchange was created.
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Route that created the unit of work, if any.
    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: &str) {
        self.from_route_id = Some(route_id.to_owned());
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn set_body(&mut self, body: &str) {
        self.body = Some(body.to_owned());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_owned(), value.to_owned());
    }

    /// The failure recorded on this exchange.
    pub fn exception(&self) -> Option<&Error> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: Error) {
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<Error> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Transacted exchanges are processed synchronously end to end.
    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn set_transacted(&mut self, transacted: bool) {
        self.transacted = transacted;
    }

    /// Stop routing this exchange any further.
    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, route_stop: bool) {
        self.route_stop = route_stop;
    }

    /// True while a unit of work is open on the exchange.
    pub fn has_unit_of_work(&self) -> bool {
        self.unit_of_work
    }

    pub(crate) fn set_unit_of_work(&mut self, open: bool) {
        self.unit_of_work = open;
    }

    pub fn history(&self) -> &[MessageHistory] {
        &self.history
    }

    pub(crate) fn add_history(&mut self, entry: MessageHistory) {
        self.history.push(entry);
    }

    /// Registers a hook run once when the unit of work is done.
    pub fn add_on_completion<F>(&mut self, hook: F)
    where
        F: FnOnce(&Exchange) + Send + 'static,
    {
        self.on_completions.push(Box::new(hook));
    }

    /// Runs and drops every registered completion hook.
    pub(crate) fn done(&mut self) {
        let hooks = std::mem::take(&mut self.on_completions);
        for hook in hooks {
            hook(self);
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("from_route_id", &self.from_route_id)
            .field("body", &self.body)
            .field("exception", &self.exception)
            .field("transacted", &self.transacted)
            .finish()
    }
}
