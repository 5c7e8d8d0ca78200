// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Inflight repository
//!
//! Tracks exchanges currently being processed. Message processing threads
//! update it concurrently with the lifecycle, so it never takes the
//! lifecycle lock.
//!

use crate::Exchange;

use dashmap::DashMap;
use tracing::trace;

use std::time::{Duration, Instant};

/// Point in time view of one exchange in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct InflightExchange {
    pub exchange_id: String,
    pub from_route_id: Option<String>,
    pub at_route_id: Option<String>,
    pub node_id: Option<String>,
    pub started: Instant,
}

impl InflightExchange {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

struct Entry {
    from_route_id: Option<String>,
    routes: Vec<String>,
    node_id: Option<String>,
    started: Instant,
}

/// Inflight repository.
#[derive(Default)]
pub struct InflightRepository {
    exchanges: DashMap<String, Entry>,
    routes: DashMap<String, usize>,
}

impl InflightRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the exchange as in flight on the route.
    pub fn add(&self, exchange: &Exchange, route_id: &str) {
        trace!("Exchange {} in flight on route {}.", exchange.id(), route_id);
        *self.routes.entry(route_id.to_owned()).or_insert(0) += 1;
        self.exchanges
            .entry(exchange.id().to_owned())
            .or_insert_with(|| Entry {
                from_route_id: exchange.from_route_id().map(str::to_owned),
                routes: Vec::new(),
                node_id: None,
                started: Instant::now(),
            })
            .routes
            .push(route_id.to_owned());
    }

    /// Removes the exchange from the route. Counts never go below zero.
    pub fn remove(&self, exchange: &Exchange, route_id: &str) {
        trace!("Exchange {} done on route {}.", exchange.id(), route_id);
        if let Some(mut count) = self.routes.get_mut(route_id) {
            *count = count.saturating_sub(1);
        }
        let empty = match self.exchanges.get_mut(exchange.id()) {
            Some(mut entry) => {
                if let Some(position) =
                    entry.routes.iter().rposition(|route| route == route_id)
                {
                    entry.routes.remove(position);
                }
                entry.routes.is_empty()
            }
            None => false,
        };
        if empty {
            self.exchanges
                .remove_if(exchange.id(), |_, entry| entry.routes.is_empty());
        }
    }

    /// Records the node an exchange is currently processed at.
    pub fn set_node(&self, exchange_id: &str, node_id: &str) {
        if let Some(mut entry) = self.exchanges.get_mut(exchange_id) {
            entry.node_id = Some(node_id.to_owned());
        }
    }

    /// Number of exchanges in flight.
    pub fn size(&self) -> usize {
        self.exchanges.len()
    }

    /// Number of exchanges in flight on the route.
    pub fn size_of(&self, route_id: &str) -> usize {
        self.routes.get(route_id).map(|count| *count).unwrap_or(0)
    }

    /// Snapshot of the exchanges in flight, oldest first.
    pub fn browse(&self) -> Vec<InflightExchange> {
        let mut all: Vec<InflightExchange> = self
            .exchanges
            .iter()
            .map(|entry| InflightExchange {
                exchange_id: entry.key().clone(),
                from_route_id: entry.from_route_id.clone(),
                at_route_id: entry.routes.last().cloned(),
                node_id: entry.node_id.clone(),
                started: entry.started,
            })
            .collect();
        all.sort_by_key(|exchange| exchange.started);
        all
    }

    /// Snapshot restricted to exchanges at or from one of the given routes.
    pub fn browse_from_routes(&self, route_ids: &[String]) -> Vec<InflightExchange> {
        self.browse()
            .into_iter()
            .filter(|exchange| {
                route_ids.iter().any(|id| {
                    exchange.at_route_id.as_deref() == Some(id.as_str())
                        || exchange.from_route_id.as_deref() == Some(id.as_str())
                })
            })
            .collect()
    }

    /// The exchange in flight the longest on the route.
    pub fn oldest(&self, route_id: &str) -> Option<InflightExchange> {
        self.browse_from_routes(&[route_id.to_owned()]).into_iter().next()
    }

    /// Forgets the counts of a removed route.
    pub fn remove_route(&self, route_id: &str) {
        self.routes.remove(route_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_route() {
        let repository = InflightRepository::new();
        let one = Exchange::new();
        let two = Exchange::new();
        repository.add(&one, "foo");
        repository.add(&two, "foo");
        repository.add(&two, "bar");
        assert_eq!(repository.size(), 2);
        assert_eq!(repository.size_of("foo"), 2);
        assert_eq!(repository.size_of("bar"), 1);

        let browse = repository.browse_from_routes(&["bar".to_owned()]);
        assert_eq!(browse.len(), 1);
        assert_eq!(browse[0].exchange_id, two.id());
        assert_eq!(browse[0].at_route_id.as_deref(), Some("bar"));

        repository.remove(&two, "bar");
        repository.remove(&two, "foo");
        repository.remove(&one, "foo");
        assert_eq!(repository.size(), 0);
        assert_eq!(repository.size_of("foo"), 0);
        assert!(repository.browse().is_empty());
    }

    #[test]
    fn test_remove_never_goes_negative() {
        let repository = InflightRepository::new();
        let exchange = Exchange::new();
        repository.add(&exchange, "foo");
        repository.remove(&exchange, "foo");
        repository.remove(&exchange, "foo");
        repository.remove(&exchange, "unknown");
        assert_eq!(repository.size_of("foo"), 0);
        assert_eq!(repository.size(), 0);
    }

    #[test]
    fn test_node_is_recorded() {
        let repository = InflightRepository::new();
        let exchange = Exchange::new();
        repository.add(&exchange, "foo");
        repository.set_node(exchange.id(), "to1");
        let oldest = repository.oldest("foo").unwrap();
        assert_eq!(oldest.node_id.as_deref(), Some("to1"));
    }
}
