// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Route registry
//!

use crate::route::{lock, Route};

use tracing::debug;

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct Inner {
    routes: Vec<Arc<Route>>,
    groups: HashMap<String, Vec<String>>,
}

/// In-memory table of routes, kept in insertion order. Every access goes
/// through one mutex, and reads hand out snapshots so callers can iterate
/// while routes change.
#[derive(Default)]
pub struct RouteRegistry {
    inner: Mutex<Inner>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route. Duplicate ids are rejected by the orchestrator, not here.
    pub fn add(&self, route: Arc<Route>) {
        debug!("Registering route {}.", route.id());
        let mut inner = lock(&self.inner);
        if let Some(group) = route.group() {
            inner
                .groups
                .entry(group.to_owned())
                .or_default()
                .push(route.id().to_owned());
        }
        inner.routes.push(route);
    }

    /// Removes the route with the given id. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<Arc<Route>> {
        let mut inner = lock(&self.inner);
        let position = inner.routes.iter().position(|route| route.id() == id)?;
        let route = inner.routes.remove(position);
        if let Some(group) = route.group() {
            if let Some(members) = inner.groups.get_mut(group) {
                members.retain(|member| member != id);
                if members.is_empty() {
                    inner.groups.remove(group);
                }
            }
        }
        debug!("Unregistered route {}.", id);
        Some(route)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        lock(&self.inner)
            .routes
            .iter()
            .find(|route| route.id() == id)
            .cloned()
    }

    /// Snapshot of every route in insertion order.
    pub fn all(&self) -> Vec<Arc<Route>> {
        lock(&self.inner).routes.clone()
    }

    pub fn by_group(&self, group: &str) -> Vec<Arc<Route>> {
        let inner = lock(&self.inner);
        let Some(members) = inner.groups.get(group) else {
            return Vec::new();
        };
        inner
            .routes
            .iter()
            .filter(|route| members.iter().any(|member| member == route.id()))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        lock(&self.inner)
            .routes
            .iter()
            .map(|route| route.id().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
