//! Request coalescing for cache misses.
//!
//! The first miss for a key registers a shared future; concurrent misses for
//! the same key await that future instead of rendering again. The future
//! removes its own registry entry when it resolves, so a cancelled initiator
//! does not strand the key: the next waiter simply keeps driving it.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::error::RenderError;
use super::keys::CacheKey;

type Flight<V> = Shared<BoxFuture<'static, Result<V, RenderError>>>;

/// Whether the caller started the render or joined one already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

pub struct FlightRegistry<V> {
    flights: Arc<DashMap<CacheKey, Flight<V>>>,
}

impl<V> FlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Await the in-flight work for `key`, starting it with `work` if none exists.
    ///
    /// `work` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(
        &self,
        key: &CacheKey,
        work: F,
    ) -> (Result<V, RenderError>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RenderError>> + Send + 'static,
    {
        let (flight, role) = match self.flights.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), FlightRole::Follower),
            Entry::Vacant(vacant) => {
                let flights = Arc::clone(&self.flights);
                let owned_key = key.clone();
                let pending = work();
                let flight = async move {
                    let result = pending.await;
                    flights.remove(&owned_key);
                    result
                }
                .boxed()
                .shared();
                vacant.insert(flight.clone());
                (flight, FlightRole::Leader)
            }
        };

        (flight.await, role)
    }

    /// Number of keys with a render in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl<V> Default for FlightRegistry<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
