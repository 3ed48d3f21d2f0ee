//! Lazy registry of shard actors.

use std::fmt::Debug;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// A cloneable handle to a running actor.
pub trait ActorHandle: Clone + Send + Sync + 'static {
    /// Returns `false` once the actor task has stopped.
    fn is_alive(&self) -> bool;
}

/// Addressable set of actors, spawned on first use.
///
/// The map entry lock is held while spawning, so concurrent first calls for
/// the same address end up with the same actor.
pub struct ShardNamespace<K, H> {
    name: &'static str,
    actors: DashMap<K, H>,
}

impl<K, H> ShardNamespace<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: ActorHandle,
{
    /// Creates an empty namespace. `name` is used in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            actors: DashMap::new(),
        }
    }

    /// Returns the actor for `key`, spawning it if absent or stopped.
    pub fn get_or_spawn(&self, key: K, spawn: impl FnOnce(&K) -> H) -> H {
        match self.actors.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_alive() {
                    return entry.get().clone();
                }
                tracing::warn!(
                    namespace = self.name,
                    key = ?entry.key(),
                    "Shard actor stopped; spawning a replacement with empty state"
                );
                let handle = spawn(entry.key());
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                tracing::debug!(namespace = self.name, key = ?entry.key(), "Spawning shard actor");
                let handle = spawn(entry.key());
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Returns the actor for `key` only if it is already running.
    #[must_use]
    pub fn get_live(&self, key: &K) -> Option<H> {
        self.actors
            .get(key)
            .map(|h| h.value().clone())
            .filter(|h| h.is_alive())
    }

    /// Returns every running actor with its address.
    #[must_use]
    pub fn live(&self) -> Vec<(K, H)> {
        self.actors
            .iter()
            .filter(|e| e.value().is_alive())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of registered actors, including stopped ones not yet replaced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Returns `true` if no actor has been spawned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}
