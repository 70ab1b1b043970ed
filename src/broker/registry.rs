//! Compute Context Registry.
//!
//! Tracks one [`ComputeContext`] per [`SessionKey`] and owns the View Cache,
//! so removing a context and discarding its views happen under the same lock.
//! The registry also enforces the compute slot pool. A slot belongs to a
//! session, however many contexts (datasets, workers) that session has open:
//! at most `capacity` sessions hold contexts at once, and a new session
//! claiming a slot when the pool is full evicts every context of the
//! least-recently-active other session.
//!
//! Every registration gets a fresh epoch. Callers hold a [`ContextHandle`]
//! across their compute call and check it with [`Registry::is_current`]
//! afterwards; a call that started under an older epoch must discard its
//! result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::key::{SessionId, SessionKey};
use super::views::{ViewCache, ViewDefinition};

/// Liveness of a compute context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Worker-side context created; no dataset loaded yet.
    Established,
    /// `load_data` in flight.
    Loading,
    /// Dataset resident in the worker; queries allowed.
    Ready,
    /// Removed from the registry; never reused.
    Invalidated,
}

impl ContextState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextState::Established => "established",
            ContextState::Loading     => "loading",
            ContextState::Ready       => "ready",
            ContextState::Invalidated => "invalidated",
        }
    }
}

/// Broker-side record of one worker context.
#[derive(Debug)]
pub struct ComputeContext {
    pub key:          SessionKey,
    pub state:        ContextState,
    /// Dataset resident in the worker, once `load_data` succeeded.
    pub dataset_name: Option<String>,
    pub epoch:        u64,
    pub last_active:  Instant,
    mutation_gate:    Arc<tokio::sync::Mutex<()>>,
}

impl ComputeContext {
    pub fn data_loaded(&self) -> bool { self.dataset_name.is_some() }

    fn handle(&self) -> ContextHandle {
        ContextHandle {
            key:          self.key.clone(),
            epoch:        self.epoch,
            state:        self.state,
            dataset_name: self.dataset_name.clone(),
        }
    }
}

/// Snapshot of a registered context, valid for as long as its epoch is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle {
    pub key:          SessionKey,
    pub epoch:        u64,
    pub state:        ContextState,
    pub dataset_name: Option<String>,
}

/// Outcome of [`Registry::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    /// A new context was registered.
    Established(ContextHandle),
    /// The key was already registered; nothing changed.
    AlreadyEstablished(ContextHandle),
}

impl Acquired {
    pub fn handle(&self) -> &ContextHandle {
        match self {
            Acquired::Established(h) | Acquired::AlreadyEstablished(h) => h,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    contexts:   HashMap<SessionKey, ComputeContext>,
    views:      ViewCache,
    next_epoch: u64,
}

impl RegistryState {
    /// Evict least-recently-active sessions other than `key`'s until its
    /// session fits in `capacity`. A session that already holds a slot needs
    /// no room.
    fn make_room(&mut self, key: &SessionKey, capacity: usize) -> Vec<ComputeContext> {
        let mut evicted = Vec::new();
        if self.contexts.keys().any(|k| k.session == key.session) {
            return evicted;
        }
        loop {
            let mut sessions: HashMap<&SessionId, Instant> = HashMap::new();
            for ctx in self.contexts.values() {
                let last = sessions.entry(&ctx.key.session).or_insert(ctx.last_active);
                *last = (*last).max(ctx.last_active);
            }
            if sessions.len() < capacity {
                break;
            }
            let victim = sessions
                .into_iter()
                .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(session, _)| session.clone());
            let Some(victim) = victim else { break };
            let mut keys: Vec<SessionKey> = self
                .contexts
                .keys()
                .filter(|k| k.session == victim)
                .cloned()
                .collect();
            keys.sort();
            evicted.extend(keys.iter().filter_map(|k| self.remove(k)));
        }
        evicted
    }

    fn sessions(&self) -> usize {
        let mut sessions: Vec<&SessionId> = self.contexts.keys().map(|k| &k.session).collect();
        sessions.sort();
        sessions.dedup();
        sessions.len()
    }

    fn remove(&mut self, key: &SessionKey) -> Option<ComputeContext> {
        self.views.clear(key);
        self.contexts.remove(key).map(|mut ctx| {
            ctx.state = ContextState::Invalidated;
            ctx
        })
    }

    fn current_mut(&mut self, handle: &ContextHandle) -> Option<&mut ComputeContext> {
        self.contexts
            .get_mut(&handle.key)
            .filter(|ctx| ctx.epoch == handle.epoch)
    }
}

/// Registry of live compute contexts. Shared behind an `Arc`; every method
/// takes `&self`. The lock is never held across an `.await`.
#[derive(Debug)]
pub struct Registry {
    capacity: usize,
    state:    Mutex<RegistryState>,
}

impl Registry {
    /// `capacity` is the number of compute slots, i.e. sessions (at least 1).
    pub fn new(capacity: usize) -> Self {
        Registry {
            capacity: capacity.max(1),
            state:    Mutex::new(RegistryState::default()),
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Slots ────────────────────────────────────────────────────────────────

    /// Free a slot for `key` ahead of creating its worker context.
    ///
    /// Returns the evicted contexts (already removed, views discarded) so the
    /// caller can notify their clients and release them worker-side.
    pub fn make_room(&self, key: &SessionKey) -> Vec<ComputeContext> {
        self.lock().make_room(key, self.capacity)
    }

    /// Register `key` as Established, or report that it already is.
    ///
    /// A new registration starts with an empty View Cache. Contexts evicted to
    /// make room are returned alongside.
    pub fn acquire(&self, key: &SessionKey, now: Instant) -> (Acquired, Vec<ComputeContext>) {
        let mut state = self.lock();
        if let Some(ctx) = state.contexts.get_mut(key) {
            ctx.last_active = now;
            return (Acquired::AlreadyEstablished(ctx.handle()), Vec::new());
        }
        let evicted = state.make_room(key, self.capacity);
        state.next_epoch += 1;
        let ctx = ComputeContext {
            key:           key.clone(),
            state:         ContextState::Established,
            dataset_name:  None,
            epoch:         state.next_epoch,
            last_active:   now,
            mutation_gate: Arc::new(tokio::sync::Mutex::new(())),
        };
        let handle = ctx.handle();
        state.views.clear(key);
        state.contexts.insert(key.clone(), ctx);
        (Acquired::Established(handle), evicted)
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn handle(&self, key: &SessionKey) -> Option<ContextHandle> {
        self.lock().contexts.get(key).map(ComputeContext::handle)
    }

    /// `true` while the context `handle` was taken from is still registered.
    pub fn is_current(&self, handle: &ContextHandle) -> bool {
        self.lock()
            .contexts
            .get(&handle.key)
            .is_some_and(|ctx| ctx.epoch == handle.epoch)
    }

    pub fn touch(&self, key: &SessionKey, now: Instant) {
        if let Some(ctx) = self.lock().contexts.get_mut(key) {
            ctx.last_active = now;
        }
    }

    pub fn len(&self) -> usize { self.lock().contexts.len() }

    /// Number of sessions holding a slot.
    pub fn sessions(&self) -> usize { self.lock().sessions() }

    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.lock().contexts.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every context idle for at least `idle`, in key order.
    pub fn take_idle(&self, now: Instant, idle: Duration) -> Vec<ComputeContext> {
        let mut state = self.lock();
        let mut keys: Vec<SessionKey> = state
            .contexts
            .values()
            .filter(|ctx| now.saturating_duration_since(ctx.last_active) >= idle)
            .map(|ctx| ctx.key.clone())
            .collect();
        keys.sort();
        keys.iter().filter_map(|key| state.remove(key)).collect()
    }

    /// Per-context gate used when state-mutating calls are serialized.
    pub fn mutation_gate(&self, key: &SessionKey) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.lock()
            .contexts
            .get(key)
            .map(|ctx| Arc::clone(&ctx.mutation_gate))
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Established/Ready → Loading. Returns `false` if `handle` is stale.
    pub fn begin_load(&self, handle: &ContextHandle) -> bool {
        match self.lock().current_mut(handle) {
            Some(ctx) => {
                ctx.state = ContextState::Loading;
                true
            }
            None => false,
        }
    }

    /// Loading → Ready with `dataset` resident. Returns `false` if stale.
    pub fn mark_ready(&self, handle: &ContextHandle, dataset: &str) -> bool {
        match self.lock().current_mut(handle) {
            Some(ctx) => {
                ctx.state = ContextState::Ready;
                ctx.dataset_name = Some(dataset.to_string());
                true
            }
            None => false,
        }
    }

    /// Undo [`begin_load`](Self::begin_load) after a non-fatal load failure.
    pub fn abort_load(&self, handle: &ContextHandle) {
        if let Some(ctx) = self.lock().current_mut(handle) {
            if ctx.state == ContextState::Loading {
                ctx.state = if ctx.data_loaded() {
                    ContextState::Ready
                } else {
                    ContextState::Established
                };
            }
        }
    }

    /// Remove `key` and discard its views.
    pub fn invalidate(&self, key: &SessionKey) -> Option<ComputeContext> {
        self.lock().remove(key)
    }

    /// Remove the context only if it is still the one `handle` refers to.
    pub fn invalidate_current(&self, handle: &ContextHandle) -> Option<ComputeContext> {
        let mut state = self.lock();
        if state.current_mut(handle).is_none() {
            return None;
        }
        state.remove(&handle.key)
    }

    // ── Views ────────────────────────────────────────────────────────────────

    /// Overwrite a view for the context behind `handle`. Views are only kept
    /// for contexts that are Ready or Loading.
    pub fn put_view(&self, handle: &ContextHandle, view: ViewDefinition) -> bool {
        let mut state = self.lock();
        if !Self::accepts_views(&mut state, handle) {
            return false;
        }
        state.views.put(&handle.key, view);
        true
    }

    /// Insert a view only if its identity is not cached yet.
    pub fn register_view(&self, handle: &ContextHandle, view: ViewDefinition) -> bool {
        let mut state = self.lock();
        if !Self::accepts_views(&mut state, handle) {
            return false;
        }
        state.views.register(&handle.key, view)
    }

    /// Drop `view` again if it is still the cached definition for its
    /// identity in the context behind `handle`.
    pub fn discard_view(&self, handle: &ContextHandle, view: &ViewDefinition) -> bool {
        let mut state = self.lock();
        if state.current_mut(handle).is_none() {
            return false;
        }
        state.views.remove_if_current(&handle.key, view)
    }

    fn accepts_views(state: &mut RegistryState, handle: &ContextHandle) -> bool {
        state
            .current_mut(handle)
            .is_some_and(|ctx| matches!(ctx.state, ContextState::Ready | ContextState::Loading))
    }

    pub fn views(&self, key: &SessionKey) -> Vec<ViewDefinition> {
        self.lock().views.snapshot(key)
    }

    pub fn view_count(&self, key: &SessionKey) -> usize {
        self.lock().views.len(key)
    }
}
