use crate::identity::{DefaultIdentitySource, TestIdentitySource};
use crate::store::TransactionStore;
use parking_lot::{Mutex, RwLock};
use sea_orm::DatabaseConnection;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static SCOPED_STORE: Arc<TransactionStore>;
}

pub(crate) fn scope_store<F>(store: Arc<TransactionStore>, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    SCOPED_STORE.scope(store, future)
}

/// Identifies the logical call chain that is running: the tokio task, or the
/// OS thread when the code is not inside a spawned task (e.g. `block_on`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CallChainKey {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl CallChainKey {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(thread::current().id()),
        }
    }
}

#[derive(Default)]
struct ResolverState {
    call_chains: HashMap<CallChainKey, Weak<TransactionStore>>,
    by_identity: HashMap<String, Arc<TransactionStore>>,
    pending: VecDeque<Arc<TransactionStore>>,
}

/// Counts of the resolver's bookkeeping, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolverSnapshot {
    pub call_chains: usize,
    pub identities: usize,
    pub pending: usize,
}

/// Per-connection isolation state shared by every clone of a
/// `SandboxedConnection`.
pub struct IsolationContext {
    id: u64,
    original: Arc<DatabaseConnection>,
    replacement: RwLock<Option<Arc<DatabaseConnection>>>,
    identity: Arc<dyn TestIdentitySource>,
    state: Mutex<ResolverState>,
}

impl IsolationContext {
    pub fn new(original: Arc<DatabaseConnection>) -> Self {
        Self::with_identity_source(original, Arc::new(DefaultIdentitySource))
    }

    pub fn with_identity_source(
        original: Arc<DatabaseConnection>,
        identity: Arc<dyn TestIdentitySource>,
    ) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
            original,
            replacement: RwLock::new(None),
            identity,
            state: Mutex::new(ResolverState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn original(&self) -> &DatabaseConnection {
        &self.original
    }

    pub fn shared_original(&self) -> Arc<DatabaseConnection> {
        Arc::clone(&self.original)
    }

    /// Handle used when no sandbox applies: the replacement if one was set,
    /// otherwise the original connection.
    pub fn default_connection(&self) -> Arc<DatabaseConnection> {
        self.replacement
            .read()
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.original))
    }

    pub fn set_default_connection(&self, connection: Arc<DatabaseConnection>) {
        *self.replacement.write() = Some(connection);
    }

    pub fn reset_default_connection(&self) {
        *self.replacement.write() = None;
    }

    /// The sandbox that applies to the running code, if it is active.
    pub fn active_store(&self) -> Option<Arc<TransactionStore>> {
        self.resolve().filter(|store| store.is_active())
    }

    /// Resolution without the final activity filter: may return the
    /// call chain's last store after it was deactivated.
    pub fn resolve(&self) -> Option<Arc<TransactionStore>> {
        if let Some(store) = self.scoped_store() {
            return Some(store);
        }

        let key = CallChainKey::current();
        let bound = {
            let state = self.state.lock();
            state.call_chains.get(&key).and_then(Weak::upgrade)
        };
        if let Some(store) = &bound {
            if store.is_active() {
                return bound;
            }
        }

        if let Some(identity) = self.identity.current_identity().and_then(|i| i.key()) {
            let mut state = self.state.lock();
            let existing = state.by_identity.get(&identity).cloned();
            let named = match existing {
                Some(store) => Some(store),
                None => state.pending.pop_front().inspect(|store| {
                    debug!(store = store.id(), %identity, "claimed pending sandbox");
                    state.by_identity.insert(identity.clone(), Arc::clone(store));
                }),
            };

            if let Some(store) = named.filter(|store| store.is_active()) {
                state.call_chains.insert(key, Arc::downgrade(&store));
                return Some(store);
            }
        }

        bound
    }

    fn scoped_store(&self) -> Option<Arc<TransactionStore>> {
        SCOPED_STORE
            .try_with(Arc::clone)
            .ok()
            .filter(|store| store.context_id() == self.id && store.is_active())
    }

    /// Make `store` the active sandbox for the current call chain and test.
    pub fn bind(&self, store: &Arc<TransactionStore>) {
        store.set_active(true);
        let key = CallChainKey::current();
        let identity = self.identity.current_identity().and_then(|i| i.key());

        let mut state = self.state.lock();
        state.call_chains.retain(|_, bound| bound.strong_count() > 0);
        state.call_chains.insert(key, Arc::downgrade(store));
        match identity {
            Some(identity) => {
                debug!(store = store.id(), %identity, "bound sandbox to test");
                state.by_identity.insert(identity, Arc::clone(store));
            }
            None => {
                debug!(store = store.id(), "no test identity; sandbox queued as pending");
                state.pending.push_back(Arc::clone(store));
            }
        }
    }

    /// Deactivate `store` and forget every reference the resolver holds to it.
    pub fn unbind(&self, store: &Arc<TransactionStore>) {
        store.set_active(false);

        let mut state = self.state.lock();
        state.call_chains.retain(|_, bound| {
            bound
                .upgrade()
                .is_some_and(|bound| !Arc::ptr_eq(&bound, store))
        });
        state
            .by_identity
            .retain(|_, bound| !Arc::ptr_eq(bound, store));
        state.pending.retain(|pending| !Arc::ptr_eq(pending, store));
        debug!(store = store.id(), "unbound sandbox");
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        let state = self.state.lock();
        ResolverSnapshot {
            call_chains: state.call_chains.len(),
            identities: state.by_identity.len(),
            pending: state.pending.len(),
        }
    }
}
