use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::Turn;
use crate::rag::vector_store::VectorIndex;

const MAX_SESSION_ID_LEN: usize = 128;

/// A client-supplied id, trimmed, or `None` when blank or too long.
pub fn normalize_session_id(id: Option<&str>) -> Option<&str> {
    id.map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_SESSION_ID_LEN)
}

/// Id to report when no session is touched: the client's own when usable,
/// otherwise a fresh one.
pub fn session_id_or_new(id: Option<&str>) -> String {
    normalize_session_id(id)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Mutable per-session data. Guarded by one async mutex so that ingestion and
/// answering on the same session never interleave.
#[derive(Default)]
pub struct SessionState {
    /// Session-scoped index; `None` until the session ingests a file.
    pub index: Option<Box<dyn VectorIndex>>,
    pub turns: Vec<Turn>,
}

pub struct Session {
    id: String,
    generation: u64,
    created_at: DateTime<Utc>,
    last_access: StdMutex<Instant>,
    in_flight: AtomicUsize,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: String, generation: u64, now: Instant) -> Self {
        Self {
            id,
            generation,
            created_at: Utc::now(),
            last_access: StdMutex::new(now),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    fn last_access(&self) -> Instant {
        *lock_ignore_poison(&self.last_access)
    }

    fn touch(&self) {
        *lock_ignore_poison(&self.last_access) = Instant::now();
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }
}

/// Keeps a session alive while a request uses it. The sweep never evicts a
/// leased session, and dropping the lease restarts its idle clock.
pub struct SessionLease {
    session: Arc<Session>,
    is_new: bool,
}

impl SessionLease {
    fn acquire(session: Arc<Session>, is_new: bool) -> Self {
        session.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { session, is_new }
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().await
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    generation: u64,
    id: String,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, Arc<Session>>,
    /// Min-heap of deadlines. Keys may be stale (earlier than the real
    /// deadline) and are corrected when popped.
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_generation: u64,
}

/// Sessions keyed by id, evicted once idle for longer than `idle_ttl`.
pub struct SessionStore {
    inner: StdMutex<StoreInner>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            inner: StdMutex::new(StoreInner::default()),
            idle_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Leases the session named `id`, creating it when absent or expired.
    /// Without a usable `id` a fresh one is generated.
    pub fn get_or_create(&self, id: Option<&str>) -> SessionLease {
        let now = Instant::now();
        let mut inner = lock_ignore_poison(&self.inner);
        self.sweep_locked(&mut inner, now);

        let id = normalize_session_id(id);

        if let Some(session) = id.and_then(|id| inner.sessions.get(id)) {
            return SessionLease::acquire(Arc::clone(session), false);
        }

        // When every session is leased nothing can go, and the store runs over
        // `max_sessions` until leases are released.
        while inner.sessions.len() >= self.max_sessions {
            if !self.evict_one_locked(&mut inner, now) {
                tracing::warn!(
                    sessions = inner.sessions.len(),
                    max_sessions = self.max_sessions,
                    "all sessions in use, admitting over capacity"
                );
                break;
            }
        }

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let session = Arc::new(Session::new(id.clone(), generation, now));
        inner.sessions.insert(id.clone(), Arc::clone(&session));
        inner.deadlines.push(Reverse(Deadline {
            at: now + self.idle_ttl,
            generation,
            id: id.clone(),
        }));
        tracing::info!(session_id = %id, sessions = inner.sessions.len(), "session created");

        SessionLease::acquire(session, true)
    }

    /// Removes every idle session past its deadline. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut inner = lock_ignore_poison(&self.inner);
        self.sweep_locked(&mut inner, Instant::now())
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_ignore_poison(&self.inner).sessions.contains_key(id)
    }

    /// Periodic sweep in the background, in addition to the per-request one.
    pub fn start_sweeper(store: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "session sweep");
                }
            }
        })
    }

    fn sweep_locked(&self, inner: &mut StoreInner, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(Reverse(head)) = inner.deadlines.peek() {
            if head.at > now {
                break;
            }
            let Some(Reverse(deadline)) = inner.deadlines.pop() else {
                break;
            };
            if self.settle_locked(inner, deadline, now) {
                removed += 1;
            }
        }
        removed
    }

    /// Evicts the idle session with the earliest deadline, ignoring whether
    /// it has expired yet. Returns false when every session is leased.
    fn evict_one_locked(&self, inner: &mut StoreInner, now: Instant) -> bool {
        let mut evicted = false;
        let mut busy = Vec::new();
        while let Some(Reverse(deadline)) = inner.deadlines.pop() {
            let Some(session) = live_session(inner, &deadline) else {
                continue;
            };
            if session.is_busy() {
                busy.push(deadline);
                continue;
            }
            let actual = session.last_access() + self.idle_ttl;
            if actual > deadline.at {
                inner.deadlines.push(Reverse(Deadline { at: actual, ..deadline }));
                continue;
            }
            inner.sessions.remove(&deadline.id);
            tracing::info!(session_id = %deadline.id, "session evicted to make room");
            evicted = true;
            break;
        }
        for deadline in busy {
            inner.deadlines.push(Reverse(Deadline {
                at: now + self.idle_ttl,
                ..deadline
            }));
        }
        evicted
    }

    /// Handles a popped deadline: drops it, reschedules it, or evicts the
    /// session. Returns true on eviction.
    fn settle_locked(&self, inner: &mut StoreInner, deadline: Deadline, now: Instant) -> bool {
        let Some(session) = live_session(inner, &deadline) else {
            return false;
        };

        let at = if session.is_busy() {
            now + self.idle_ttl
        } else {
            session.last_access() + self.idle_ttl
        };
        if at > now {
            inner.deadlines.push(Reverse(Deadline { at, ..deadline }));
            return false;
        }

        inner.sessions.remove(&deadline.id);
        tracing::info!(session_id = %deadline.id, "session expired");
        true
    }
}

/// The session a deadline refers to, unless it was since replaced or removed.
fn live_session(inner: &StoreInner, deadline: &Deadline) -> Option<Arc<Session>> {
    inner
        .sessions
        .get(&deadline.id)
        .filter(|s| s.generation == deadline.generation)
        .cloned()
}

fn lock_ignore_poison<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
