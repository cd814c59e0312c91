use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::engine::EngineConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    Load,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct LeaseState<C> {
    cancelled: bool,
    released: bool,
    connection: Option<Arc<C>>,
}

// The connection is closed exactly once: by `cancel`, by `release`, or on
// arrival in `attach` when the lease was already cancelled.
#[derive(Debug)]
pub struct Lease<C: EngineConnection> {
    id: LeaseId,
    kind: LeaseKind,
    state: Mutex<LeaseState<C>>,
}

impl<C: EngineConnection> Lease<C> {
    fn new(id: LeaseId, kind: LeaseKind) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(LeaseState {
                cancelled: false,
                released: false,
                connection: None,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> LeaseId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn attach(&self, connection: C) -> Option<Arc<C>> {
        let mut state = self.lock();
        if state.cancelled || state.released {
            drop(state);
            debug!(lease = self.id.0, kind = ?self.kind, "closing connection that arrived after cancellation");
            connection.close();
            return None;
        }

        let connection = Arc::new(connection);
        state.connection = Some(Arc::clone(&connection));
        Some(connection)
    }

    pub fn cancel(&self) -> bool {
        let connection = {
            let mut state = self.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.connection.take()
        };

        if let Some(connection) = connection {
            debug!(lease = self.id.0, kind = ?self.kind, "closing connection of cancelled lease");
            connection.close();
        }
        true
    }

    pub fn release(&self) {
        let connection = {
            let mut state = self.lock();
            state.released = true;
            state.connection.take()
        };

        if let Some(connection) = connection {
            connection.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct LeaseGuard<C: EngineConnection> {
    next_id: u64,
    load: Option<Arc<Lease<C>>>,
    query: Option<Arc<Lease<C>>>,
}

impl<C: EngineConnection> Default for LeaseGuard<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: EngineConnection> LeaseGuard<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            load: None,
            query: None,
        }
    }

    pub fn begin(&mut self, kind: LeaseKind) -> Arc<Lease<C>> {
        self.cancel(kind);
        self.next_id += 1;
        let lease = Arc::new(Lease::new(LeaseId(self.next_id), kind));
        *self.slot_mut(kind) = Some(Arc::clone(&lease));
        lease
    }

    #[must_use]
    pub fn current(&self, kind: LeaseKind) -> Option<&Arc<Lease<C>>> {
        match kind {
            LeaseKind::Load => self.load.as_ref(),
            LeaseKind::Query => self.query.as_ref(),
        }
    }

    #[must_use]
    pub fn is_current(&self, lease: &Lease<C>) -> bool {
        self.current(lease.kind())
            .is_some_and(|current| current.id() == lease.id())
    }

    pub fn cancel(&mut self, kind: LeaseKind) -> bool {
        match self.slot_mut(kind).take() {
            Some(lease) => lease.cancel(),
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.cancel(LeaseKind::Load);
        self.cancel(LeaseKind::Query);
    }

    pub fn settle(&mut self, lease: &Lease<C>) {
        if self.is_current(lease) {
            *self.slot_mut(lease.kind()) = None;
        }
        lease.release();
    }

    fn slot_mut(&mut self, kind: LeaseKind) -> &mut Option<Arc<Lease<C>>> {
        match kind {
            LeaseKind::Load => &mut self.load,
            LeaseKind::Query => &mut self.query,
        }
    }
}
