use std::collections::VecDeque;
use std::fmt;

use crate::core::models::ids::AtomId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// The emitting conformation is being dropped.
    Disconnect,
    /// The conformation's content was replaced by another's.
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub kind: ConnectionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Residue { seqpos: usize },
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityEvent {
    pub kind: IdentityKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthKind {
    Append,
    Prepend,
    Insert,
    Delete,
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthEvent {
    pub kind: LengthKind,
    pub seqpos: usize,
    /// Net change in residue count.
    pub delta: isize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralOrigin {
    Identity,
    Length,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneralEvent {
    pub origin: GeneralOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateRefresh {
    Coordinates,
    Torsions,
    Cartesian(AtomId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateChangeEvent {
    pub refresh: CoordinateRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HubState {
    #[default]
    Open,
    /// Events are discarded.
    Blocked,
    /// Events are queued and replayed on unblock.
    Buffered,
}

pub type Subscriber<E> = Box<dyn FnMut(&E) + Send>;

/// Typed publish/subscribe channel. Subscribers are called synchronously in registration order.
pub struct SignalHub<E> {
    subscribers: Vec<(SubscriptionId, Subscriber<E>)>,
    next_id: u64,
    state: HubState,
    pending: VecDeque<E>,
    blockable: bool,
    coalesce: bool,
}

impl<E> Default for SignalHub<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
            state: HubState::Open,
            pending: VecDeque::new(),
            blockable: true,
            coalesce: false,
        }
    }
}

impl<E> fmt::Debug for SignalHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHub")
            .field("subscribers", &self.subscribers.len())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<E> SignalHub<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that ignores `block`/`buffer` and always delivers immediately.
    pub fn non_blockable() -> Self {
        Self {
            blockable: false,
            ..Self::default()
        }
    }

    /// A hub that keeps at most one pending event while buffered.
    pub fn coalescing() -> Self {
        Self {
            coalesce: true,
            ..Self::default()
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn emit(&mut self, event: E) {
        if !self.blockable {
            self.deliver(&event);
            return;
        }
        match self.state {
            HubState::Open => self.deliver(&event),
            HubState::Blocked => {}
            HubState::Buffered => {
                if !(self.coalesce && !self.pending.is_empty()) {
                    self.pending.push_back(event);
                }
            }
        }
    }

    pub fn block(&mut self) {
        if self.blockable {
            self.state = HubState::Blocked;
        }
    }

    pub fn buffer(&mut self) {
        if self.blockable {
            self.state = HubState::Buffered;
        }
    }

    /// Reopens the hub and replays buffered events in arrival order.
    pub fn unblock(&mut self) {
        self.state = HubState::Open;
        while let Some(event) = self.pending.pop_front() {
            self.deliver(&event);
        }
    }

    fn deliver(&mut self, event: &E) {
        for (_, callback) in self.subscribers.iter_mut() {
            callback(event);
        }
    }
}

/// The five notification channels of a conformation.
#[derive(Debug)]
pub struct Hubs {
    pub connection: SignalHub<ConnectionEvent>,
    pub identity: SignalHub<IdentityEvent>,
    pub length: SignalHub<LengthEvent>,
    pub general: SignalHub<GeneralEvent>,
    pub coordinates: SignalHub<CoordinateChangeEvent>,
}

impl Default for Hubs {
    fn default() -> Self {
        Self {
            connection: SignalHub::non_blockable(),
            identity: SignalHub::new(),
            length: SignalHub::new(),
            general: SignalHub::coalescing(),
            coordinates: SignalHub::new(),
        }
    }
}

impl Hubs {
    pub fn emit_connection(&mut self, kind: ConnectionKind) {
        self.connection.emit(ConnectionEvent { kind });
    }

    pub fn emit_identity(&mut self, kind: IdentityKind) {
        self.identity.emit(IdentityEvent { kind });
        self.general.emit(GeneralEvent {
            origin: GeneralOrigin::Identity,
        });
    }

    pub fn emit_length(&mut self, kind: LengthKind, seqpos: usize, delta: isize) {
        self.length.emit(LengthEvent {
            kind,
            seqpos,
            delta,
        });
        self.general.emit(GeneralEvent {
            origin: GeneralOrigin::Length,
        });
    }

    pub fn emit_coordinates(&mut self, refresh: CoordinateRefresh) {
        self.coordinates.emit(CoordinateChangeEvent { refresh });
    }

    pub fn block_all(&mut self) {
        self.connection.block();
        self.identity.block();
        self.length.block();
        self.general.block();
        self.coordinates.block();
    }

    pub fn buffer_all(&mut self) {
        self.connection.buffer();
        self.identity.buffer();
        self.length.buffer();
        self.general.buffer();
        self.coordinates.buffer();
    }

    pub fn unblock_all(&mut self) {
        self.connection.unblock();
        self.identity.unblock();
        self.length.unblock();
        self.general.unblock();
        self.coordinates.unblock();
    }
}
