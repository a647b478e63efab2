//! Observer registry for connection events.
//!
//! Listeners are kept in registration order and invoked synchronously on
//! the connection task. The same closure registered twice runs twice.
//! A panicking listener is logged and skipped; the rest still run.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::error;

use crate::envelope::Payload;
use crate::error::TetherError;

/// Kinds of events a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Open,
    Close,
    Error,
    Change,
    Exhausted,
}

/// An event delivered to listeners.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An application payload arrived, reliable or not.
    Data(Payload),
    /// The transport session opened.
    Open,
    /// The transport session closed.
    Close,
    /// The transport failed, or a malformed envelope was dropped.
    Error(TetherError),
    /// The connection's open flag is about to change to this value.
    Change(bool),
    /// A reconnection sequence used all of its attempts.
    Exhausted { attempts: u32 },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Open => EventKind::Open,
            Self::Close => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Change(_) => EventKind::Change,
            Self::Exhausted { .. } => EventKind::Exhausted,
        }
    }
}

/// Returned by `subscribe`; pass to `unsubscribe` to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub type Listener = Box<dyn Fn(&ConnectionEvent) + Send + 'static>;

#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

impl ListenerRegistry {
    pub fn add(&mut self, id: ListenerId, kind: EventKind, listener: Listener) {
        self.entries.push((id, kind, listener));
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _, _)| *entry != id);
        self.entries.len() != before
    }

    /// Invoke every listener for the event's kind. Returns how many ran
    /// to completion.
    pub fn emit(&self, event: &ConnectionEvent) -> usize {
        let kind = event.kind();
        let mut completed = 0;
        for (id, _, listener) in self.entries.iter().filter(|(_, k, _)| *k == kind) {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(_) => error!(listener = id.0, ?kind, "listener panicked"),
            }
        }
        completed
    }
}
