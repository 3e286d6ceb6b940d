//! Queues between the engine thread and the rest of the process.
//!
//! The [`Inbox`] carries received messages to consumers and counts, per
//! connection, how many are still waiting. The [`Outbox`] carries packets
//! from any thread to the engine. Each sits behind its own lock, and every
//! critical section is a single queue operation, so a poisoned lock still
//! guards consistent data and is recovered rather than propagated.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::connection::ConnectionId;
use crate::core::packet::Packet;

/// A received message and the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub connection_id: ConnectionId,
    pub packet: Packet,
}

/// Result of waiting for the next message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Transfer(Transfer),
    /// The engine is shutting down; no further messages will arrive.
    Exit,
}

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<Transfer>,
    waiting: HashMap<ConnectionId, usize>,
}

/// Received messages waiting for a consumer.
#[derive(Debug)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
    stopped: AtomicBool,
    backlog_limit: usize,
}

impl Inbox {
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            ready: Condvar::new(),
            stopped: AtomicBool::new(false),
            backlog_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue messages from one connection, in order, and wake consumers.
    ///
    /// Returns the connection's backlog after the push.
    pub fn deliver(&self, id: ConnectionId, packets: Vec<Packet>) -> usize {
        let count = packets.len();
        let backlog = {
            let mut state = self.lock();
            state.queue.extend(packets.into_iter().map(|packet| Transfer {
                connection_id: id,
                packet,
            }));
            let waiting = state.waiting.entry(id).or_insert(0);
            *waiting += count;
            *waiting
        };
        match count {
            0 => {}
            1 => self.ready.notify_one(),
            _ => self.ready.notify_all(),
        }
        backlog
    }

    /// Block until a message is available or the inbox is stopped.
    ///
    /// Stopping takes precedence over queued messages. The flag is true when
    /// this pop brought its connection back under the backlog limit, which
    /// means the engine should be woken to resume reading it.
    pub fn next(&self) -> (Delivery, bool) {
        let mut state = self.lock();
        loop {
            if self.is_stopped() {
                return (Delivery::Exit, false);
            }
            if let Some(transfer) = state.queue.pop_front() {
                let resumed = Self::release(&mut state, transfer.connection_id, self.backlog_limit);
                return (Delivery::Transfer(transfer), resumed);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(state: &mut InboxState, id: ConnectionId, limit: usize) -> bool {
        let Some(waiting) = state.waiting.get_mut(&id) else {
            return false;
        };
        let before = *waiting;
        *waiting = before.saturating_sub(1);
        if *waiting == 0 {
            state.waiting.remove(&id);
        }
        before >= limit && before - 1 < limit
    }

    /// Release every blocked and future consumer with [`Delivery::Exit`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Taking the lock orders the flag before any waiter's next check.
        let _state = self.lock();
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Messages from `id` not yet taken by a consumer.
    pub fn backlog(&self, id: ConnectionId) -> usize {
        self.lock().waiting.get(&id).copied().unwrap_or(0)
    }

    /// Backlog of every connection that has one.
    pub fn backlogs(&self) -> HashMap<ConnectionId, usize> {
        self.lock().waiting.clone()
    }

    /// Connections at or over the limit.
    pub fn throttled(&self) -> HashSet<ConnectionId> {
        self.lock()
            .waiting
            .iter()
            .filter(|(_, &count)| count >= self.backlog_limit)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

/// Where an outgoing packet should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    One(ConnectionId),
    All,
    AllExcept(Vec<ConnectionId>),
}

#[derive(Debug)]
pub(crate) struct Outbound {
    pub target: Target,
    pub packet: Packet,
}

/// Finalized packets waiting for the engine to route them.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    queue: Mutex<VecDeque<Outbound>>,
}

impl Outbox {
    pub fn push(&self, target: Target, packet: Packet) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Outbound { target, packet });
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> VecDeque<Outbound> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
