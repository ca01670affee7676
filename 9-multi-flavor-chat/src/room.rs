//! Registry of live sessions and the single place cross-session work happens.
//!
//! Every membership change, every bulk operation and the admission counters go
//! through one mutex owned by [`Room`]. A bulk operation holds it for its whole
//! run, so a username check cannot interleave with another claim and a
//! broadcast never straddles a join or leave. Delivery to members is a
//! non-blocking push onto each member's outbox, which keeps the critical
//! section free of network I/O.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{
    Notify,
    mpsc::{self, error::TrySendError},
    watch,
};
use tracing::debug;

use crate::protocol::{SessionKind, USERNAME_TAKEN};

pub type SessionId = u64;

/// Lines a member may have queued before further deliveries to it are dropped.
pub const OUTBOX_CAPACITY: usize = 256;

/// What the room knows about one live session.
pub struct Member {
    id: SessionId,
    kind: SessionKind,
    peer: SocketAddr,
    display_name: Option<String>,
    outbox: mpsc::Sender<String>,
    running: watch::Sender<bool>,
}

impl Member {
    pub fn new(
        id: SessionId,
        kind: SessionKind,
        peer: SocketAddr,
        outbox: mpsc::Sender<String>,
        running: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            kind,
            peer,
            display_name: None,
            outbox,
            running,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = Some(name.into());
    }

    /// How this member is named in front of broadcast text.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.peer.to_string(),
        }
    }

    /// Queues a line for the member's connection without waiting. Returns
    /// `false` when the line was dropped because the connection is gone or
    /// its outbox is full.
    pub fn deliver(&self, line: impl Into<String>) -> bool {
        match self.outbox.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(id = self.id, peer = %self.peer, "outbox full; line dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Clears the running flag; the session's loop notices and winds down.
    pub fn stop_running(&self) {
        self.running.send_replace(false);
    }
}

/// The membership snapshot handed to bulk operations.
///
/// Only reachable from inside [`Room::with_members`], so nobody can iterate
/// members without holding the room lock.
#[derive(Default)]
pub struct Members {
    entries: BTreeMap<SessionId, Member>,
}

impl Members {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<&Member> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Member> {
        self.entries.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.entries.values()
    }

    fn broadcast_peers(&self, exclude: SessionId) -> impl Iterator<Item = &Member> {
        self.iter()
            .filter(move |member| member.id != exclude && member.kind == SessionKind::Broadcast)
    }
}

/// Built-in bulk operations. Anything else can be expressed as a closure passed
/// to [`Room::with_members`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOperation {
    /// Delivers `label: text` to every broadcast member except the sender.
    Broadcast { sender: SessionId, text: String },
    /// Gives `candidate` to the requester unless another broadcast member holds it.
    ClaimUsername { requester: SessionId, candidate: String },
    /// Asks every member to stop.
    StopAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOutcome {
    Delivered(usize),
    UsernameClaimed,
    UsernameTaken,
    Stopped(usize),
    /// The sender or requester has already left the room.
    NotAMember,
}

impl BulkOperation {
    pub fn apply(self, members: &mut Members) -> BulkOutcome {
        match self {
            BulkOperation::Broadcast { sender, text } => {
                let Some(label) = members.get(sender).map(Member::label) else {
                    return BulkOutcome::NotAMember;
                };
                let line = format!("{label}: {text}");
                let delivered = members
                    .broadcast_peers(sender)
                    .filter(|member| member.deliver(line.clone()))
                    .count();
                BulkOutcome::Delivered(delivered)
            }
            BulkOperation::ClaimUsername {
                requester,
                candidate,
            } => {
                let taken = members
                    .broadcast_peers(requester)
                    .any(|member| member.display_name() == Some(candidate.as_str()));
                let Some(member) = members.get_mut(requester) else {
                    return BulkOutcome::NotAMember;
                };
                if taken {
                    member.deliver(USERNAME_TAKEN);
                    return BulkOutcome::UsernameTaken;
                }
                member.set_display_name(candidate);
                BulkOutcome::UsernameClaimed
            }
            BulkOperation::StopAll => {
                members.iter().for_each(Member::stop_running);
                BulkOutcome::Stopped(members.len())
            }
        }
    }
}

#[derive(Default)]
struct RoomState {
    members: Members,
    negotiating: usize,
    closed: bool,
}

#[derive(Default)]
pub struct Room {
    state: Mutex<RoomState>,
    departures: Notify,
    next_id: AtomicU64,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds a member. Refused (returns `false`) once the room has been closed.
    pub fn register(&self, member: Member) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        debug!(id = member.id, kind = %member.kind, peer = %member.peer, "member registered");
        state.members.entries.insert(member.id, member);
        true
    }

    /// Removes a member and wakes a listener paused on capacity. Removing an
    /// id that is not present does nothing and returns `false`.
    pub fn deregister(&self, id: SessionId) -> bool {
        let removed = self.lock().members.entries.remove(&id);
        match removed {
            Some(member) => {
                debug!(id, peer = %member.peer, "member deregistered");
                self.member_left();
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.lock().members.len()
    }

    /// Runs `operation` against the full membership under the room lock.
    pub fn with_members<R>(&self, operation: impl FnOnce(&mut Members) -> R) -> R {
        let mut state = self.lock();
        operation(&mut state.members)
    }

    pub fn apply(&self, operation: BulkOperation) -> BulkOutcome {
        self.with_members(|members| operation.apply(members))
    }

    /// Stops every member and refuses later registrations, atomically.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        match BulkOperation::StopAll.apply(&mut state.members) {
            BulkOutcome::Stopped(count) => count,
            _ => 0,
        }
    }

    /// Books a negotiation slot when `connected + negotiating < capacity`.
    pub(crate) fn try_book_negotiation(&self, capacity: usize) -> bool {
        let mut state = self.lock();
        if state.members.len() + state.negotiating >= capacity {
            return false;
        }
        state.negotiating += 1;
        true
    }

    pub(crate) fn finish_negotiation(&self) {
        let mut state = self.lock();
        state.negotiating = state.negotiating.saturating_sub(1);
    }

    pub fn negotiating(&self) -> usize {
        self.lock().negotiating
    }

    pub(crate) fn departures(&self) -> &Notify {
        &self.departures
    }

    pub(crate) fn member_left(&self) {
        self.departures.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
