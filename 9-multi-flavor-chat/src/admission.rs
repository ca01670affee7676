//! Capacity gate in front of the accept loop.
//!
//! A negotiation slot is booked before a connection is accepted and released
//! when its negotiation ends, whether or not a session came out of it. The
//! counters live inside the [`Room`] lock, so the check always sees the same
//! membership a concurrent bulk operation would.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, info};

use crate::room::Room;

pub struct AdmissionController {
    room: Arc<Room>,
    capacity: usize,
    stopped: AtomicBool,
}

impl AdmissionController {
    /// A capacity of zero would never admit anyone and is raised to one.
    pub fn new(room: Arc<Room>, capacity: usize) -> Self {
        Self {
            room,
            capacity: capacity.max(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Books a slot if `connected + negotiating` is below capacity.
    pub fn try_enter(self: &Arc<Self>) -> Option<NegotiationSlot> {
        if self.is_stopped() || !self.room.try_book_negotiation(self.capacity) {
            return None;
        }
        Some(NegotiationSlot {
            admission: Arc::clone(self),
        })
    }

    /// Waits until a slot can be booked. Returns `None` once stopped.
    pub async fn enter(self: &Arc<Self>) -> Option<NegotiationSlot> {
        let mut paused = false;
        loop {
            let departure = self.room.departures().notified();
            tokio::pin!(departure);
            departure.as_mut().enable();

            if self.is_stopped() {
                return None;
            }
            if let Some(slot) = self.try_enter() {
                if paused {
                    debug!("capacity available again; resuming accepts");
                }
                return Some(slot);
            }
            if !paused {
                info!(capacity = self.capacity, "maximum number of connections reached");
                paused = true;
            }
            departure.await;
        }
    }

    /// Moves to the stopped state and releases a paused [`enter`](Self::enter).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.room.member_left();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn leave_negotiation(&self) {
        self.room.finish_negotiation();
        self.room.member_left();
    }
}

/// A booked negotiation window. Dropping it releases the slot.
pub struct NegotiationSlot {
    admission: Arc<AdmissionController>,
}

impl NegotiationSlot {
    pub fn is_stopped(&self) -> bool {
        self.admission.is_stopped()
    }
}

impl Drop for NegotiationSlot {
    fn drop(&mut self) {
        self.admission.leave_negotiation();
    }
}
