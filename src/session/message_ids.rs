use std::sync::Mutex;

use bit_set::BitSet;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Issues message identifiers that are unique among all packets currently in flight.
///
/// Identifiers are handed out round-robin starting after the last one issued, so a released
///  identifier is not immediately reused. 0 is not a valid identifier in MQTT and is never
///  returned.
#[derive(Debug)]
pub struct MessageIds {
    state: Mutex<MessageIdsState>,
    released: Notify,
}

#[derive(Debug)]
struct MessageIdsState {
    in_flight: BitSet,
    next: u16,
}

impl Default for MessageIds {
    fn default() -> Self {
        MessageIds::new()
    }
}

impl MessageIds {
    pub fn new() -> MessageIds {
        MessageIds {
            state: Mutex::new(MessageIdsState {
                in_flight: BitSet::with_capacity(u16::MAX as usize + 1),
                next: 1,
            }),
            released: Notify::new(),
        }
    }

    /// Returns `None` if all identifiers are in flight
    pub fn try_allocate(&self) -> Option<u16> {
        let mut state = self.state.lock().unwrap();

        let mut candidate = state.next;
        for _ in 0..u16::MAX {
            if candidate == 0 {
                candidate = 1;
            }
            if state.in_flight.insert(candidate as usize) {
                state.next = candidate.wrapping_add(1);
                trace!("allocated message id {}", candidate);
                return Some(candidate);
            }
            candidate = candidate.wrapping_add(1);
        }
        None
    }

    /// Waits until an identifier becomes available if all of them are in flight
    pub async fn allocate(&self) -> u16 {
        loop {
            // register interest before checking to avoid missing a release in between
            let released = self.released.notified();
            if let Some(id) = self.try_allocate() {
                return id;
            }
            debug!("all message ids are in flight - waiting for an acknowledgment");
            released.await;
        }
    }

    /// Marks an identifier that was assigned elsewhere as in flight, so it is not allocated
    ///  again before it is released. Returns `false` if it was already in flight.
    pub fn reserve(&self, id: u16) -> bool {
        if id == 0 {
            return false;
        }
        let reserved = self.state.lock().unwrap()
            .in_flight.insert(id as usize);
        if reserved {
            trace!("reserved message id {}", id);
        }
        reserved
    }

    /// Returns `true` if the identifier was in flight
    pub fn release(&self, id: u16) -> bool {
        let was_in_flight = self.state.lock().unwrap()
            .in_flight.remove(id as usize);

        if was_in_flight {
            trace!("released message id {}", id);
            self.released.notify_waiters();
        }
        else {
            debug!("release of message id {} which is not in flight", id);
        }
        was_in_flight
    }

    pub fn is_in_flight(&self, id: u16) -> bool {
        self.state.lock().unwrap()
            .in_flight.contains(id as usize)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap()
            .in_flight.len()
    }
}
