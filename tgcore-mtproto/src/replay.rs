//! Inbound message-id validation: time window and duplicate detection.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::message_id::id_time;

#[derive(Clone, Debug, PartialEq)]
pub enum ReplayError {
    /// Server ids are odd.
    NotServerId { msg_id: i64 },
    /// The id's timestamp is further than the window from server time.
    OutsideWindow { msg_id: i64, skew: i64 },
    /// Seen before in this session.
    Duplicate { msg_id: i64 },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotServerId { msg_id } => write!(f, "msg_id {msg_id} is not a server id"),
            Self::OutsideWindow { msg_id, skew } => {
                write!(f, "msg_id {msg_id} is {skew}s away from server time")
            }
            Self::Duplicate { msg_id } => write!(f, "msg_id {msg_id} was already received"),
        }
    }
}

impl std::error::Error for ReplayError {}

/// Remembers the last `capacity` inbound ids and rejects repeats or ids
/// outside `window` seconds of the current server time.
#[derive(Clone, Debug)]
pub struct ReplayGuard {
    window: i64,
    capacity: usize,
    order: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl ReplayGuard {
    pub fn new(window_secs: u64, capacity: usize) -> Self {
        Self {
            window: window_secs as i64,
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Check everything except the time window.
    pub fn check_id(&self, msg_id: i64) -> Result<(), ReplayError> {
        if msg_id & 1 == 0 {
            return Err(ReplayError::NotServerId { msg_id });
        }
        if self.seen.contains(&msg_id) {
            return Err(ReplayError::Duplicate { msg_id });
        }
        Ok(())
    }

    pub fn check_window(&self, msg_id: i64, server_now: i64) -> Result<(), ReplayError> {
        let skew = id_time(msg_id) - server_now;
        if skew.abs() > self.window {
            return Err(ReplayError::OutsideWindow { msg_id, skew });
        }
        Ok(())
    }

    /// Validate and remember `msg_id`.
    pub fn accept(&mut self, msg_id: i64, server_now: i64) -> Result<(), ReplayError> {
        self.check_id(msg_id)?;
        self.check_window(msg_id, server_now)?;
        self.remember(msg_id);
        Ok(())
    }

    pub fn remember(&mut self, msg_id: i64) {
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(msg_id);
        self.seen.insert(msg_id);
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
