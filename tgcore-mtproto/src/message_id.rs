//! Message identifiers.
//!
//! An id is `unix_time << 32 | subsec_nanos << 2` in server time. Client ids
//! are divisible by 4; server ids are odd (1 for responses, 3 otherwise).

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds and nanoseconds since the Unix epoch, clamped to zero.
pub fn unix_now() -> (i64, u32) {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (now.as_secs() as i64, now.subsec_nanos())
}

/// The Unix time a message id encodes.
pub fn id_time(msg_id: i64) -> i64 {
    msg_id >> 32
}

/// Allocates strictly increasing client message ids.
#[derive(Clone, Debug, Default)]
pub struct MsgIdGenerator {
    last: i64,
    time_offset: i32,
}

impl MsgIdGenerator {
    pub fn new(time_offset: i32) -> Self {
        Self { last: 0, time_offset }
    }

    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
    }

    /// Derive the offset from a server id observed at local time `now`.
    /// Ids already handed out stay valid: later ids still increase.
    pub fn sync_with(&mut self, server_msg_id: i64, now: i64) -> i32 {
        self.time_offset = (id_time(server_msg_id) - now) as i32;
        self.time_offset
    }

    pub fn next(&mut self) -> i64 {
        let (secs, nanos) = unix_now();
        self.next_at(secs, nanos)
    }

    /// Deterministic core of [`next`](Self::next).
    pub fn next_at(&mut self, secs: i64, nanos: u32) -> i64 {
        let server_secs = secs + i64::from(self.time_offset);
        let mut id = (server_secs << 32) | (i64::from(nanos) << 2);
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }

    /// Server time (local clock plus offset) in seconds.
    pub fn server_now(&self) -> i64 {
        unix_now().0 + i64::from(self.time_offset)
    }
}
