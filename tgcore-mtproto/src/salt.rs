//! Server salts: the current one, a short history and announced future salts.

use std::collections::VecDeque;

/// Previous salts kept after a rotation.
pub const HISTORY_LEN: usize = 3;

/// A salt the server announced through `future_salts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FutureSalt {
    pub valid_since: i32,
    pub valid_until: i32,
    pub salt: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SaltHistory {
    current: i64,
    previous: VecDeque<i64>,
    future: Vec<FutureSalt>,
}

impl SaltHistory {
    pub fn new(current: i64) -> Self {
        Self { current, ..Self::default() }
    }

    /// Rebuild from persisted parts; the history is truncated to its bound.
    pub fn from_parts(current: i64, previous: impl IntoIterator<Item = i64>) -> Self {
        let mut previous: VecDeque<i64> = previous.into_iter().collect();
        previous.truncate(HISTORY_LEN);
        Self { current, previous, future: Vec::new() }
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    /// Most recent first.
    pub fn previous(&self) -> impl Iterator<Item = i64> + '_ {
        self.previous.iter().copied()
    }

    pub fn future(&self) -> &[FutureSalt] {
        &self.future
    }

    /// Make `salt` current. Returns `false` if it already was.
    pub fn rotate(&mut self, salt: i64) -> bool {
        if salt == self.current {
            return false;
        }
        let old = std::mem::replace(&mut self.current, salt);
        self.previous.retain(|&s| s != salt);
        self.previous.push_front(old);
        self.previous.truncate(HISTORY_LEN);
        true
    }

    /// Whether `salt` is the current salt, a recent one, or announced.
    pub fn is_known(&self, salt: i64) -> bool {
        salt == self.current || self.previous.contains(&salt) || self.future.iter().any(|f| f.salt == salt)
    }

    /// Whether `salt` was current before the last rotations. A message sent
    /// with it only needs re-sending, not another rotation.
    pub fn is_stale(&self, salt: i64) -> bool {
        salt != self.current && self.previous.contains(&salt)
    }

    pub fn add_future(&mut self, salts: impl IntoIterator<Item = FutureSalt>) {
        for salt in salts {
            if !self.future.contains(&salt) {
                self.future.push(salt);
            }
        }
        self.future.sort_by_key(|s| s.valid_since);
    }

    /// Drop expired future salts and switch to one valid at `server_now` if
    /// the current salt is not among them. Returns the new salt if it changed.
    pub fn refresh(&mut self, server_now: i32) -> Option<i64> {
        self.future.retain(|s| s.valid_until > server_now);
        let valid = self
            .future
            .iter()
            .filter(|s| s.valid_since <= server_now)
            .max_by_key(|s| s.valid_since)?
            .salt;
        self.rotate(valid).then_some(valid)
    }

    /// Seconds until the last announced salt expires, `None` if none is.
    pub fn remaining_validity(&self, server_now: i32) -> Option<i32> {
        self.future.iter().map(|s| s.valid_until - server_now).max()
    }
}
