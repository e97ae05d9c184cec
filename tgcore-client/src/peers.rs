//! Peer identities and the access-hash cache.
//!
//! Chats are addressed by a single "marked" id: users keep their id, basic
//! groups are negated, and channels are mapped below `-10^12`.

use std::collections::HashMap;

use tgcore_tl::{TlObject, TlValue};

/// Channel ids are stored as `-(CHANNEL_MARK + id)`.
pub const CHANNEL_MARK: i64 = 1_000_000_000_000;

/// A user, basic group or channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRef {
    User(i64),
    Chat(i64),
    Channel(i64),
}

impl PeerRef {
    /// Decode a marked id. `0` is not a peer.
    pub fn from_marked(id: i64) -> Option<Self> {
        match id {
            0 => None,
            id if id > 0 => Some(Self::User(id)),
            id if id <= -CHANNEL_MARK => Some(Self::Channel(-id - CHANNEL_MARK)),
            id => Some(Self::Chat(-id)),
        }
    }

    pub fn marked(self) -> i64 {
        match self {
            Self::User(id) => id,
            Self::Chat(id) => -id,
            Self::Channel(id) => -(CHANNEL_MARK + id),
        }
    }

    /// From a `Peer` object.
    pub fn from_peer(peer: &TlObject) -> Option<Self> {
        match peer.name() {
            "peerUser" => peer.long("user_id").ok().map(Self::User),
            "peerChat" => peer.long("chat_id").ok().map(Self::Chat),
            "peerChannel" => peer.long("channel_id").ok().map(Self::Channel),
            _ => None,
        }
    }

    /// The peer a `User` or `Chat` object describes.
    pub fn of(object: &TlObject) -> Option<Self> {
        let id = object.long("id").ok()?;
        match object.name() {
            "user" | "userEmpty" => Some(Self::User(id)),
            "chat" | "chatForbidden" | "chatEmpty" => Some(Self::Chat(id)),
            "channel" | "channelForbidden" => Some(Self::Channel(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PeerCache {
    /// user_id → access_hash
    users: HashMap<i64, i64>,
    /// channel_id → access_hash
    channels: HashMap<i64, i64>,
}

impl PeerCache {
    pub fn cache_user(&mut self, user: &TlObject) {
        if user.name() == "user" {
            if let (Ok(id), Some(hash)) = (user.long("id"), user.opt_long("access_hash")) {
                self.users.insert(id, hash);
            }
        }
    }

    pub fn cache_chat(&mut self, chat: &TlObject) {
        if matches!(chat.name(), "channel" | "channelForbidden") {
            if let (Ok(id), Some(hash)) = (chat.long("id"), chat.opt_long("access_hash")) {
                self.channels.insert(id, hash);
            }
        }
    }

    pub fn cache_users(&mut self, users: &[TlValue]) {
        users.iter().filter_map(TlValue::as_object).for_each(|u| self.cache_user(u));
    }

    pub fn cache_chats(&mut self, chats: &[TlValue]) {
        chats.iter().filter_map(TlValue::as_object).for_each(|c| self.cache_chat(c));
    }

    /// Cache the `users` and `chats` vectors of a response, if it has them.
    pub fn cache_response(&mut self, object: &TlObject) {
        if let Ok(users) = object.vector("users") {
            self.cache_users(users);
        }
        if let Ok(chats) = object.vector("chats") {
            self.cache_chats(chats);
        }
    }

    /// `InputPeer` for `peer`. The signed-in user becomes `inputPeerSelf`;
    /// unknown access hashes fall back to `0`.
    pub fn input_peer(&self, peer: PeerRef, self_id: Option<i64>) -> Result<TlObject, tgcore_tl::Error> {
        match peer {
            PeerRef::User(id) if Some(id) == self_id => TlObject::builder("inputPeerSelf")?.build(),
            PeerRef::User(id) => TlObject::builder("inputPeerUser")?
                .set("user_id", id)
                .set("access_hash", self.users.get(&id).copied().unwrap_or(0))
                .build(),
            PeerRef::Chat(id) => TlObject::builder("inputPeerChat")?.set("chat_id", id).build(),
            PeerRef::Channel(id) => TlObject::builder("inputPeerChannel")?
                .set("channel_id", id)
                .set("access_hash", self.channels.get(&id).copied().unwrap_or(0))
                .build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_ids() {
        for peer in [PeerRef::User(42), PeerRef::Chat(42), PeerRef::Channel(42)] {
            assert_eq!(PeerRef::from_marked(peer.marked()), Some(peer));
        }
        assert_eq!(PeerRef::Channel(42).marked(), -1_000_000_000_042);
        assert_eq!(PeerRef::from_marked(0), None);
    }

    #[test]
    fn input_peer_uses_cached_hash() {
        let mut cache = PeerCache::default();
        let user = TlObject::builder("user").unwrap().set("id", 5i64).set("access_hash", 99i64).build().unwrap();
        cache.cache_user(&user);

        let peer = cache.input_peer(PeerRef::User(5), None).unwrap();
        assert_eq!(peer.name(), "inputPeerUser");
        assert_eq!(peer.long("access_hash").unwrap(), 99);

        let unknown = cache.input_peer(PeerRef::Channel(7), None).unwrap();
        assert_eq!(unknown.long("access_hash").unwrap(), 0);

        let me = cache.input_peer(PeerRef::User(5), Some(5)).unwrap();
        assert_eq!(me.name(), "inputPeerSelf");
    }
}
