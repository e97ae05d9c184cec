//! Plain summaries of the objects the client hands back.

use std::collections::HashMap;

use tgcore_tl::{TlObject, TlValue};

use crate::peers::PeerRef;

/// An account.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct User {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub is_bot: bool,
    pub verified: bool,
    pub restricted: bool,
    pub premium: bool,
}

impl User {
    /// From a `user` object. `userEmpty` yields a user with only an id.
    pub fn from_tl(user: &TlObject) -> Result<Self, tgcore_tl::Error> {
        let opt = |field: &str| user.opt_string(field).map(str::to_owned);
        Ok(Self {
            id: user.long("id")?,
            first_name: opt("first_name"),
            last_name: opt("last_name"),
            username: opt("username"),
            phone: opt("phone"),
            is_bot: user.flag("bot"),
            verified: user.flag("verified"),
            restricted: user.flag("restricted"),
            premium: user.flag("premium"),
        })
    }

    /// First and last name joined, falling back to the username.
    pub fn full_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() { self.username.clone().unwrap_or_default() } else { name }
    }
}

/// What kind of chat a dialog is.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "lowercase"))]
pub enum DialogKind {
    User { username: Option<String>, is_bot: bool },
    Group { participants_count: Option<i32> },
    Supergroup { username: Option<String>, participants_count: Option<i32>, verified: bool },
    Channel { username: Option<String>, participants_count: Option<i32>, verified: bool },
}

/// An entry of the chat list.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dialog {
    /// Marked chat id, see [`PeerRef::marked`].
    pub id: i64,
    pub name: String,
    pub unread_count: i32,
    pub is_pinned: bool,
    /// Date of the last message, if it was returned.
    pub date: Option<i32>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub kind: DialogKind,
}

/// Who sent a message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sender {
    pub id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
}

/// A text message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    pub id: i32,
    /// Marked id of the chat the message is in.
    pub chat_id: i64,
    pub text: String,
    pub date: i32,
    pub out: bool,
    pub sender_id: Option<i64>,
    pub sender: Option<Sender>,
}

impl Message {
    /// From a `message` object. Service and empty messages yield `None`.
    pub fn from_tl(message: &TlObject, users: &UserIndex) -> Result<Option<Self>, tgcore_tl::Error> {
        if message.name() != "message" {
            return Ok(None);
        }
        let chat = PeerRef::from_peer(message.object("peer_id")?);
        let chat_id = chat.map(PeerRef::marked).unwrap_or_default();
        let out = message.flag("out");
        let sender_id = message
            .opt_object("from_id")
            .and_then(PeerRef::from_peer)
            .map(PeerRef::marked)
            // Private chats omit `from_id` for messages from the other side.
            .or_else(|| match chat {
                Some(PeerRef::User(id)) if !out => Some(id),
                _ => None,
            });
        Ok(Some(Self {
            id: message.int("id")?,
            chat_id,
            text: message.string("message")?.to_owned(),
            date: message.int("date")?,
            out,
            sender_id,
            sender: sender_id.and_then(|id| users.sender(id)),
        }))
    }
}

/// Result of sending a message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SentMessage {
    pub id: i32,
    pub text: String,
    pub date: i32,
    pub chat_id: i64,
}

/// Last-seen information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UserStatus {
    Empty,
    Online { expires: i32 },
    Offline { was_online: i32 },
    Recently,
    LastWeek,
    LastMonth,
}

impl UserStatus {
    pub fn from_tl(status: &TlObject) -> Result<Self, tgcore_tl::Error> {
        Ok(match status.name() {
            "userStatusOnline" => Self::Online { expires: status.int("expires")? },
            "userStatusOffline" => Self::Offline { was_online: status.int("was_online")? },
            "userStatusRecently" => Self::Recently,
            "userStatusLastWeek" => Self::LastWeek,
            "userStatusLastMonth" => Self::LastMonth,
            _ => Self::Empty,
        })
    }
}

/// Returned by [`request_code`](crate::Client::request_code); pass it to
/// [`sign_in`](crate::Client::sign_in) with the received code.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LoginToken {
    pub phone: String,
    pub phone_code_hash: String,
}

/// Users of a response, by id.
#[derive(Debug, Default)]
pub struct UserIndex(HashMap<i64, User>);

impl UserIndex {
    pub fn new(users: &[TlValue]) -> Self {
        let users = users
            .iter()
            .filter_map(TlValue::as_object)
            .filter(|u| u.name() == "user")
            .filter_map(|u| User::from_tl(u).ok())
            .map(|u| (u.id, u))
            .collect();
        Self(users)
    }

    pub fn get(&self, id: i64) -> Option<&User> {
        self.0.get(&id)
    }

    fn sender(&self, id: i64) -> Option<Sender> {
        self.get(id).map(|u| Sender { id: u.id, first_name: u.first_name.clone(), username: u.username.clone() })
    }
}

/// Build the chat list from a `messages.Dialogs` response.
pub(crate) fn dialogs_from_tl(response: &TlObject) -> Result<Vec<Dialog>, tgcore_tl::Error> {
    if response.name() == "messages.dialogsNotModified" {
        return Ok(Vec::new());
    }
    let users = UserIndex::new(response.vector("users")?);
    let chats: HashMap<PeerRef, &TlObject> = response
        .vector("chats")?
        .iter()
        .filter_map(TlValue::as_object)
        .filter_map(|c| Some((PeerRef::of(c)?, c)))
        .collect();
    let dates: HashMap<(i64, i32), i32> = response
        .vector("messages")?
        .iter()
        .filter_map(TlValue::as_object)
        .filter_map(|m| {
            let chat = PeerRef::from_peer(m.opt_object("peer_id")?)?;
            Some(((chat.marked(), m.int("id").ok()?), m.int("date").ok()?))
        })
        .collect();

    let mut out = Vec::new();
    for dialog in response.vector("dialogs")?.iter().filter_map(TlValue::as_object) {
        if dialog.name() != "dialog" {
            continue;
        }
        let Some(peer) = PeerRef::from_peer(dialog.object("peer")?) else { continue };
        let (name, kind) = match peer {
            PeerRef::User(id) => match users.get(id) {
                Some(u) => (u.full_name(), DialogKind::User { username: u.username.clone(), is_bot: u.is_bot }),
                None => (String::new(), DialogKind::User { username: None, is_bot: false }),
            },
            PeerRef::Chat(_) | PeerRef::Channel(_) => match chats.get(&peer) {
                Some(chat) => chat_summary(chat),
                None => (String::new(), DialogKind::Group { participants_count: None }),
            },
        };
        out.push(Dialog {
            id: peer.marked(),
            name,
            unread_count: dialog.int("unread_count")?,
            is_pinned: dialog.flag("pinned"),
            date: dates.get(&(peer.marked(), dialog.int("top_message")?)).copied(),
            kind,
        });
    }
    Ok(out)
}

fn chat_summary(chat: &TlObject) -> (String, DialogKind) {
    let title = chat.opt_string("title").unwrap_or_default().to_owned();
    let participants_count = chat.opt_int("participants_count");
    let kind = match chat.name() {
        "channel" | "channelForbidden" => {
            let username = chat.opt_string("username").map(str::to_owned);
            let verified = chat.flag("verified");
            if chat.flag("broadcast") {
                DialogKind::Channel { username, participants_count, verified }
            } else {
                DialogKind::Supergroup { username, participants_count, verified }
            }
        }
        _ => DialogKind::Group { participants_count },
    };
    (title, kind)
}

/// Text messages of a `messages.Messages` response, newest first as returned.
pub(crate) fn messages_from_tl(response: &TlObject) -> Result<Vec<Message>, tgcore_tl::Error> {
    if response.name() == "messages.messagesNotModified" {
        return Ok(Vec::new());
    }
    let users = UserIndex::new(response.vector("users")?);
    let mut out = Vec::new();
    for message in response.vector("messages")?.iter().filter_map(TlValue::as_object) {
        if let Some(message) = Message::from_tl(message, &users)? {
            if !message.text.is_empty() {
                out.push(message);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, first: &str, username: Option<&str>) -> TlObject {
        TlObject::builder("user")
            .unwrap()
            .set("id", id)
            .set("access_hash", 1i64)
            .set("first_name", first)
            .set_opt("username", username)
            .build()
            .unwrap()
    }

    fn peer_user(id: i64) -> TlObject {
        TlObject::builder("peerUser").unwrap().set("user_id", id).build().unwrap()
    }

    fn text_message(id: i32, peer: TlObject, text: &str, out: bool) -> TlObject {
        TlObject::builder("message")
            .unwrap()
            .set("out", out)
            .set("id", id)
            .set("peer_id", peer)
            .set("date", 1_700_000_000 + id)
            .set("message", text)
            .build()
            .unwrap()
    }

    #[test]
    fn user_summary() {
        let user = User::from_tl(&user(1, "Ada", Some("ada"))).unwrap();
        assert_eq!(user.full_name(), "Ada");
        assert_eq!(user.username.as_deref(), Some("ada"));
        assert!(!user.is_bot);
    }

    #[test]
    fn private_messages_get_a_sender() {
        let users = UserIndex::new(&[TlValue::Object(user(9, "Bob", None))]);
        let incoming = Message::from_tl(&text_message(3, peer_user(9), "hi", false), &users).unwrap().unwrap();
        assert_eq!(incoming.chat_id, 9);
        assert_eq!(incoming.sender_id, Some(9));
        assert_eq!(incoming.sender.unwrap().first_name.as_deref(), Some("Bob"));

        let outgoing = Message::from_tl(&text_message(4, peer_user(9), "yo", true), &users).unwrap().unwrap();
        assert!(outgoing.out);
        assert_eq!(outgoing.sender_id, None);
    }

    #[test]
    fn dialogs_are_summarised() {
        let channel = TlObject::builder("channel")
            .unwrap()
            .set("broadcast", true)
            .set("id", 77i64)
            .set("access_hash", 5i64)
            .set("title", "News")
            .set("photo", TlObject::builder("chatPhotoEmpty").unwrap().build().unwrap())
            .set("date", 0)
            .set("participants_count", 1000)
            .build()
            .unwrap();
        let peer_channel = TlObject::builder("peerChannel").unwrap().set("channel_id", 77i64).build().unwrap();
        let settings = TlObject::builder("peerNotifySettings").unwrap().build().unwrap();
        let dialog = |peer: TlObject, top: i32| {
            TlObject::builder("dialog")
                .unwrap()
                .set("peer", peer)
                .set("top_message", top)
                .set("read_inbox_max_id", 0)
                .set("read_outbox_max_id", 0)
                .set("unread_count", 2)
                .set("unread_mentions_count", 0)
                .set("unread_reactions_count", 0)
                .set("notify_settings", settings.clone())
                .build()
                .unwrap()
        };
        let response = TlObject::builder("messages.dialogs")
            .unwrap()
            .set("dialogs", vec![TlValue::Object(dialog(peer_user(9), 3)), TlValue::Object(dialog(peer_channel, 8))])
            .set("messages", vec![TlValue::Object(text_message(3, peer_user(9), "hi", false))])
            .set("chats", vec![TlValue::Object(channel)])
            .set("users", vec![TlValue::Object(user(9, "Bob", Some("bob")))])
            .build()
            .unwrap();

        let dialogs = dialogs_from_tl(&response).unwrap();
        assert_eq!(dialogs.len(), 2);
        assert_eq!(dialogs[0].name, "Bob");
        assert_eq!(dialogs[0].date, Some(1_700_000_003));
        assert_eq!(dialogs[0].kind, DialogKind::User { username: Some("bob".into()), is_bot: false });
        assert_eq!(dialogs[1].id, -1_000_000_000_077);
        assert_eq!(dialogs[1].date, None);
        assert!(matches!(dialogs[1].kind, DialogKind::Channel { participants_count: Some(1000), .. }));
    }
}
