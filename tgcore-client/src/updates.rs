//! Update delivery with gap detection.
//!
//! The dispatcher forwards every `Updates` object it sees to a dedicated
//! task, so recovering from a gap (which needs RPCs of its own) never
//! stalls the reader. That task keeps the common `pts`/`seq` state, asks
//! for `updates.getDifference` when something was missed, and fans the
//! resulting [`Update`]s out to every [`Subscription`] in registration
//! order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tgcore_tl::{TlObject, TlValue};

use crate::dispatcher::Dispatcher;
use crate::errors::InvocationError;
use crate::locked;
use crate::peers::PeerCache;
use crate::requests::{GetDifference, GetState};
use crate::session::{SessionHandle, UpdateState};
use crate::types::{Message, UserIndex, UserStatus};

/// What the update task is told by the rest of the client.
#[derive(Debug)]
pub(crate) enum UpdateEvent {
    /// An `Updates` object, pushed by the server or returned by a call.
    Push(TlObject),
    /// A new connection is up; anything missed meanwhile must be fetched.
    Reconnected,
    SignedIn,
    /// First subscription.
    Init,
}

// ─── Update ───────────────────────────────────────────────────────────────────

/// Message ids removed from a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDeletion {
    pub message_ids: Vec<i32>,
}

/// An update delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Update {
    NewMessage(Message),
    MessageEdited(Message),
    MessagesDeleted(MessageDeletion),
    UserStatus { user_id: i64, status: UserStatus },
    /// Anything without a dedicated variant.
    Raw(TlObject),
}

/// What a full subscription queue does with the next update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backpressure {
    /// Evict the oldest queued update; see [`Subscription::dropped`].
    #[default]
    DropOldest,
    /// Wait until the subscriber makes room. A slow subscriber then
    /// delays every other one.
    BlockPublisher,
}

// ─── Hub and subscriptions ────────────────────────────────────────────────────

struct Slot {
    queue: Mutex<VecDeque<Update>>,
    items: Notify,
    space: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

pub(crate) struct UpdateHub {
    slots: Mutex<Vec<Arc<Slot>>>,
    capacity: usize,
    policy: Backpressure,
    closed: AtomicBool,
}

impl UpdateHub {
    pub fn new(capacity: usize, policy: Backpressure) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            policy,
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let slot = Arc::new(Slot {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity)),
            items: Notify::new(),
            space: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
        });
        locked(&self.slots).push(Arc::clone(&slot));
        Subscription { slot, hub: Arc::downgrade(self) }
    }

    async fn publish(&self, update: Update) {
        let slots = locked(&self.slots).clone();
        for slot in slots {
            match self.policy {
                Backpressure::DropOldest => {
                    let mut queue = locked(&slot.queue);
                    if queue.len() >= self.capacity {
                        queue.pop_front();
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queue.push_back(update.clone());
                }
                Backpressure::BlockPublisher => loop {
                    let room = slot.space.notified();
                    {
                        let mut queue = locked(&slot.queue);
                        if slot.closed.load(Ordering::Acquire) {
                            break;
                        }
                        if queue.len() < self.capacity {
                            queue.push_back(update.clone());
                            break;
                        }
                    }
                    room.await;
                },
            }
            slot.items.notify_one();
        }
    }

    /// End every subscription once its queue is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in locked(&self.slots).iter() {
            slot.closed.store(true, Ordering::Release);
            slot.items.notify_one();
            slot.space.notify_one();
        }
    }

    fn remove(&self, slot: &Arc<Slot>) {
        locked(&self.slots).retain(|s| !Arc::ptr_eq(s, slot));
    }
}

/// A stream of updates. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
    hub: Weak<UpdateHub>,
}

impl Subscription {
    /// The next update, or `None` once the client is gone and the queue
    /// is empty.
    pub async fn next(&mut self) -> Option<Update> {
        let slot = Arc::clone(&self.slot);
        loop {
            let ready = slot.items.notified();
            if let Some(update) = self.try_next() {
                return Some(update);
            }
            if slot.closed.load(Ordering::Acquire) {
                return None;
            }
            ready.await;
        }
    }

    pub fn try_next(&mut self) -> Option<Update> {
        let update = locked(&self.slot.queue).pop_front();
        if update.is_some() {
            self.slot.space.notify_one();
        }
        update
    }

    /// Updates evicted because this subscription fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
        self.slot.space.notify_one();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.slot);
        }
    }
}

// ─── Sequence tracking ────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GapCheck {
    Ok,
    Gap { expected: i32, got: i32 },
    Duplicate,
}

impl UpdateState {
    pub(crate) fn check_pts(&self, pts: i32, pts_count: i32) -> GapCheck {
        let expected = self.pts + pts_count;
        if pts == expected {
            GapCheck::Ok
        } else if pts > expected {
            GapCheck::Gap { expected, got: pts }
        } else {
            GapCheck::Duplicate
        }
    }

    /// `seq_start == 0` means the container carries no sequence number.
    pub(crate) fn check_seq(&self, seq_start: i32) -> GapCheck {
        let expected = self.seq + 1;
        if seq_start == 0 || seq_start == expected {
            GapCheck::Ok
        } else if seq_start > expected {
            GapCheck::Gap { expected, got: seq_start }
        } else {
            GapCheck::Duplicate
        }
    }

    fn from_tl(state: &TlObject) -> Result<Self, tgcore_tl::Error> {
        Ok(Self {
            pts: state.int("pts")?,
            qts: state.int("qts")?,
            date: state.int("date")?,
            seq: state.int("seq")?,
        })
    }
}

#[derive(Debug, Default)]
struct Applied {
    updates: Vec<Update>,
    gap: bool,
    changed: bool,
}

/// Sequence state plus the rules for applying an `Updates` object to it.
#[derive(Debug, Default)]
struct Tracker {
    state: Option<UpdateState>,
}

impl Tracker {
    fn apply(&mut self, updates: &TlObject, peers: &Mutex<PeerCache>) -> Result<Applied, tgcore_tl::Error> {
        let mut out = Applied::default();
        let none = UserIndex::default();
        match updates.name() {
            "updatesTooLong" => out.gap = true,
            "updateShortMessage" | "updateShortChatMessage" => {
                let update = expand_short(updates)?;
                self.apply_one(&update, &none, &mut out)?;
            }
            "updateShortSentMessage" => self.apply_one(updates, &none, &mut out)?,
            "updateShort" => {
                self.apply_one(updates.object("update")?, &none, &mut out)?;
                if let Some(state) = self.state.as_mut().filter(|_| !out.gap) {
                    state.date = state.date.max(updates.int("date")?);
                    out.changed = true;
                }
            }
            "updates" | "updatesCombined" => {
                let seq = updates.int("seq")?;
                let seq_start = updates.opt_int("seq_start").unwrap_or(seq);
                if let Some(state) = &self.state {
                    match state.check_seq(seq_start) {
                        GapCheck::Ok => {}
                        GapCheck::Duplicate => {
                            tracing::debug!("[tgcore] dropping already applied updates (seq {seq})");
                            return Ok(out);
                        }
                        GapCheck::Gap { expected, got } => {
                            tracing::info!("[tgcore] seq gap: expected {expected}, got {got}");
                            out.gap = true;
                            return Ok(out);
                        }
                    }
                }
                locked(peers).cache_response(updates);
                let users = UserIndex::new(updates.vector("users")?);
                for update in updates.vector("updates")?.iter().filter_map(TlValue::as_object) {
                    self.apply_one(update, &users, &mut out)?;
                    if out.gap {
                        return Ok(out);
                    }
                }
                if let Some(state) = self.state.as_mut().filter(|_| seq != 0) {
                    state.seq = seq;
                    state.date = updates.int("date")?;
                    out.changed = true;
                }
            }
            other => tracing::debug!("[tgcore] ignoring {other}"),
        }
        Ok(out)
    }

    fn apply_one(&mut self, update: &TlObject, users: &UserIndex, out: &mut Applied) -> Result<(), tgcore_tl::Error> {
        let counted = match (update.opt_int("pts"), update.opt_int("pts_count")) {
            (Some(pts), Some(count)) if !is_channel_update(update) => Some((pts, count)),
            _ => None,
        };
        if let (Some((pts, count)), Some(state)) = (counted, self.state.as_mut()) {
            match state.check_pts(pts, count) {
                GapCheck::Ok => {
                    state.pts = pts;
                    out.changed = true;
                }
                GapCheck::Duplicate => {
                    tracing::debug!("[tgcore] dropping duplicate {} (pts {pts})", update.name());
                    return Ok(());
                }
                GapCheck::Gap { expected, got } => {
                    tracing::info!("[tgcore] pts gap: expected {expected}, got {got}");
                    out.gap = true;
                    return Ok(());
                }
            }
        }
        out.updates.extend(convert(update, users)?);
        Ok(())
    }
}

fn is_channel_update(update: &TlObject) -> bool {
    update.name().contains("Channel")
}

/// `updateShortMessage` / `updateShortChatMessage` as an `updateNewMessage`.
fn expand_short(short: &TlObject) -> Result<TlObject, tgcore_tl::Error> {
    let out = short.flag("out");
    let peer_user = |id: i64| TlObject::builder("peerUser").and_then(|b| b.set("user_id", id).build());
    let (peer, from) = match short.name() {
        "updateShortChatMessage" => (
            TlObject::builder("peerChat")?.set("chat_id", short.long("chat_id")?).build()?,
            Some(peer_user(short.long("from_id")?)?),
        ),
        _ => {
            let user_id = short.long("user_id")?;
            (peer_user(user_id)?, if out { None } else { Some(peer_user(user_id)?) })
        }
    };
    let message = TlObject::builder("message")?
        .set("out", out)
        .set("id", short.int("id")?)
        .set_opt("from_id", from)
        .set("peer_id", peer)
        .set("date", short.int("date")?)
        .set("message", short.string("message")?)
        .build()?;
    TlObject::builder("updateNewMessage")?
        .set("message", message)
        .set("pts", short.int("pts")?)
        .set("pts_count", short.int("pts_count")?)
        .build()
}

fn convert(update: &TlObject, users: &UserIndex) -> Result<Option<Update>, tgcore_tl::Error> {
    let message = |wrap: fn(Message) -> Update| -> Result<Option<Update>, tgcore_tl::Error> {
        Ok(Some(match Message::from_tl(update.object("message")?, users)? {
            Some(message) => wrap(message),
            None => Update::Raw(update.clone()),
        }))
    };
    match update.name() {
        "updateNewMessage" | "updateNewChannelMessage" => message(Update::NewMessage),
        "updateEditMessage" | "updateEditChannelMessage" => message(Update::MessageEdited),
        "updateDeleteMessages" => {
            let message_ids = update.vector("messages")?.iter().filter_map(TlValue::as_int).collect();
            Ok(Some(Update::MessagesDeleted(MessageDeletion { message_ids })))
        }
        "updateUserStatus" => Ok(Some(Update::UserStatus {
            user_id: update.long("user_id")?,
            status: UserStatus::from_tl(update.object("status")?)?,
        })),
        // Echoes of our own sends; the call already returned them.
        "updateShortSentMessage" | "updateMessageID" => Ok(None),
        _ => Ok(Some(Update::Raw(update.clone()))),
    }
}

// ─── Update task ──────────────────────────────────────────────────────────────

pub(crate) struct UpdateTask {
    dispatcher: Dispatcher,
    peers: Arc<Mutex<PeerCache>>,
    session: Arc<SessionHandle>,
    hub: Arc<UpdateHub>,
    tracker: Tracker,
    /// Someone subscribed, so the state is worth keeping.
    wanted: bool,
}

impl UpdateTask {
    pub fn new(
        dispatcher: Dispatcher,
        peers: Arc<Mutex<PeerCache>>,
        session: Arc<SessionHandle>,
        hub: Arc<UpdateHub>,
    ) -> Self {
        let state = session.read(|data| data.update_state);
        Self { dispatcher, peers, session, hub, tracker: Tracker { state }, wanted: false }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<UpdateEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        self.hub.close();
        tracing::debug!("[tgcore] update task stopped");
    }

    async fn handle(&mut self, event: UpdateEvent) {
        match event {
            UpdateEvent::Init if !self.wanted => {
                self.wanted = true;
                if self.tracker.state.is_some() {
                    self.catch_up().await;
                } else {
                    self.fetch_state().await;
                }
            }
            UpdateEvent::Init => {}
            UpdateEvent::SignedIn => {
                if self.wanted && self.tracker.state.is_none() {
                    self.fetch_state().await;
                }
            }
            UpdateEvent::Reconnected => {
                if self.wanted && self.tracker.state.is_some() {
                    self.catch_up().await;
                }
            }
            UpdateEvent::Push(updates) => {
                let applied = match self.tracker.apply(&updates, &self.peers) {
                    Ok(applied) => applied,
                    Err(e) => {
                        tracing::warn!("[tgcore] malformed {}: {e}", updates.name());
                        return;
                    }
                };
                for update in applied.updates {
                    self.hub.publish(update).await;
                }
                if applied.changed {
                    self.persist();
                }
                if applied.gap {
                    self.catch_up().await;
                }
            }
        }
    }

    async fn fetch_state(&mut self) {
        match self.dispatcher.call_object(&GetState {}, None).await {
            Ok(state) => match UpdateState::from_tl(&state) {
                Ok(state) => {
                    tracing::info!("[tgcore] update state: pts={} qts={} seq={}", state.pts, state.qts, state.seq);
                    self.tracker.state = Some(state);
                    self.persist();
                }
                Err(e) => tracing::warn!("[tgcore] malformed updates.state: {e}"),
            },
            Err(InvocationError::AuthRequired(_)) => tracing::debug!("[tgcore] not signed in, no update state yet"),
            Err(e) => tracing::warn!("[tgcore] updates.getState failed: {e}"),
        }
    }

    /// Fetch everything after the current state with `updates.getDifference`,
    /// following slices until the server reports the end.
    async fn catch_up(&mut self) {
        while let Some(state) = self.tracker.state {
            let request = GetDifference { pts: state.pts, date: state.date, qts: state.qts };
            tracing::info!("[tgcore] getDifference (pts={}, date={}, qts={})", state.pts, state.date, state.qts);
            let difference = match self.dispatcher.call_object(&request, None).await {
                Ok(difference) => difference,
                Err(e) => {
                    tracing::warn!("[tgcore] getDifference failed: {e}");
                    return;
                }
            };
            match self.apply_difference(&difference).await {
                Ok(more) => {
                    self.persist();
                    if !more {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("[tgcore] malformed {}: {e}", difference.name());
                    return;
                }
            }
        }
    }

    /// Deliver a difference and adopt its state. Returns whether another
    /// slice follows.
    async fn apply_difference(&mut self, difference: &TlObject) -> Result<bool, tgcore_tl::Error> {
        let Some(state) = self.tracker.state.as_mut() else { return Ok(false) };
        match difference.name() {
            "updates.differenceEmpty" => {
                state.date = difference.int("date")?;
                state.seq = difference.int("seq")?;
                Ok(false)
            }
            "updates.differenceTooLong" => {
                tracing::warn!("[tgcore] difference too long, skipping to the current pts");
                state.pts = difference.int("pts")?;
                Ok(true)
            }
            name @ ("updates.difference" | "updates.differenceSlice") => {
                let slice = name == "updates.differenceSlice";
                let next = UpdateState::from_tl(difference.object(if slice { "intermediate_state" } else { "state" })?)?;
                locked(&self.peers).cache_response(difference);
                let users = UserIndex::new(difference.vector("users")?);

                let messages = difference.vector("new_messages")?;
                let others = difference.vector("other_updates")?;
                tracing::info!("[tgcore] difference: {} messages, {} updates", messages.len(), others.len());
                let mut updates = Vec::new();
                for message in messages.iter().filter_map(TlValue::as_object) {
                    if let Some(message) = Message::from_tl(message, &users)? {
                        updates.push(Update::NewMessage(message));
                    }
                }
                for update in others.iter().filter_map(TlValue::as_object) {
                    updates.extend(convert(update, &users)?);
                }
                for update in updates {
                    self.hub.publish(update).await;
                }
                self.tracker.state = Some(next);
                Ok(slice)
            }
            other => Err(tgcore_tl::Error::UnexpectedConstructor {
                id: difference.id(),
                expected: format!("updates.Difference, got {other}"),
            }),
        }
    }

    fn persist(&self) {
        let state = self.tracker.state;
        self.session.update_in_background(|data| data.update_state = state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(id: i32, pts: i32, pts_count: i32) -> TlObject {
        let peer = TlObject::builder("peerUser").unwrap().set("user_id", 9i64).build().unwrap();
        let message = TlObject::builder("message")
            .unwrap()
            .set("id", id)
            .set("peer_id", peer)
            .set("date", 1_700_000_000)
            .set("message", format!("m{id}"))
            .build()
            .unwrap();
        TlObject::builder("updateNewMessage")
            .unwrap()
            .set("message", message)
            .set("pts", pts)
            .set("pts_count", pts_count)
            .build()
            .unwrap()
    }

    fn container(updates: Vec<TlObject>, seq: i32) -> TlObject {
        TlObject::builder("updates")
            .unwrap()
            .set("updates", updates.into_iter().map(TlValue::Object).collect::<Vec<_>>())
            .set("users", Vec::<TlValue>::new())
            .set("chats", Vec::<TlValue>::new())
            .set("date", 1_700_000_100)
            .set("seq", seq)
            .build()
            .unwrap()
    }

    fn tracker(pts: i32, seq: i32) -> Tracker {
        Tracker { state: Some(UpdateState { pts, qts: 0, date: 0, seq }) }
    }

    #[test]
    fn pts_checks() {
        let state = UpdateState { pts: 10, ..UpdateState::default() };
        assert_eq!(state.check_pts(11, 1), GapCheck::Ok);
        assert_eq!(state.check_pts(10, 1), GapCheck::Duplicate);
        assert_eq!(state.check_pts(13, 1), GapCheck::Gap { expected: 11, got: 13 });
    }

    #[test]
    fn seq_checks() {
        let state = UpdateState { seq: 4, ..UpdateState::default() };
        assert_eq!(state.check_seq(5), GapCheck::Ok);
        assert_eq!(state.check_seq(0), GapCheck::Ok);
        assert_eq!(state.check_seq(4), GapCheck::Duplicate);
        assert!(matches!(state.check_seq(7), GapCheck::Gap { .. }));
    }

    #[test]
    fn in_order_updates_advance_state() {
        let peers = Mutex::new(PeerCache::default());
        let mut tracker = tracker(10, 4);
        let applied = tracker.apply(&container(vec![new_message(1, 11, 1), new_message(2, 12, 1)], 5), &peers).unwrap();
        assert!(!applied.gap);
        assert_eq!(applied.updates.len(), 2);
        assert_eq!(tracker.state.unwrap().pts, 12);
        assert_eq!(tracker.state.unwrap().seq, 5);

        let again = tracker.apply(&container(vec![new_message(2, 12, 1)], 5), &peers).unwrap();
        assert!(again.updates.is_empty() && !again.gap);
    }

    #[test]
    fn gaps_are_reported_not_delivered() {
        let peers = Mutex::new(PeerCache::default());
        let mut tracker = tracker(10, 0);
        let short = TlObject::builder("updateShort")
            .unwrap()
            .set("update", new_message(5, 15, 1))
            .set("date", 1)
            .build()
            .unwrap();
        let applied = tracker.apply(&short, &peers).unwrap();
        assert!(applied.gap);
        assert!(applied.updates.is_empty());
        assert_eq!(tracker.state.unwrap().pts, 10);

        let too_long = TlObject::builder("updatesTooLong").unwrap().build().unwrap();
        assert!(tracker.apply(&too_long, &peers).unwrap().gap);
    }

    #[test]
    fn short_messages_expand() {
        let short = TlObject::builder("updateShortMessage")
            .unwrap()
            .set("id", 3)
            .set("user_id", 42i64)
            .set("message", "hello")
            .set("pts", 11)
            .set("pts_count", 1)
            .set("date", 1_700_000_000)
            .build()
            .unwrap();
        let peers = Mutex::new(PeerCache::default());
        let applied = tracker(10, 0).apply(&short, &peers).unwrap();
        match &applied.updates[..] {
            [Update::NewMessage(m)] => {
                assert_eq!(m.text, "hello");
                assert_eq!(m.chat_id, 42);
                assert_eq!(m.sender_id, Some(42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn without_state_everything_is_delivered() {
        let peers = Mutex::new(PeerCache::default());
        let mut tracker = Tracker::default();
        let applied = tracker.apply(&container(vec![new_message(1, 500, 1)], 77), &peers).unwrap();
        assert_eq!(applied.updates.len(), 1);
        assert!(!applied.gap && !applied.changed);
    }

    fn status(user_id: i64) -> Update {
        Update::UserStatus { user_id, status: UserStatus::Recently }
    }

    #[tokio::test]
    async fn drop_oldest_counts_evictions() {
        let hub = UpdateHub::new(2, Backpressure::DropOldest);
        let mut sub = hub.subscribe();
        for id in 1..=5 {
            hub.publish(status(id)).await;
        }
        assert_eq!(sub.dropped(), 3);
        assert_eq!(sub.next().await, Some(status(4)));
        assert_eq!(sub.next().await, Some(status(5)));
        assert_eq!(sub.try_next(), None);
    }

    #[tokio::test]
    async fn block_publisher_waits_for_room() {
        let hub = UpdateHub::new(1, Backpressure::BlockPublisher);
        let mut sub = hub.subscribe();
        hub.publish(status(1)).await;

        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.publish(status(2)).await })
        };
        tokio::task::yield_now().await;
        assert!(!publisher.is_finished());

        assert_eq!(sub.next().await, Some(status(1)));
        publisher.await.unwrap();
        assert_eq!(sub.next().await, Some(status(2)));
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_update() {
        let hub = UpdateHub::new(8, Backpressure::DropOldest);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        hub.publish(status(1)).await;
        assert_eq!(first.next().await, Some(status(1)));
        assert_eq!(second.next().await, Some(status(1)));

        drop(second);
        assert_eq!(locked(&hub.slots).len(), 1);

        hub.close();
        assert_eq!(first.next().await, None);
    }
}
