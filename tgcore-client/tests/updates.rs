mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tgcore_client::session::MemorySessionStore;
use tgcore_client::{Client, TlObject, TlValue, Update, UpdateState};

fn new_message(id: i32, pts: i32) -> TlObject {
    object("updateNewMessage")
        .set("message", text_message(id, 501, &format!("message {id}")))
        .set("pts", pts)
        .set("pts_count", 1)
        .build()
        .unwrap()
}

fn updates(list: Vec<TlObject>) -> TlObject {
    object("updates")
        .set("updates", list.into_iter().map(TlValue::Object).collect::<Vec<_>>())
        .set("users", vec![TlValue::Object(user(501, "Grace"))])
        .set("chats", Vec::<TlValue>::new())
        .set("date", 1_700_000_100)
        .set("seq", 0)
        .build()
        .unwrap()
}

fn difference(messages: &[i32], pts: i32) -> TlObject {
    object("updates.difference")
        .set(
            "new_messages",
            messages.iter().map(|&id| TlValue::Object(text_message(id, 501, &format!("message {id}")))).collect::<Vec<_>>(),
        )
        .set("new_encrypted_messages", Vec::<TlValue>::new())
        .set("other_updates", Vec::<TlValue>::new())
        .set("chats", Vec::<TlValue>::new())
        .set("users", vec![TlValue::Object(user(501, "Grace"))])
        .set("state", update_state(pts, 0))
        .build()
        .unwrap()
}

async fn next_message_id(sub: &mut tgcore_client::Subscription) -> i32 {
    match tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
        Ok(Some(Update::NewMessage(message))) => message.id,
        other => panic!("expected a new message, got {other:?}"),
    }
}

async fn persisted_pts(store: &MemorySessionStore, pts: i32) {
    for _ in 0..100 {
        if store.snapshot().and_then(|s| s.update_state).map(|s| s.pts) == Some(pts) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pts {pts} was never persisted");
}

#[tokio::test]
async fn gaps_are_filled_in_order() {
    let (connector, mut listener) = network();
    let mut session = session_with_keys(2, &[2]);
    session.update_state = Some(UpdateState { pts: 10, qts: 0, date: 1_700_000_000, seq: 0 });
    let store = Arc::new(MemorySessionStore::with_session(session));
    let connecting = tokio::spawn(Client::connect(config(connector, &store, settings())));
    let mut server = listener.accept().await;
    let client = connecting.await.unwrap().unwrap();

    // The first subscription catches up from the saved state.
    let mut sub = client.subscribe();
    let req = server.expect("updates.getDifference").await;
    assert_eq!(req.query.int("pts").unwrap(), 10);
    server.reply(req.msg_id, &difference_empty(0)).await;

    server.push(&updates(vec![new_message(11, 11)])).await;
    assert_eq!(next_message_id(&mut sub).await, 11);

    // A repeat of pts 11 is dropped.
    server.push(&updates(vec![new_message(11, 11)])).await;
    server.push(&updates(vec![new_message(12, 12)])).await;
    assert_eq!(next_message_id(&mut sub).await, 12);
    persisted_pts(&store, 12).await;

    // 15 skips 13 and 14.
    server.push(&updates(vec![new_message(15, 15)])).await;
    let req = server.expect("updates.getDifference").await;
    assert_eq!(req.query.int("pts").unwrap(), 12);
    server.reply(req.msg_id, &difference(&[13, 14, 15], 15)).await;

    for id in [13, 14, 15] {
        assert_eq!(next_message_id(&mut sub).await, id);
    }
    persisted_pts(&store, 15).await;
    assert!(sub.try_next().is_none());
}

#[tokio::test]
async fn first_subscription_fetches_the_state() {
    let (connector, mut listener) = network();
    let store = Arc::new(MemorySessionStore::with_session(session_with_keys(2, &[2])));
    let connecting = tokio::spawn(Client::connect(config(connector, &store, settings())));
    let mut server = listener.accept().await;
    let client = connecting.await.unwrap().unwrap();

    let mut first = client.subscribe();
    let mut second = client.subscribe();
    let req = server.expect("updates.getState").await;
    server.reply(req.msg_id, &update_state(40, 3)).await;
    persisted_pts(&store, 40).await;

    // Short messages are delivered to every subscriber.
    let short = object("updateShortMessage")
        .set("id", 77)
        .set("user_id", 501i64)
        .set("message", "hi")
        .set("pts", 41)
        .set("pts_count", 1)
        .set("date", 1_700_000_200)
        .build()
        .unwrap();
    server.push(&short).await;
    assert_eq!(next_message_id(&mut first).await, 77);
    assert_eq!(next_message_id(&mut second).await, 77);

    client.disconnect().await;
    assert!(first.next().await.is_none());
}
