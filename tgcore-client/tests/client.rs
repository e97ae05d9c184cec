mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tgcore_client::requests::{GetDifference, GetState};
use tgcore_client::session::MemorySessionStore;
use tgcore_client::{Client, InvocationError, LoginToken, TlValue};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn connected(home: i32, dcs: &[i32]) -> (Client, ServerConn, Listener, Arc<MemorySessionStore>) {
    connected_with(home, dcs, settings()).await
}

async fn connected_with(
    home: i32,
    dcs: &[i32],
    settings: tgcore_client::Settings,
) -> (Client, ServerConn, Listener, Arc<MemorySessionStore>) {
    let (connector, mut listener) = network();
    let store = Arc::new(MemorySessionStore::with_session(session_with_keys(home, dcs)));
    let connecting = tokio::spawn(Client::connect(config(connector, &store, settings)));
    let conn = listener.accept().await;
    let client = connecting.await.unwrap().unwrap();
    (client, conn, listener, store)
}

fn state_seq(value: &TlValue) -> i32 {
    value.as_object().unwrap().int("seq").unwrap()
}

#[tokio::test]
async fn sign_in_with_cloud_password() {
    let (client, mut server, _listener, store) = connected(2, &[2]).await;
    let srp = SrpServer::new("hunter2");

    let c = client.clone();
    let requesting = tokio::spawn(async move { c.request_code("+15550001").await });
    let req = server.expect("auth.sendCode").await;
    assert_eq!(req.query.string("phone_number").unwrap(), "+15550001");
    assert_eq!(req.query.int("api_id").unwrap(), 4242);
    let sent = object("auth.sentCode")
        .set("type", object("auth.sentCodeTypeSms").set("length", 5).build().unwrap())
        .set("phone_code_hash", "hash-1")
        .build()
        .unwrap();
    server.reply(req.msg_id, &sent).await;
    let token = requesting.await.unwrap().unwrap();
    assert_eq!(token, LoginToken { phone: "+15550001".into(), phone_code_hash: "hash-1".into() });

    // Without a password the call reports the hint.
    let (c, t) = (client.clone(), token.clone());
    let signing = tokio::spawn(async move { c.sign_in(&t, "12345", None).await });
    let req = server.expect("auth.signIn").await;
    assert_eq!(req.query.string("phone_code_hash").unwrap(), "hash-1");
    server.reply_error(req.msg_id, 401, "SESSION_PASSWORD_NEEDED").await;
    let req = server.expect("account.getPassword").await;
    server.reply(req.msg_id, &srp.account_password("pet name")).await;
    match signing.await.unwrap() {
        Err(InvocationError::TwoFactorRequired { hint }) => assert_eq!(hint.as_deref(), Some("pet name")),
        other => panic!("expected TwoFactorRequired, got {other:?}"),
    }

    // With it, the SRP proof is sent.
    let (c, t) = (client.clone(), token.clone());
    let signing = tokio::spawn(async move { c.sign_in(&t, "12345", Some("hunter2")).await });
    let req = server.expect("auth.signIn").await;
    server.reply_error(req.msg_id, 401, "SESSION_PASSWORD_NEEDED").await;
    let req = server.expect("account.getPassword").await;
    server.reply(req.msg_id, &srp.account_password("pet name")).await;
    let req = server.expect("auth.checkPassword").await;
    assert!(srp.verify(req.query.object("password").unwrap()), "password proof rejected");
    let authorization = object("auth.authorization").set("user", user(900, "Ada")).build().unwrap();
    server.reply(req.msg_id, &authorization).await;

    let me = signing.await.unwrap().unwrap();
    assert_eq!(me.id, 900);
    assert_eq!(me.first_name.as_deref(), Some("Ada"));
    assert_eq!(store.snapshot().unwrap().user_id, Some(900));
}

#[tokio::test]
async fn wrong_code_is_reported() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;
    let token = LoginToken { phone: "+15550001".into(), phone_code_hash: "hash-1".into() };
    let signing = tokio::spawn(async move { client.sign_in(&token, "00000", None).await });
    let req = server.expect("auth.signIn").await;
    server.reply_error(req.msg_id, 400, "PHONE_CODE_INVALID").await;
    assert!(matches!(signing.await.unwrap(), Err(InvocationError::InvalidCode)));
}

#[tokio::test]
async fn is_authorized_checks_the_key() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;

    let c = client.clone();
    let checking = tokio::spawn(async move { c.is_authorized().await });
    let req = server.expect("updates.getState").await;
    server.reply_error(req.msg_id, 401, "AUTH_KEY_UNREGISTERED").await;
    assert!(!checking.await.unwrap().unwrap());

    let checking = tokio::spawn(async move { client.is_authorized().await });
    let req = server.expect("updates.getState").await;
    server.reply(req.msg_id, &update_state(1, 1)).await;
    assert!(checking.await.unwrap().unwrap());
}

#[tokio::test]
async fn calls_outstanding_at_reconnect_are_resent_in_order() {
    let (client, mut server, mut listener, _store) = connected(2, &[2]).await;

    let mut calls = Vec::new();
    for pts in 1..=3 {
        let c = client.clone();
        calls.push(tokio::spawn(async move { c.invoke(&GetDifference { pts, date: 0, qts: 0 }).await }));
        let req = server.expect("updates.getDifference").await;
        assert_eq!(req.query.int("pts").unwrap(), pts);
    }
    drop(server);

    let mut server = listener.accept().await;
    assert_eq!(server.dc_id, 2);
    let mut resent = Vec::new();
    for _ in 0..3 {
        resent.push(server.expect("updates.getDifference").await);
    }
    let order: Vec<i32> = resent.iter().map(|r| r.query.int("pts").unwrap()).collect();
    assert_eq!(order, [1, 2, 3]);

    for req in resent.iter().rev() {
        let pts = req.query.int("pts").unwrap();
        server.reply(req.msg_id, &difference_empty(pts * 10)).await;
    }
    for (call, pts) in calls.into_iter().zip(1..) {
        let value = call.await.unwrap().unwrap();
        assert_eq!(state_seq(&value), pts * 10);
    }
    assert!(client.pending_calls().is_empty());
}

#[tokio::test]
async fn replayed_frames_are_ignored_and_altered_ones_reconnect() {
    let (client, mut server, mut listener, _store) = connected(2, &[2]).await;

    let c = client.clone();
    let first = tokio::spawn(async move { c.invoke(&GetState {}).await });
    let req = server.expect("updates.getState").await;
    let frame = server.sealed_reply(req.msg_id, &update_state(5, 7));
    server.write_frame(&frame).await;
    server.write_frame(&frame).await;
    assert_eq!(state_seq(&first.await.unwrap().unwrap()), 7);

    // The replay did not cost the connection: the next call uses it.
    let c = client.clone();
    let second = tokio::spawn(async move { c.invoke(&GetDifference { pts: 5, date: 0, qts: 0 }).await });
    let req = server.expect("updates.getDifference").await;
    let mut altered = server.sealed_reply(req.msg_id, &difference_empty(1));
    altered[40] ^= 0x80;
    server.write_frame(&altered).await;
    assert!(server.next_request().await.is_none());

    let mut server = listener.accept().await;
    let req = server.expect("updates.getDifference").await;
    assert_eq!(req.query.int("pts").unwrap(), 5);
    server.reply(req.msg_id, &difference_empty(8)).await;
    assert_eq!(state_seq(&second.await.unwrap().unwrap()), 8);
    assert!(client.pending_calls().is_empty());
}

#[tokio::test]
async fn migrate_error_moves_the_home_dc() {
    let (client, mut server, mut listener, store) = connected(2, &[2, 4]).await;

    let c = client.clone();
    let requesting = tokio::spawn(async move { c.request_code("+15550001").await });
    let req = server.expect("auth.sendCode").await;
    server.reply_error(req.msg_id, 303, "PHONE_MIGRATE_4").await;

    let mut dc4 = listener.accept().await;
    assert_eq!(dc4.dc_id, 4);
    let req = dc4.expect("auth.sendCode").await;
    let sent = object("auth.sentCode")
        .set("type", object("auth.sentCodeTypeSms").set("length", 5).build().unwrap())
        .set("phone_code_hash", "from-dc4")
        .build()
        .unwrap();
    dc4.reply(req.msg_id, &sent).await;

    assert_eq!(requesting.await.unwrap().unwrap().phone_code_hash, "from-dc4");
    assert_eq!(client.session().home_dc_id, 4);
    assert_eq!(store.snapshot().unwrap().home_dc_id, 4);
}

#[tokio::test]
async fn redirect_loops_are_bounded() {
    let settings = tgcore_client::Settings { max_redirects: 2, ..settings() };
    let (client, mut server, _listener, _store) = connected_with(2, &[2], settings).await;

    let calling = tokio::spawn(async move { client.invoke(&GetState {}).await });
    for _ in 0..3 {
        let req = server.expect("updates.getState").await;
        server.reply_error(req.msg_id, 303, "USER_MIGRATE_2").await;
    }
    assert!(matches!(calling.await.unwrap(), Err(InvocationError::TooManyRedirects { dc_id: 2 })));
}

#[tokio::test(start_paused = true)]
async fn short_flood_waits_are_slept_through() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;

    let c = client.clone();
    let calling = tokio::spawn(async move { c.invoke(&GetState {}).await });
    let req = server.expect("updates.getState").await;
    let flooded_at = Instant::now();
    server.reply_error(req.msg_id, 420, "FLOOD_WAIT_30").await;

    let req = server.expect("updates.getState").await;
    assert!(flooded_at.elapsed() >= Duration::from_secs(30));
    server.reply(req.msg_id, &update_state(5, 1)).await;
    assert!(calling.await.unwrap().is_ok());

    // Above the threshold the wait is the caller's problem.
    let calling = tokio::spawn(async move { client.invoke(&GetState {}).await });
    let req = server.expect("updates.getState").await;
    server.reply_error(req.msg_id, 420, "FLOOD_WAIT_120").await;
    assert!(matches!(calling.await.unwrap(), Err(InvocationError::FloodWait(120))));
}

#[tokio::test]
async fn prepared_call_completes_once() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;
    let call = Arc::new(client.prepare(&GetState {}).unwrap());

    let (c, p) = (client.clone(), Arc::clone(&call));
    let first = tokio::spawn(async move { c.dispatch(&p).await });
    let req = server.expect("updates.getState").await;

    // In flight.
    assert!(matches!(client.dispatch(&call).await, Err(InvocationError::StaleCall)));

    server.reply(req.msg_id, &update_state(3, 1)).await;
    assert!(first.await.unwrap().is_ok());
    assert!(call.is_completed());
    assert!(matches!(client.dispatch(&call).await, Err(InvocationError::StaleCall)));
}

#[tokio::test]
async fn cancelling_one_call_leaves_others_alone() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;

    let token = CancellationToken::new();
    let cancellable = client.cancellable(token.clone());
    let cancelled = tokio::spawn(async move { cancellable.invoke(&GetState {}).await });
    let abandoned = server.expect("updates.getState").await;
    token.cancel();
    assert!(matches!(cancelled.await.unwrap(), Err(InvocationError::Cancelled)));
    assert!(client.pending_calls().is_empty());

    let c = client.clone();
    let next = tokio::spawn(async move { c.invoke(&GetState {}).await });
    let req = server.expect("updates.getState").await;
    // A late answer for the cancelled call is ignored.
    server.reply(abandoned.msg_id, &update_state(1, 1)).await;
    server.reply(req.msg_id, &update_state(2, 7)).await;
    assert_eq!(state_seq(&next.await.unwrap().unwrap()), 7);
}

#[tokio::test]
async fn send_message_reports_the_new_id() {
    let (client, mut server, _listener, _store) = connected(2, &[2]).await;

    let sending = tokio::spawn(async move { client.send_message(901, "hello").await });
    let req = server.expect("messages.sendMessage").await;
    let peer = req.query.object("peer").unwrap();
    assert_eq!(peer.name(), "inputPeerUser");
    assert_eq!(peer.long("user_id").unwrap(), 901);
    assert_eq!(req.query.string("message").unwrap(), "hello");

    let random_id = req.query.long("random_id").unwrap();
    let updates = object("updates")
        .set(
            "updates",
            vec![TlValue::Object(object("updateMessageID").set("id", 55).set("random_id", random_id).build().unwrap())],
        )
        .set("users", Vec::<TlValue>::new())
        .set("chats", Vec::<TlValue>::new())
        .set("date", 1_700_000_500)
        .set("seq", 0)
        .build()
        .unwrap();
    server.reply(req.msg_id, &updates).await;

    let sent = sending.await.unwrap().unwrap();
    assert_eq!((sent.id, sent.chat_id, sent.text.as_str()), (55, 901, "hello"));
}

#[tokio::test]
async fn log_out_deletes_the_session() {
    let (client, mut server, _listener, store) = connected(2, &[2]).await;

    let c = client.clone();
    let logging_out = tokio::spawn(async move { c.log_out().await });
    let req = server.expect("auth.logOut").await;
    server.reply(req.msg_id, &object("auth.loggedOut").build().unwrap()).await;
    logging_out.await.unwrap().unwrap();

    assert!(store.snapshot().is_none());
    assert!(matches!(client.invoke(&GetState {}).await, Err(InvocationError::Disconnected)));
}

#[tokio::test]
async fn untrusted_server_key_aborts_connect() {
    let (connector, mut listener) = network();
    let store = Arc::new(MemorySessionStore::new());
    let connecting = tokio::spawn(Client::connect(config(connector, &store, settings())));

    let mut server = listener.accept().await;
    answer_req_pq(&mut server, &[0x0bad_f00d]).await;

    match connecting.await.unwrap() {
        Err(InvocationError::UntrustedServer { fingerprints }) => assert_eq!(fingerprints, [0x0bad_f00d]),
        Err(other) => panic!("expected UntrustedServer, got {other}"),
        Ok(_) => panic!("connected to an untrusted server"),
    }
}
