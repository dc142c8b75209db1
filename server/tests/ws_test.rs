//! End-to-end tests over a live server: in-band authentication, room
//! presence, message flow, typing, and user status fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tandem_realtime::auth::jwt;
use tandem_realtime::presence::rooms::RoomTracker;
use tandem_realtime::presence::PresenceRegistry;
use tandem_realtime::state::AppState;
use tandem_realtime::store::SqliteStore;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JWT_SECRET: &[u8] = b"integration-test-secret-32bytes!";

/// Start the server on a random port, seeded with alice, bob and carol
/// plus one group ("team": alice + bob). Returns the bound address.
async fn start_test_server() -> (SocketAddr, SqliteStore) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = tandem_realtime::db::init_db(&data_dir).expect("Failed to init DB");
    let store = SqliteStore::new(db);
    store.create_user("alice", "Alice").expect("seed alice");
    store.create_user("bob", "Bob").expect("seed bob");
    store.create_user("carol", "Carol").expect("seed carol");
    store
        .create_group("team", "Team", &["alice", "bob"], &["alice"])
        .expect("seed group");

    let state = AppState {
        store: Arc::new(store.clone()),
        presence: PresenceRegistry::new(),
        rooms: RoomTracker::new(),
        jwt_secret: JWT_SECRET.to_vec(),
    };

    let app = tandem_realtime::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    (addr, store)
}

fn token_for(user: &str) -> String {
    jwt::issue_access_token(JWT_SECRET, user, 3600).expect("Failed to issue token")
}

async fn connect(addr: SocketAddr) -> WsClient {
    let ws_url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Read the next JSON frame, skipping transport pings.
async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Stream ended unexpectedly")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("Frame should be valid JSON")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}

/// Read frames until one of the wanted type arrives. Unrelated pushes
/// (e.g. presence) are discarded.
async fn recv_until(ws: &mut WsClient, wanted: &str) -> Value {
    for _ in 0..10 {
        let frame = recv_json(ws).await;
        if frame["type"] == wanted {
            return frame;
        }
    }
    panic!("Did not receive a {} frame", wanted);
}

/// Assert that no frame arrives within a short window.
async fn assert_silent(ws: &mut WsClient) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "Expected silence, got {:?}", result);
}

async fn connect_and_auth(addr: SocketAddr, user: &str) -> WsClient {
    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({
            "type": "authenticate",
            "request_id": "auth-1",
            "token": token_for(user),
        }),
    )
    .await;
    let reply = recv_until(&mut ws, "authenticated").await;
    assert_eq!(reply["user_id"], user);
    ws
}

#[tokio::test]
async fn test_authenticate_echoes_request_id() {
    let (addr, _store) = start_test_server().await;
    let mut ws = connect(addr).await;

    send_json(
        &mut ws,
        json!({
            "type": "authenticate",
            "request_id": "my-auth-42",
            "token": token_for("alice"),
        }),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "authenticated");
    assert_eq!(reply["request_id"], "my-auth-42");
    assert_eq!(reply["user_id"], "alice");
}

#[tokio::test]
async fn test_auth_failures_leave_session_open_for_retry() {
    let (addr, _store) = start_test_server().await;
    let mut ws = connect(addr).await;

    // Garbage token
    send_json(
        &mut ws,
        json!({ "type": "authenticate", "request_id": "a1", "token": "not-a-jwt" }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "authError");
    assert_eq!(reply["reason"], "token invalid");

    // Expired token (far enough past to clear validation leeway)
    let expired = jwt::issue_access_token(JWT_SECRET, "alice", -120).expect("issue");
    send_json(
        &mut ws,
        json!({ "type": "authenticate", "request_id": "a2", "token": expired }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "authError");
    assert_eq!(reply["reason"], "token expired");

    // Well-signed token for an unprovisioned user
    send_json(
        &mut ws,
        json!({ "type": "authenticate", "request_id": "a3", "token": token_for("mallory") }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "authError");
    assert_eq!(reply["reason"], "unknown user");

    // The connection survives failed attempts; a good token still works.
    send_json(
        &mut ws,
        json!({ "type": "authenticate", "request_id": "a4", "token": token_for("alice") }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "authenticated");
    assert_eq!(reply["request_id"], "a4");
}

#[tokio::test]
async fn test_events_before_authentication_are_rejected() {
    let (addr, _store) = start_test_server().await;
    let mut ws = connect(addr).await;

    send_json(
        &mut ws,
        json!({
            "type": "sendMessage",
            "request_id": "early-1",
            "content": "too soon",
            "group_id": "team",
        }),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "unauthenticated");
    assert_eq!(reply["request_id"], "early-1");
}

#[tokio::test]
async fn test_group_flow_presence_messages_and_typing() {
    let (addr, _store) = start_test_server().await;
    let mut alice = connect_and_auth(addr, "alice").await;
    let mut bob = connect_and_auth(addr, "bob").await;

    // Bob joins first and is alone in the room.
    send_json(
        &mut bob,
        json!({ "type": "joinRoom", "request_id": "join-b", "room": "grp:team" }),
    )
    .await;
    let reply = recv_until(&mut bob, "roomPresence").await;
    assert_eq!(reply["request_id"], "join-b");
    assert_eq!(reply["room"], "grp:team");
    assert_eq!(reply["online_members"], json!(["bob"]));

    // Alice joins; she gets the correlated snapshot, bob gets a push.
    send_json(
        &mut alice,
        json!({ "type": "joinRoom", "request_id": "join-a", "room": "grp:team" }),
    )
    .await;
    let reply = recv_until(&mut alice, "roomPresence").await;
    assert_eq!(reply["request_id"], "join-a");
    assert_eq!(reply["online_members"], json!(["alice", "bob"]));

    let push = recv_until(&mut bob, "roomPresence").await;
    assert_eq!(push["request_id"], "");
    assert_eq!(push["online_members"], json!(["alice", "bob"]));

    // Alice sends. Her own session sees the fan-out copy strictly
    // before the ack, both on the same ordered stream.
    send_json(
        &mut alice,
        json!({
            "type": "sendMessage",
            "request_id": "send-1",
            "content": "hello crew",
            "group_id": "team",
        }),
    )
    .await;

    let first = recv_json(&mut alice).await;
    assert_eq!(first["type"], "newMessage");
    assert_eq!(first["message"]["content"], "hello crew");
    assert_eq!(first["message"]["room_sequence"], 1);

    let second = recv_json(&mut alice).await;
    assert_eq!(second["type"], "sendAck");
    assert_eq!(second["request_id"], "send-1");
    assert_eq!(second["message"]["id"], first["message"]["id"]);

    let pushed = recv_until(&mut bob, "newMessage").await;
    assert_eq!(pushed["message"]["content"], "hello crew");
    assert_eq!(pushed["message"]["sender_id"], "alice");

    // Typing is relayed to the room but never echoed to the origin.
    send_json(
        &mut bob,
        json!({ "type": "typingStart", "request_id": "", "room": "grp:team" }),
    )
    .await;
    let typing = recv_until(&mut alice, "typingIndicator").await;
    assert_eq!(typing["user_id"], "bob");
    assert_eq!(typing["is_typing"], true);
    assert_silent(&mut bob).await;

    // Bob leaves: he gets a fresh snapshot, alice gets the push.
    send_json(
        &mut bob,
        json!({ "type": "leaveRoom", "request_id": "leave-b", "room": "grp:team" }),
    )
    .await;
    let reply = recv_until(&mut bob, "roomPresence").await;
    assert_eq!(reply["request_id"], "leave-b");
    assert_eq!(reply["online_members"], json!(["alice"]));

    let push = recv_until(&mut alice, "roomPresence").await;
    assert_eq!(push["online_members"], json!(["alice"]));
}

#[tokio::test]
async fn test_join_is_authorized_against_the_store() {
    let (addr, _store) = start_test_server().await;
    let mut carol = connect_and_auth(addr, "carol").await;

    send_json(
        &mut carol,
        json!({ "type": "joinRoom", "request_id": "j1", "room": "grp:team" }),
    )
    .await;
    let reply = recv_json(&mut carol).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "not_member");
    assert_eq!(reply["request_id"], "j1");

    send_json(
        &mut carol,
        json!({ "type": "joinRoom", "request_id": "j2", "room": "garbage" }),
    )
    .await;
    let reply = recv_json(&mut carol).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "bad_room");
}

#[tokio::test]
async fn test_direct_message_reaches_offline_recipient_via_history() {
    let (addr, _store) = start_test_server().await;
    let mut alice = connect_and_auth(addr, "alice").await;

    // Bob is offline; delivery degrades to persistence only.
    for (rid, text) in [("d1", "are you there"), ("d2", "still here")] {
        send_json(
            &mut alice,
            json!({
                "type": "sendMessage",
                "request_id": rid,
                "content": text,
                "recipient_id": "bob",
            }),
        )
        .await;
        let ack = recv_until(&mut alice, "sendAck").await;
        assert_eq!(ack["request_id"], rid);
    }

    // Bob reconnects and pulls what he missed.
    let mut bob = connect_and_auth(addr, "bob").await;
    send_json(
        &mut bob,
        json!({ "type": "fetchHistory", "request_id": "h1", "room": "dm:alice:bob" }),
    )
    .await;
    let history = recv_until(&mut bob, "history").await;
    assert_eq!(history["request_id"], "h1");
    assert_eq!(history["room"], "dm:alice:bob");
    assert_eq!(history["has_more"], false);

    let messages = history["messages"].as_array().expect("messages array");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "still here", "Newest first");
    assert_eq!(messages[1]["content"], "are you there");
}

#[tokio::test]
async fn test_user_status_reaches_contacts_only() {
    let (addr, _store) = start_test_server().await;
    let mut alice = connect_and_auth(addr, "alice").await;

    // Bob shares a group with alice: she sees his transition, and his
    // own snapshot names her as already online.
    let mut bob = connect_and_auth(addr, "bob").await;
    let status = recv_until(&mut alice, "userStatus").await;
    assert_eq!(status["user_id"], "bob");
    assert_eq!(status["is_online"], true);

    let snapshot = recv_until(&mut bob, "userStatus").await;
    assert_eq!(snapshot["user_id"], "alice");
    assert_eq!(snapshot["is_online"], true);

    // Carol shares nothing with alice; her arrival is invisible.
    let _carol = connect_and_auth(addr, "carol").await;
    assert_silent(&mut alice).await;

    // Bob disconnecting flips him offline for his contacts, exactly once.
    bob.close(None).await.expect("close bob");
    let status = recv_until(&mut alice, "userStatus").await;
    assert_eq!(status["user_id"], "bob");
    assert_eq!(status["is_online"], false);
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_multi_device_offline_fires_after_last_session() {
    let (addr, _store) = start_test_server().await;
    let mut alice = connect_and_auth(addr, "alice").await;

    let mut bob_desktop = connect_and_auth(addr, "bob").await;
    let status = recv_until(&mut alice, "userStatus").await;
    assert_eq!(status["user_id"], "bob");
    assert_eq!(status["is_online"], true);

    // A second device changes nothing for contacts.
    let mut bob_phone = connect_and_auth(addr, "bob").await;
    assert_silent(&mut alice).await;

    // Nor does closing it while the first is still up.
    bob_phone.close(None).await.expect("close phone");
    assert_silent(&mut alice).await;

    bob_desktop.close(None).await.expect("close desktop");
    let status = recv_until(&mut alice, "userStatus").await;
    assert_eq!(status["user_id"], "bob");
    assert_eq!(status["is_online"], false);
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_edit_delete_react_and_read_over_the_wire() {
    let (addr, _store) = start_test_server().await;
    let mut alice = connect_and_auth(addr, "alice").await;
    let mut bob = connect_and_auth(addr, "bob").await;

    send_json(
        &mut alice,
        json!({
            "type": "sendMessage",
            "request_id": "s1",
            "content": "v1",
            "group_id": "team",
        }),
    )
    .await;
    let ack = recv_until(&mut alice, "sendAck").await;
    let message_id = ack["message"]["id"].as_str().expect("id").to_string();
    recv_until(&mut bob, "newMessage").await;

    // Edit: the requester sees the push copy first, then the reply.
    send_json(
        &mut alice,
        json!({
            "type": "editMessage",
            "request_id": "e1",
            "message_id": message_id,
            "content": "v2",
        }),
    )
    .await;
    let push = recv_until(&mut alice, "messageEdited").await;
    assert_eq!(push["request_id"], "");
    assert_eq!(push["content"], "v2");
    let reply = recv_until(&mut alice, "messageEdited").await;
    assert_eq!(reply["request_id"], "e1");

    let seen = recv_until(&mut bob, "messageEdited").await;
    assert_eq!(seen["message_id"], message_id.as_str());
    assert_eq!(seen["content"], "v2");

    // Reaction from bob fans out to alice.
    send_json(
        &mut bob,
        json!({
            "type": "react",
            "request_id": "r1",
            "message_id": message_id,
            "reaction": "👍",
        }),
    )
    .await;
    let seen = recv_until(&mut alice, "reactionUpdated").await;
    assert_eq!(seen["user_id"], "bob");
    assert_eq!(seen["reaction"], "👍");

    // Read receipt from bob fans out to alice.
    send_json(
        &mut bob,
        json!({ "type": "markRead", "request_id": "m1", "message_id": message_id }),
    )
    .await;
    let seen = recv_until(&mut alice, "messageRead").await;
    assert_eq!(seen["user_id"], "bob");
    assert_eq!(seen["message_id"], message_id.as_str());

    // Deletion fans out to everyone.
    send_json(
        &mut alice,
        json!({ "type": "deleteMessage", "request_id": "del1", "message_id": message_id }),
    )
    .await;
    let seen = recv_until(&mut bob, "messageDeleted").await;
    assert_eq!(seen["message_id"], message_id.as_str());
}

#[tokio::test]
async fn test_healthz() {
    let (addr, _store) = start_test_server().await;

    let resp = reqwest::get(format!("http://{}/healthz", addr))
        .await
        .expect("healthz request");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");
}
