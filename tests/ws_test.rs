//! Integration tests for the WebSocket chat protocol: auth handshake,
//! message routing, presence fan-out, and offline replay.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Helper: start the server on a random port and return (base_url, addr).
async fn start_test_server() -> (String, SocketAddr) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = chatroom_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = chatroom_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = chatroom_server::state::AppState {
        db,
        jwt_secret,
        sessions: chatroom_server::session::SessionRegistry::new(),
        groups: chatroom_server::session::GroupPresenceIndex::new(),
    };

    let app = chatroom_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), addr)
}

/// Register a user and return (token, user_id).
async fn register_user(base_url: &str, username: &str) -> (String, i64) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/auth/register", base_url))
        .json(&json!({ "username": username, "password": "password1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "Registration failed for {}", username);
    let body: serde_json::Value = resp.json().await.unwrap();
    (
        body["token"].as_str().unwrap().to_string(),
        body["user"]["id"].as_i64().unwrap(),
    )
}

async fn connect_ws(addr: &SocketAddr, token: &str) -> (WsWrite, WsRead) {
    let ws_url = format!("ws://{}/ws/chat?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream.split()
}

async fn send_frame(write: &mut WsWrite, frame: serde_json::Value) {
    write
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Wait for the next text frame of the given type, skipping frames of other
/// types (presence churn, notifications) and transport pings.
async fn expect_frame(read: &mut WsRead, frame_type: &str) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {} frame", frame_type))
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == frame_type {
                    return value;
                }
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ws_invalid_token_closed_after_upgrade() {
    let (_base_url, addr) = start_test_server().await;

    // The upgrade itself succeeds; the rejection arrives as a close frame.
    let ws_url = format!("ws://{}/ws/chat?token=garbage", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WebSocket should upgrade even with invalid token");
    let (mut _write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close message within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(
                frame.code,
                tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4002),
                "Expected close code 4002 (token invalid)"
            );
        }
        other => {
            if let Some(Ok(msg)) = other {
                assert!(msg.is_close(), "Expected close message, got: {:?}", msg);
            }
        }
    }
}

#[tokio::test]
async fn test_ws_missing_token_closed_after_upgrade() {
    let (_base_url, addr) = start_test_server().await;

    let ws_url = format!("ws://{}/ws/chat", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WebSocket should upgrade even without a token");
    let (mut _write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close message within timeout");
    if let Some(Ok(msg)) = msg {
        assert!(msg.is_close(), "Expected close message, got: {:?}", msg);
    }
}

#[tokio::test]
async fn test_private_message_delivery_and_ack() {
    let (base_url, addr) = start_test_server().await;
    let (alice_token, alice_id) = register_user(&base_url, "alice").await;
    let (bob_token, bob_id) = register_user(&base_url, "bob").await;

    let (mut alice_write, mut alice_read) = connect_ws(&addr, &alice_token).await;
    let (_bob_write, mut bob_read) = connect_ws(&addr, &bob_token).await;

    send_frame(
        &mut alice_write,
        json!({ "type": "PRIVATE_MESSAGE", "receiverId": bob_id, "content": "hi bob" }),
    )
    .await;

    let delivered = expect_frame(&mut bob_read, "PRIVATE_MESSAGE").await;
    assert_eq!(delivered["senderId"].as_i64().unwrap(), alice_id);
    assert_eq!(delivered["senderUsername"], "alice");
    assert_eq!(delivered["content"], "hi bob");
    assert!(delivered["messageId"].as_i64().unwrap() > 0);
    assert!(delivered["timestamp"].as_i64().unwrap() > 0);

    let ack = expect_frame(&mut alice_read, "PRIVATE_MESSAGE_ACK").await;
    assert_eq!(ack["receiverId"].as_i64().unwrap(), bob_id);
    assert_eq!(ack["messageId"], delivered["messageId"]);
}

#[tokio::test]
async fn test_self_message_rejected_and_not_persisted() {
    let (base_url, addr) = start_test_server().await;
    let (token, user_id) = register_user(&base_url, "narcissus").await;

    let (mut write, mut read) = connect_ws(&addr, &token).await;
    send_frame(
        &mut write,
        json!({ "type": "PRIVATE_MESSAGE", "receiverId": user_id, "content": "hello me" }),
    )
    .await;

    let error = expect_frame(&mut read, "ERROR").await;
    assert!(error["content"].as_str().unwrap().contains("yourself"));

    // Nothing was persisted.
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/messages/private/{}", base_url, user_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let messages: serde_json::Value = resp.json().await.unwrap();
    assert!(messages.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_group_message_fan_out_and_membership_gate() {
    let (base_url, addr) = start_test_server().await;
    let client = reqwest::Client::new();
    let (alice_token, alice_id) = register_user(&base_url, "alice").await;
    let (bob_token, _bob_id) = register_user(&base_url, "bob").await;
    let (eve_token, _eve_id) = register_user(&base_url, "eve").await;

    // Alice creates a group, Bob joins; Eve stays outside.
    let resp = client
        .post(format!("{}/api/groups", base_url))
        .bearer_auth(&alice_token)
        .json(&json!({ "name": "lounge" }))
        .send()
        .await
        .unwrap();
    let group: serde_json::Value = resp.json().await.unwrap();
    let group_id = group["id"].as_i64().unwrap();
    let resp = client
        .post(format!("{}/api/groups/{}/join", base_url, group_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Connecting seeds live group presence from persistent membership.
    let (mut alice_write, mut alice_read) = connect_ws(&addr, &alice_token).await;
    let (_bob_write, mut bob_read) = connect_ws(&addr, &bob_token).await;
    let (mut eve_write, mut eve_read) = connect_ws(&addr, &eve_token).await;

    send_frame(
        &mut alice_write,
        json!({ "type": "GROUP_MESSAGE", "groupId": group_id, "content": "welcome all" }),
    )
    .await;

    let delivered = expect_frame(&mut bob_read, "GROUP_MESSAGE").await;
    assert_eq!(delivered["senderId"].as_i64().unwrap(), alice_id);
    assert_eq!(delivered["groupId"].as_i64().unwrap(), group_id);
    assert_eq!(delivered["groupName"], "lounge");
    assert_eq!(delivered["content"], "welcome all");

    let ack = expect_frame(&mut alice_read, "GROUP_MESSAGE_ACK").await;
    assert_eq!(ack["groupId"].as_i64().unwrap(), group_id);

    // A non-member's group message is refused and not fanned out.
    send_frame(
        &mut eve_write,
        json!({ "type": "GROUP_MESSAGE", "groupId": group_id, "content": "let me in" }),
    )
    .await;
    let error = expect_frame(&mut eve_read, "ERROR").await;
    assert!(error["content"].as_str().unwrap().contains("not a member"));
}

#[tokio::test]
async fn test_unknown_frame_type_keeps_connection_open() {
    let (base_url, addr) = start_test_server().await;
    let (token, _user_id) = register_user(&base_url, "alice").await;

    let (mut write, mut read) = connect_ws(&addr, &token).await;

    send_frame(&mut write, json!({ "type": "TELEPORT" })).await;
    let error = expect_frame(&mut read, "ERROR").await;
    assert_eq!(error["content"], "invalid or unrecognized message type");

    // Malformed JSON gets the same answer.
    write
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    let error = expect_frame(&mut read, "ERROR").await;
    assert_eq!(error["content"], "invalid or unrecognized message type");

    // The connection still works: application-level ping round-trips.
    send_frame(&mut write, json!({ "type": "PING" })).await;
    let pong = expect_frame(&mut read, "PONG").await;
    assert!(pong["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_presence_broadcast_on_connect_and_disconnect() {
    let (base_url, addr) = start_test_server().await;
    let (alice_token, _alice_id) = register_user(&base_url, "alice").await;
    let (bob_token, bob_id) = register_user(&base_url, "bob").await;

    let (_alice_write, mut alice_read) = connect_ws(&addr, &alice_token).await;

    let (mut bob_write, _bob_read) = connect_ws(&addr, &bob_token).await;
    let online = expect_frame(&mut alice_read, "USER_ONLINE").await;
    assert_eq!(online["senderId"].as_i64().unwrap(), bob_id);
    assert_eq!(online["senderUsername"], "bob");

    bob_write.send(Message::Close(None)).await.unwrap();
    let offline = expect_frame(&mut alice_read, "USER_OFFLINE").await;
    assert_eq!(offline["senderId"].as_i64().unwrap(), bob_id);
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let (base_url, addr) = start_test_server().await;
    let (token, _user_id) = register_user(&base_url, "alice").await;

    let (_first_write, mut first_read) = connect_ws(&addr, &token).await;
    let (mut second_write, mut second_read) = connect_ws(&addr, &token).await;

    // The first connection is told it has been replaced.
    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first_read.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("Expected close frame, got: {:?}", other),
            }
        }
    })
    .await
    .expect("Expected close within timeout");
    let frame = msg.expect("Close should carry a frame");
    assert_eq!(
        frame.code,
        tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(4000),
        "Expected close code 4000 (superseded)"
    );

    // The second connection remains functional.
    send_frame(&mut second_write, json!({ "type": "PING" })).await;
    expect_frame(&mut second_read, "PONG").await;
}

#[tokio::test]
async fn test_offline_messages_replayed_in_order() {
    let (base_url, addr) = start_test_server().await;
    let (alice_token, _alice_id) = register_user(&base_url, "alice").await;
    let (bob_token, bob_id) = register_user(&base_url, "bob").await;

    let (mut alice_write, mut alice_read) = connect_ws(&addr, &alice_token).await;

    // Bob connects once so a disconnect timestamp exists, then drops off.
    {
        let (mut bob_write, _bob_read) = connect_ws(&addr, &bob_token).await;
        bob_write.send(Message::Close(None)).await.unwrap();
    }
    expect_frame(&mut alice_read, "USER_OFFLINE").await;
    // The disconnect timestamp must precede the messages below.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for content in ["first", "second", "third"] {
        send_frame(
            &mut alice_write,
            json!({ "type": "PRIVATE_MESSAGE", "receiverId": bob_id, "content": content }),
        )
        .await;
        expect_frame(&mut alice_read, "PRIVATE_MESSAGE_ACK").await;
    }

    // On reconnect, Bob receives the missed messages oldest first.
    let (_bob_write, mut bob_read) = connect_ws(&addr, &bob_token).await;
    for expected in ["first", "second", "third"] {
        let replayed = expect_frame(&mut bob_read, "PRIVATE_MESSAGE").await;
        assert_eq!(replayed["content"], expected);
    }
}
