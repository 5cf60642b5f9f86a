use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use keygate_contracts::{ActionToken, Button, ChatId, InboundEvent, MessageRef};
use keygate_server::{event_from_update, ChatGateway, GatewayError, TelegramGateway};
use serde_json::{json, Value};

const BLOCKED_CHAT: i64 = 13;

async fn chat_action(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["chat_id"] == BLOCKED_CHAT {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            })),
        );
    }
    (StatusCode::OK, Json(json!({"ok": true, "result": true})))
}

async fn send_message(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let has_buttons =
        body["reply_markup"]["inline_keyboard"][0][0]["callback_data"] == "request_config";
    let message_id = if has_buttons { 71 } else { 70 };
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "result": {
                "message_id": message_id,
                "chat": {"id": body["chat_id"]},
                "text": body["text"]
            }
        })),
    )
}

async fn send_document() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({"ok": true, "result": {"message_id": 80, "chat": {"id": 1}}})),
    )
}

async fn edit_message() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: message is not modified"
        })),
    )
}

async fn get_updates(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let offset = body["offset"].as_i64().unwrap_or(0);
    let updates = if offset > 500 {
        json!([])
    } else {
        json!([{
            "update_id": 500,
            "callback_query": {
                "id": "cb",
                "from": {"id": 1000, "first_name": "Admin"},
                "message": {"message_id": 3, "chat": {"id": 1000}},
                "data": "reject_42"
            }
        }])
    };
    (StatusCode::OK, Json(json!({"ok": true, "result": updates})))
}

async fn mock_bot_api() -> String {
    let app = Router::new()
        .route("/botTEST/sendChatAction", post(chat_action))
        .route("/botTEST/sendMessage", post(send_message))
        .route("/botTEST/sendDocument", post(send_document))
        .route("/botTEST/editMessageText", post(edit_message))
        .route("/botTEST/getUpdates", post(get_updates));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway(base: &str) -> TelegramGateway {
    TelegramGateway::new(base, "TEST", Duration::from_secs(5), Duration::from_secs(1)).unwrap()
}

#[tokio::test]
async fn probe_maps_forbidden_to_unreachable() {
    let tg = gateway(&mock_bot_api().await);
    tg.probe_channel(ChatId(1)).await.expect("open chat");
    let err = tg.probe_channel(ChatId(BLOCKED_CHAT)).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Unreachable { chat: ChatId(BLOCKED_CHAT), .. }
    ));
}

#[tokio::test]
async fn send_text_returns_message_ref_and_sends_keyboard() {
    let tg = gateway(&mock_bot_api().await);
    let keyboard = vec![vec![Button::new("Request", ActionToken::RequestConfig)]];
    let with_keyboard = tg.send_text(ChatId(5), "hi", Some(&keyboard)).await.unwrap();
    assert_eq!(
        with_keyboard,
        MessageRef {
            chat: ChatId(5),
            message_id: 71
        }
    );
    let plain = tg.send_text(ChatId(5), "hi", None).await.unwrap();
    assert_eq!(plain.message_id, 70);
}

#[tokio::test]
async fn document_upload_and_api_errors() {
    let tg = gateway(&mock_bot_api().await);
    tg.send_document(ChatId(1), "a.conf", b"[Interface]".to_vec(), "Your config: a.conf")
        .await
        .expect("document accepted");

    let err = tg
        .edit_message(
            &MessageRef {
                chat: ChatId(1),
                message_id: 3,
            },
            "same text",
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::Api {
            code: 400,
            description: "Bad Request: message is not modified".to_string()
        }
    );
}

#[tokio::test]
async fn updates_become_inbound_events() {
    let tg = gateway(&mock_bot_api().await);
    let updates = tg.get_updates(0).await.unwrap();
    assert_eq!(updates.len(), 1);
    let next_offset = updates[0].update_id + 1;

    let event = event_from_update(updates.into_iter().next().unwrap(), Some("keygate_bot")).unwrap();
    assert!(matches!(
        event,
        InboundEvent::ButtonPress { ref token, ref callback_id, .. }
            if token == "reject_42" && callback_id == "cb"
    ));
    assert!(tg.get_updates(next_offset).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_api_is_a_transport_error() {
    let tg = gateway("http://127.0.0.1:1");
    let err = tg.probe_channel(ChatId(1)).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Transport(_) | GatewayError::Timeout(_)
    ));
}
