mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use futures::stream;
use gateway_client::identity::{PROFILE_KEY, TOKEN_KEY};
use gateway_client::{
    CancellationToken, ChatMessage, ChatRequest, ClientError, DeliveryMode, KeyValueStorage,
};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use support::{Stub, profile, test_client};

enum ChatMode {
    Chunks {
        content_type: &'static str,
        chunks: Vec<Vec<u8>>,
    },
    Whole(Value),
    Reject(StatusCode, &'static str),
    Stall,
}

#[derive(Clone)]
struct ChatState {
    mode: Arc<ChatMode>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

struct ChatStub {
    stub: Stub,
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn spawn_chat_stub(mode: ChatMode) -> Result<ChatStub> {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/api/v1/chat", post(chat))
        .with_state(ChatState {
            mode: Arc::new(mode),
            bodies: bodies.clone(),
        });
    Ok(ChatStub {
        stub: Stub::spawn(app).await?,
        bodies,
    })
}

async fn chat(State(state): State<ChatState>, Json(body): Json<Value>) -> Response {
    state.bodies.lock().await.push(body);
    match state.mode.as_ref() {
        ChatMode::Chunks {
            content_type,
            chunks,
        } => {
            let chunks = chunks
                .iter()
                .cloned()
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)))
                .collect::<Vec<_>>();
            (
                [(CONTENT_TYPE, *content_type)],
                Body::from_stream(stream::iter(chunks)),
            )
                .into_response()
        }
        ChatMode::Whole(value) => Json(value.clone()).into_response(),
        ChatMode::Reject(status, detail) => {
            (*status, Json(json!({ "detail": detail }))).into_response()
        }
        ChatMode::Stall => {
            let first = stream::once(async {
                Ok::<_, std::io::Error>(Bytes::from_static(
                    b"{\"message\":{\"content\":\"partial\"}}\n",
                ))
            });
            (
                [(CONTENT_TYPE, "application/x-ndjson")],
                Body::from_stream(first.chain(stream::pending())),
            )
                .into_response()
        }
    }
}

fn lines(lines: &[&str]) -> Vec<Vec<u8>> {
    vec![lines.concat().into_bytes()]
}

fn request() -> ChatRequest {
    ChatRequest::new("llama3", vec![ChatMessage::user("hi")]).with_temperature(0.2)
}

async fn collect_stream(
    client: &gateway_client::GatewayClient,
) -> Result<(Vec<String>, std::result::Result<String, ClientError>)> {
    let mut deltas = Vec::new();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.stream_chat(&request(), CancellationToken::new(), |text| {
            deltas.push(text.to_string());
        }),
    )
    .await?;
    Ok((deltas, outcome))
}

#[tokio::test]
async fn sse_fragments_accumulate_in_order() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Chunks {
        content_type: "text/event-stream",
        chunks: lines(&[
            "data: {\"message\":{\"content\":\"a\"}}\n\n",
            "data: {\"message\":{\"content\":\"b\"}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"message\":{\"content\":\"after done\"}}\n\n",
        ]),
    })
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert_eq!(deltas, vec!["a".to_string(), "ab".to_string()]);
    assert_eq!(outcome?, "ab");

    let bodies = stub.bodies.lock().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["stream"], json!(true));
    assert_eq!(bodies[0]["model"], json!("llama3"));
    assert_eq!(bodies[0]["messages"][0]["content"], json!("hi"));
    drop(bodies);

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_lines_are_skipped() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Chunks {
        content_type: "application/x-ndjson",
        chunks: lines(&[
            "{\"message\":{\"content\":\"a\"}}\n",
            "this is not json\n",
            "{\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
            "{\"done\":true}\n",
        ]),
    })
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert_eq!(deltas, vec!["a".to_string(), "ab".to_string()]);
    assert_eq!(outcome?, "ab");

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn chunk_boundaries_may_split_lines_and_characters() -> Result<()> {
    let body = "{\"response\":\"h\u{e9}llo \"}\r\n{\"response\":\"w\u{f6}rld\"}";
    let bytes = body.as_bytes();
    let split_inside_e_acute = body.find('\u{e9}').map_or(0, |index| index + 1);
    let chunks = vec![
        bytes[..split_inside_e_acute].to_vec(),
        bytes[split_inside_e_acute..30].to_vec(),
        bytes[30..].to_vec(),
    ];
    let stub = spawn_chat_stub(ChatMode::Chunks {
        content_type: "application/x-ndjson; charset=utf-8",
        chunks,
    })
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert_eq!(
        deltas,
        vec!["h\u{e9}llo ".to_string(), "h\u{e9}llo w\u{f6}rld".to_string()]
    );
    assert_eq!(outcome?, "h\u{e9}llo w\u{f6}rld");

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn fragment_on_the_done_line_is_kept() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Chunks {
        content_type: "application/x-ndjson",
        chunks: lines(&[
            "{\"message\":{\"content\":\"x\"},\"done\":true}\n",
            "{\"message\":{\"content\":\"ignored\"}}\n",
        ]),
    })
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert_eq!(deltas, vec!["x".to_string()]);
    assert_eq!(outcome?, "x");

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn whole_reply_is_revealed_as_growing_prefixes() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Whole(json!({
        "message": { "role": "assistant", "content": "hello" },
        "done": true,
    })))
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let mut chat = harness
        .client
        .open_chat_stream(&request(), CancellationToken::new())
        .await?;
    assert_eq!(chat.mode(), DeliveryMode::Simulated);

    let mut deltas = Vec::new();
    while let Some(text) = chat.next().await {
        deltas.push(text);
    }
    let final_text = chat.finish().await?;

    assert_eq!(deltas, vec!["h", "he", "hel", "hell", "hello"]);
    assert!(deltas.windows(2).all(|pair| pair[1].starts_with(&pair[0])));
    assert_eq!(final_text, "hello");

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_whole_reply_resolves_without_emissions() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Whole(json!({
        "message": { "role": "assistant", "content": "" },
    })))
    .await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert!(deltas.is_empty());
    assert_eq!(outcome?, "");

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejected_chat_surfaces_server_detail() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Reject(StatusCode::FORBIDDEN, "daily quota exceeded")).await?;
    let harness = test_client(&stub.stub.base_url)?;

    let (deltas, outcome) = collect_stream(&harness.client).await?;

    assert!(deltas.is_empty());
    match outcome {
        Err(ClientError::Rejected { status, detail }) => {
            assert_eq!(status, StatusCode::FORBIDDEN);
            assert_eq!(detail, "daily quota exceeded");
        }
        other => anyhow::bail!("expected rejection, got {other:?}"),
    }

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_a_stalled_stream() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Stall).await?;
    let harness = test_client(&stub.stub.base_url)?;
    let cancel = CancellationToken::new();

    let mut chat = harness
        .client
        .open_chat_stream(&request(), cancel.clone())
        .await?;
    assert_eq!(chat.mode(), DeliveryMode::EventStream);
    assert_eq!(chat.next().await.as_deref(), Some("partial"));

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), chat.finish()).await?;
    assert!(matches!(outcome, Err(ClientError::Cancelled)));

    stub.stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn completed_reply_invalidates_cached_identity() -> Result<()> {
    let stub = spawn_chat_stub(ChatMode::Chunks {
        content_type: "application/x-ndjson",
        chunks: lines(&["{\"message\":{\"content\":\"ok\"},\"done\":true}\n"]),
    })
    .await?;
    let harness = test_client(&stub.stub.base_url)?;
    harness
        .client
        .identity_store()
        .set_session("tok_1", &profile("u1"), true)?;

    let (_, outcome) = collect_stream(&harness.client).await?;
    assert_eq!(outcome?, "ok");

    assert_eq!(harness.client.identity_store().cached_profile(), None);
    assert_eq!(harness.durable.get_item(PROFILE_KEY), None);
    assert_eq!(harness.durable.get_item(TOKEN_KEY).as_deref(), Some("tok_1"));

    stub.stub.stop().await;
    Ok(())
}
