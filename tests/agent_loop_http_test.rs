//! End-to-end tests driving `AgentLoop` against a mocked OpenAI-dialect
//! endpoint: real HTTP round-trips, real SSE parsing, real dispatch against
//! an in-memory spreadsheet backend.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use sheet_agent_core::{AgentLoop, ChunkSink, Config, Conversation, MockSpreadsheetBackend, RelayEvent, TurnOutcome, UndoJournal};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn noop_chunk_sink(_: RelayEvent) {}

fn no_sink() -> ChunkSink<'static> {
    &noop_chunk_sink
}

/// Matches a chat-completions request by its `messages` array length — a
/// simple, order-independent way to tell which turn of a conversation a
/// given request belongs to.
struct MessageCount(usize);

impl wiremock::Match for MessageCount {
    fn matches(&self, request: &Request) -> bool {
        serde_json::from_slice::<serde_json::Value>(&request.body)
            .ok()
            .and_then(|body| body.get("messages").and_then(|m| m.as_array().map(|a| a.len())))
            .is_some_and(|len| len == self.0)
    }
}

struct ModelIs(&'static str);

impl wiremock::Match for ModelIs {
    fn matches(&self, request: &Request) -> bool {
        serde_json::from_slice::<serde_json::Value>(&request.body)
            .ok()
            .and_then(|body| body.get("model").and_then(|m| m.as_str().map(str::to_string)))
            .is_some_and(|model| model == self.0)
    }
}

fn sse_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str("data: ");
        body.push_str(chunk);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(body).insert_header("content-type", "text/event-stream")
}

#[tokio::test]
async fn test_happy_write_yolo_mode_over_http() {
    let server = MockServer::start().await;

    let turn1 = sse_body(&[
        r#"{"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","tool_calls":[{"index":0,"id":"call_1","function":{"name":"execute_macro","arguments":"{\"actions\":[{\"action\":\"write_cell\",\"sheet\":\"Sheet1\",\"cell\":\"A1\",\"value\":42}]}"}}]},"finish_reason":null}]}"#,
        r#"{"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
    ]);
    let turn2 = sse_body(&[
        r#"{"id":"2","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Done — A1 is now 42."},"finish_reason":"stop"}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(1))
        .respond_with(sse_response(turn1))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(3))
        .respond_with(sse_response(turn2))
        .mount(&server)
        .await;

    let config = Config::builder()
        .api_key("sk-test")
        .model("gpt-4o")
        .base_url(server.uri())
        .ask_before_apply(false)
        .build()
        .unwrap();

    let backend = Arc::new(MockSpreadsheetBackend::new());
    let journal = Arc::new(UndoJournal::new_in_memory());
    let agent = AgentLoop::new(config, backend.clone(), journal);

    let mut conversation = Conversation::new("conv-1", 0);
    let cancelled = AtomicBool::new(false);

    let outcome = agent.send_message(&mut conversation, "Put 42 in A1 of Sheet1.", &cancelled, no_sink()).await.unwrap();

    match outcome {
        TurnOutcome::Done { text, model_used } => {
            assert!(text.contains("42"));
            assert_eq!(model_used, "gpt-4o");
        }
        other => panic!("expected Done, got {other:?}"),
    }

    let values = backend.get_range_values("Sheet1", &"A1".to_string()).await.unwrap();
    assert_eq!(values["values"]["A1"], serde_json::json!(42));
}

#[tokio::test]
async fn test_approval_suspend_then_confirm_over_http() {
    let server = MockServer::start().await;

    let turn1 = sse_body(&[
        r#"{"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","tool_calls":[{"index":0,"id":"call_1","function":{"name":"execute_macro","arguments":"{\"actions\":[{\"action\":\"create_sheet\",\"name\":\"Plan1\"}]}"}}]},"finish_reason":"tool_calls"}]}"#,
    ]);
    let turn2 = sse_body(&[
        r#"{"id":"2","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Created Plan1."},"finish_reason":"stop"}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(1))
        .respond_with(sse_response(turn1))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(3))
        .respond_with(sse_response(turn2))
        .mount(&server)
        .await;

    let config = Config::builder()
        .api_key("sk-test")
        .model("gpt-4o")
        .base_url(server.uri())
        .ask_before_apply(true)
        .build()
        .unwrap();

    let backend = Arc::new(MockSpreadsheetBackend::new());
    let journal = Arc::new(UndoJournal::new_in_memory());
    let agent = AgentLoop::new(config, backend.clone(), journal);

    let mut conversation = Conversation::new("conv-1", 0);
    let cancelled = AtomicBool::new(false);

    let outcome = agent.send_message(&mut conversation, "Add a sheet called Plan1.", &cancelled, no_sink()).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingApproval(_)));
    assert!(agent.has_pending_action("conv-1"));
    assert!(!backend.list_sheets().await.unwrap().contains(&"Plan1".to_string()));

    let outcome = agent.confirm_pending_action(&mut conversation, &cancelled, no_sink()).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Done { .. }));
    assert!(!agent.has_pending_action("conv-1"));
    assert!(backend.list_sheets().await.unwrap().contains(&"Plan1".to_string()));
}

#[tokio::test]
async fn test_fallback_to_tool_model_on_primary_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(ModelIs("gpt-4o"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(2)
        .mount(&server)
        .await;

    let fallback_turn = sse_body(&[
        r#"{"id":"1","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"role":"assistant","content":"Handled by the fallback model."},"finish_reason":"stop"}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(ModelIs("gpt-4o-mini"))
        .respond_with(sse_response(fallback_turn))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config::builder()
        .api_key("sk-test")
        .model("gpt-4o")
        .tool_model("gpt-4o-mini")
        .base_url(server.uri())
        .ask_before_apply(false)
        .build()
        .unwrap();

    let backend = Arc::new(MockSpreadsheetBackend::new());
    let journal = Arc::new(UndoJournal::new_in_memory());
    let agent = AgentLoop::new(config, backend, journal);

    let mut conversation = Conversation::new("conv-1", 0);
    let cancelled = AtomicBool::new(false);

    let outcome = agent.send_message(&mut conversation, "Anything there?", &cancelled, no_sink()).await.unwrap();

    match outcome {
        TurnOutcome::Done { text, model_used } => {
            assert!(text.contains("fallback"));
            assert_eq!(model_used, "gpt-4o-mini");
        }
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_query_tool_call_round_trip() {
    let server = MockServer::start().await;

    let turn1 = sse_body(&[
        r#"{"id":"1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","tool_calls":[{"index":0,"id":"call_1","function":{"name":"list_sheets","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
    ]);
    let turn2 = sse_body(&[
        r#"{"id":"2","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"There is one sheet: Sheet1."},"finish_reason":"stop"}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(1))
        .respond_with(sse_response(turn1))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(MessageCount(3))
        .respond_with(sse_response(turn2))
        .mount(&server)
        .await;

    let config = Config::builder()
        .api_key("sk-test")
        .model("gpt-4o")
        .base_url(server.uri())
        .ask_before_apply(false)
        .build()
        .unwrap();

    let backend = Arc::new(MockSpreadsheetBackend::new());
    let journal = Arc::new(UndoJournal::new_in_memory());
    let agent = AgentLoop::new(config, backend, journal);

    let mut conversation = Conversation::new("conv-1", 0);
    let cancelled = AtomicBool::new(false);

    let outcome = agent.send_message(&mut conversation, "What sheets are there?", &cancelled, no_sink()).await.unwrap();

    match outcome {
        TurnOutcome::Done { text, .. } => assert!(text.contains("Sheet1")),
        other => panic!("expected Done, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limited_twice_then_fallback() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(ModelIs("gpt-4o"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2").set_body_string("slow down"))
        .expect(2)
        .mount(&server)
        .await;

    let fallback_turn = sse_body(&[
        r#"{"id":"1","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"role":"assistant","content":"Handled by the fallback model."},"finish_reason":"stop"}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(ModelIs("gpt-4o-mini"))
        .respond_with(sse_response(fallback_turn))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config::builder()
        .api_key("sk-test")
        .model("gpt-4o")
        .tool_model("gpt-4o-mini")
        .base_url(server.uri())
        .ask_before_apply(false)
        .build()
        .unwrap();

    let backend = Arc::new(MockSpreadsheetBackend::new());
    let journal = Arc::new(UndoJournal::new_in_memory());
    let agent = AgentLoop::new(config, backend, journal);

    let mut conversation = Conversation::new("conv-1", 0);
    let cancelled = AtomicBool::new(false);

    let notices = std::sync::Mutex::new(Vec::new());
    let sink: ChunkSink<'_> = &|evt| {
        if let RelayEvent::Notice(msg) = evt {
            notices.lock().unwrap().push(msg);
        }
    };

    let started = std::time::Instant::now();
    let outcome = agent.send_message(&mut conversation, "Anything there?", &cancelled, sink).await.unwrap();
    let elapsed = started.elapsed();

    match outcome {
        TurnOutcome::Done { text, model_used } => {
            assert!(text.contains("fallback"));
            assert_eq!(model_used, "gpt-4o-mini");
        }
        other => panic!("expected Done, got {other:?}"),
    }

    assert_eq!(notices.lock().unwrap().len(), 2);
    assert!(elapsed >= std::time::Duration::from_secs(4), "expected at least two 2s retry waits, got {elapsed:?}");
}
