//! Ollama client tests against a mock HTTP server
//!
//! Covers NDJSON streaming, non-success statuses, malformed lines, bodies
//! cut short by the server, model listing, and non-streaming generation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chorus_core::{
    Aggregator, AggregatorConfig, BackendConfig, BackendError, Fragment, GenerationRequest,
    LlmBackend, LlmRequest, OllamaBackend, SessionEvent,
};

fn backend_for(server: &MockServer) -> OllamaBackend {
    OllamaBackend::from_config(BackendConfig::new(server.uri(), 0)).unwrap()
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}

#[tokio::test]
async fn test_stream_completion_decodes_each_line() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "a", "prompt": "hi", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            ndjson(&[
                json!({"model": "a", "response": "He", "done": false}),
                json!({"model": "a", "response": "llo", "done": false}),
                json!({"model": "a", "response": "", "done": true, "eval_count": 2}),
            ]),
            "application/x-ndjson",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let fragments: Vec<Fragment> = backend_for(&server)
        .stream_completion(&LlmRequest::new("hi", "a"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0].text(), Some("He"));
    assert_eq!(fragments[1].text(), Some("llo"));
    assert!(fragments[2].is_done());
    assert_eq!(fragments[2].raw()["eval_count"], json!(2));
}

#[tokio::test]
async fn test_stream_completion_error_status_fails_to_start() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let result = backend_for(&server)
        .stream_completion(&LlmRequest::new("hi", "c"))
        .await;

    match result {
        Err(BackendError::Unavailable(message)) => {
            assert_eq!(message, "upstream returned 500 Internal Server Error: boom");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("stream should not start on a 500"),
    }
}

#[tokio::test]
async fn test_stream_completion_malformed_line_becomes_error_fragment() {
    let server = MockServer::start().await;
    let body = "{\"response\":\"A\",\"done\":false}\nnot json at all\n{\"response\":\"B\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n";
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let fragments: Vec<Fragment> = backend_for(&server)
        .stream_completion(&LlmRequest::new("hi", "a"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(fragments.len(), 4);
    assert!(matches!(&fragments[1], Fragment::Error(payload) if payload.get("error").is_some()));
    assert_eq!(fragments[2].text(), Some("B"));
    assert!(fragments[3].is_done());
}

#[tokio::test]
async fn test_stream_completion_upstream_error_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            ndjson(&[json!({"error": "model ran out of memory"})]),
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;

    let fragments: Vec<Fragment> = backend_for(&server)
        .stream_completion(&LlmRequest::new("hi", "a"))
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(
        fragments,
        vec![Fragment::Error(json!({"error": "model ran out of memory"}))]
    );
}

/// Serve `connections` requests with a body that promises 1000 bytes,
/// sends one NDJSON line, then hangs up.
async fn truncated_body_server(connections: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..connections {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let line = "{\"response\":\"He\",\"done\":false}\n";
            let head = "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ncontent-length: 1000\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(line.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            drop(socket);
        }
    });

    format!("http://{addr}")
}

/// Consume the request head and its body so closing the socket is a clean FIN
async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&request);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let body_len = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if request.len() >= head_end + 4 + body_len {
                return;
            }
        }
    }
}

#[tokio::test]
async fn test_body_cut_short_ends_with_one_error_fragment() {
    let base = truncated_body_server(1).await;
    let backend = OllamaBackend::from_config(BackendConfig::new(base, 0)).unwrap();

    let fragments: Vec<Fragment> = tokio::time::timeout(
        Duration::from_secs(5),
        backend
            .stream_completion(&LlmRequest::new("hi", "a"))
            .await
            .unwrap()
            .collect(),
    )
    .await
    .unwrap();

    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].text(), Some("He"));
    match &fragments[1] {
        Fragment::Error(payload) => {
            let message = payload["error"].as_str().unwrap();
            assert!(
                message.starts_with("upstream unavailable: stream interrupted"),
                "{message}"
            );
        }
        other => panic!("expected an error fragment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_reports_cut_short_model_then_completes_it() {
    let base = truncated_body_server(1).await;
    let backend = OllamaBackend::from_config(BackendConfig::new(base, 0)).unwrap();
    let aggregator = Aggregator::new(
        Arc::new(backend),
        AggregatorConfig {
            idle_poll_interval: Duration::from_millis(5),
            ..AggregatorConfig::default()
        },
    );

    let events: Vec<SessionEvent> = tokio::time::timeout(
        Duration::from_secs(5),
        aggregator
            .stream(&GenerationRequest::new("hi", vec!["a".into()]))
            .unwrap()
            .collect(),
    )
    .await
    .unwrap();

    let tags: Vec<&str> = events.iter().map(SessionEvent::tag).collect();
    assert_eq!(
        tags,
        vec!["start", "model-update", "model-message", "model-complete", "end"]
    );
    assert!(matches!(
        &events[2],
        SessionEvent::ModelMessage { model, message }
            if model == "a" && message["error"].as_str().unwrap().contains("stream interrupted")
    ));
}

#[tokio::test]
async fn test_unreachable_server_is_unavailable() {
    let backend =
        OllamaBackend::from_config(BackendConfig::new("http://127.0.0.1:9", 0)).unwrap();

    let result = backend.stream_completion(&LlmRequest::new("hi", "a")).await;
    assert!(matches!(result, Err(BackendError::Unavailable(_))));
    assert!(!backend.health_check().await);
}

#[tokio::test]
async fn test_list_models_keeps_upstream_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {
                    "name": "llama3.2:latest",
                    "size": 2019393189u64,
                    "digest": "a80c4f17acd5",
                    "details": {"parameter_size": "3.2B", "family": "llama"}
                },
                {"name": "mistral:7b"}
            ]
        })))
        .mount(&server)
        .await;

    let models = backend_for(&server).list_models().await.unwrap();

    assert_eq!(models.len(), 2);
    assert_eq!(models[0].name, "llama3.2:latest");
    assert_eq!(models[0].size(), Some(2_019_393_189));
    assert_eq!(models[0].parameter_size(), Some("3.2B"));
    assert_eq!(
        serde_json::to_value(&models[0]).unwrap(),
        json!({
            "name": "llama3.2:latest",
            "size": 2019393189u64,
            "digest": "a80c4f17acd5",
            "details": {"parameter_size": "3.2B", "family": "llama"}
        })
    );
    assert_eq!(serde_json::to_value(&models[1]).unwrap(), json!({"name": "mistral:7b"}));
}

#[tokio::test]
async fn test_list_models_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    assert!(matches!(
        backend.list_models().await,
        Err(BackendError::Unavailable(_))
    ));
    assert!(!backend.health_check().await);
}

#[tokio::test]
async fn test_generate_returns_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "a", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "a",
            "response": "Hello there",
            "done": true,
            "eval_count": 42
        })))
        .mount(&server)
        .await;

    let completion = backend_for(&server)
        .generate(&LlmRequest::new("hi", "a").with_stream(false))
        .await
        .unwrap();

    assert_eq!(completion.model, "a");
    assert_eq!(completion.content, "Hello there");
    assert_eq!(completion.eval_count, Some(42));
}

#[tokio::test]
async fn test_generate_upstream_error_is_model_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"error": "model 'x' not found"})),
        )
        .mount(&server)
        .await;

    let err = backend_for(&server)
        .generate(&LlmRequest::new("hi", "x"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "model error: model 'x' not found");
}

#[tokio::test]
async fn test_session_over_http_isolates_failing_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "a"})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            ndjson(&[
                json!({"response": "He", "done": false}),
                json!({"response": "llo", "done": false}),
                json!({"response": "", "done": true}),
            ]),
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "c"})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let aggregator = Aggregator::new(
        Arc::new(backend_for(&server)),
        AggregatorConfig {
            idle_poll_interval: Duration::from_millis(5),
            ..AggregatorConfig::default()
        },
    );
    let events: Vec<SessionEvent> = aggregator
        .stream(&GenerationRequest::new("hi", vec!["a".into(), "c".into()]))
        .unwrap()
        .collect()
        .await;

    assert!(events.contains(&SessionEvent::ModelUpdate {
        model: "a".into(),
        chunk: "llo".into(),
        full_text: "Hello".into(),
    }));
    assert!(events.contains(&SessionEvent::ModelMessage {
        model: "c".into(),
        message: json!({"error": "upstream unavailable: upstream returned 500 Internal Server Error"}),
    }));
    let completes = events.iter().filter(|e| e.tag() == "model-complete").count();
    assert_eq!(completes, 2);
    assert_eq!(events.last().map(SessionEvent::tag), Some("end"));
}
