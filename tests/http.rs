use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bart_summarizer::app::{router, AppState};
use bart_summarizer::form::example::EXAMPLE_TEXT;
use bart_summarizer::inference::{InferenceService, SummaryEngine, SummaryRecord};
use bart_summarizer::summary::LengthBounds;
use tower::ServiceExt;

/// Echoes a fixed summary, or fails while `fail` is set.
struct MockEngine {
    summary: String,
    fail: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, LengthBounds)>>,
}

impl MockEngine {
    fn new(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            summary: summary.to_string(),
            fail: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing(summary: &str, msg: &str) -> Arc<Self> {
        let engine = Self::new(summary);
        *engine.fail.lock().unwrap() = Some(msg.to_string());
        engine
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl SummaryEngine for MockEngine {
    fn summarize(&self, text: &str, bounds: &LengthBounds) -> anyhow::Result<Vec<SummaryRecord>> {
        self.calls.lock().unwrap().push((text.to_string(), *bounds));
        if let Some(msg) = self.fail.lock().unwrap().take() {
            return Err(anyhow::anyhow!("{}", msg));
        }
        Ok(vec![SummaryRecord {
            summary_text: self.summary.clone(),
            input_tokens: 12,
            truncated: false,
        }])
    }
}

fn app(engine: Arc<MockEngine>) -> Router {
    let infer = InferenceService::with_engine("facebook/bart-large-cnn", engine);
    router(AppState {
        infer: Arc::new(infer),
    })
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(app: Router, req: Request<Body>) -> (StatusCode, String) {
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn index_renders_empty_form() {
    let engine = MockEngine::new("unused");
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, html) = body_text(app(engine.clone()), req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Text Summarizer"));
    assert!(html.contains("Use Example Text"));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn empty_submission_warns_without_calling_model() {
    let engine = MockEngine::new("unused");
    let (status, html) = body_text(
        app(engine.clone()),
        form_post("/summarize", "input_text=&max_length=150&min_length=40&action=summarize"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Please enter some text to summarize"));
    assert!(!html.contains(r#"id="summary""#));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn whitespace_submission_warns_without_calling_model() {
    let engine = MockEngine::new("unused");
    let (_, html) = body_text(
        app(engine.clone()),
        form_post("/summarize", "input_text=+%0A%09+&max_length=150&min_length=40"),
    )
    .await;

    assert!(html.contains("Please enter some text to summarize"));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn submission_renders_summary_and_statistics() {
    let engine = MockEngine::new("Rain all day.");
    let (status, html) = body_text(
        app(engine.clone()),
        form_post(
            "/summarize",
            "input_text=Rain+fell+all+day.&max_length=30&min_length=10",
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains(r#"id="summary""#));
    assert!(html.contains("Rain all day."));
    assert!(html.contains("Original text length: 18 characters"));
    assert!(html.contains("Summary length: 13 characters"));
    assert!(html.contains("Compression: 28%"));
    // The submitted text stays in the input field.
    assert!(html.contains(">\nRain fell all day.</textarea>"));

    let calls = engine.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "Rain fell all day.");
    assert_eq!(calls[0].1, LengthBounds { max_length: 30, min_length: 10 });
}

#[tokio::test]
async fn leading_newline_survives_rerender() {
    let engine = MockEngine::new("short");
    let (_, html) = body_text(
        app(engine.clone()),
        form_post("/summarize", "input_text=%0AIndented+start&max_length=150&min_length=40"),
    )
    .await;

    // Browsers drop the first newline after <textarea>, so the page
    // must carry one extra.
    assert!(html.contains(">\n\nIndented start</textarea>"));
    assert_eq!(engine.calls.lock().unwrap()[0].0, "\nIndented start");
}

#[tokio::test]
async fn out_of_range_sliders_are_clamped() {
    let engine = MockEngine::new("short");
    let (_, html) = body_text(
        app(engine.clone()),
        form_post("/summarize", "input_text=Some+text&max_length=9999&min_length=1"),
    )
    .await;

    assert!(html.contains(r#"value="500""#));
    let calls = engine.calls.lock().unwrap();
    assert_eq!(calls[0].1, LengthBounds { max_length: 500, min_length: 10 });
}

#[tokio::test]
async fn adapter_failure_renders_error_and_session_recovers() {
    let engine = MockEngine::failing("Recovered summary.", "model unavailable");
    let app = app(engine.clone());

    let (status, html) = body_text(
        app.clone(),
        form_post("/summarize", "input_text=Some+text&max_length=150&min_length=40"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains(r#"id="error""#));
    assert!(html.contains("An error occurred: model unavailable"));
    assert!(!html.contains(r#"id="summary""#));

    let (status, html) = body_text(
        app,
        form_post("/summarize", "input_text=Some+text&max_length=150&min_length=40"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Recovered summary."));
    assert!(!html.contains(r#"id="error""#));
    assert_eq!(engine.call_count(), 2);
}

#[tokio::test]
async fn statistics_are_recomputed_per_submission() {
    let engine = MockEngine::new("abcd");
    let app = app(engine);

    let (_, first) = body_text(
        app.clone(),
        form_post("/summarize", "input_text=abcdefgh&max_length=150&min_length=40"),
    )
    .await;
    assert!(first.contains("Compression: 50%"));

    let (_, second) = body_text(
        app,
        form_post("/summarize", "input_text=abcdefghijklmnop&max_length=150&min_length=40"),
    )
    .await;
    assert!(second.contains("Compression: 75%"));
    assert!(!second.contains("Compression: 50%"));
}

#[tokio::test]
async fn example_button_is_idempotent_and_keeps_sliders() {
    let engine = MockEngine::new("unused");
    let app = app(engine.clone());

    let (status, first) = body_text(
        app.clone(),
        form_post("/example", "input_text=my+own+draft&max_length=200&min_length=20&action=example"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!first.contains("my own draft"));
    assert!(first.contains("search engines for the better part of a year"));
    assert!(first.contains(r#"value="200""#));
    assert!(first.contains(r#"value="20""#));

    let (_, second) = body_text(
        app,
        form_post("/example", "input_text=&max_length=200&min_length=20&action=example"),
    )
    .await;
    assert_eq!(first, second);
    assert_eq!(engine.call_count(), 0);
    assert!(!EXAMPLE_TEXT.trim().is_empty());
}

#[tokio::test]
async fn json_api_reports_result_fields() {
    let engine = MockEngine::new("Rain all day.");
    let res = app(engine)
        .oneshot(json_post(
            "/api/summarize",
            serde_json::json!({"input_text": "Rain fell all day.", "max_length": 30, "min_length": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["summary_text"], "Rain all day.");
    assert_eq!(body["original_length"], 18);
    assert_eq!(body["summary_length"], 13);
    assert_eq!(body["compression_percent"], 28);
    assert_eq!(body["input_tokens"], 12);
    assert!(body["generated_at"].is_string());
}

#[tokio::test]
async fn json_api_maps_errors_to_status_codes() {
    let engine = MockEngine::failing("unused", "out of memory");
    let app = app(engine.clone());

    let res = app
        .clone()
        .oneshot(json_post("/api/summarize", serde_json::json!({"input_text": ""})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "empty_input");

    let res = app
        .oneshot(json_post("/api/summarize", serde_json::json!({"input_text": "text"})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "adapter_failure");
    assert_eq!(body["message"], "An error occurred: out of memory");
}

#[tokio::test]
async fn health_reports_loaded_model() {
    let engine = MockEngine::new("unused");
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = body_text(app(engine), req).await;

    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["model"], "facebook/bart-large-cnn");
    assert_eq!(body["model_loaded"], true);
}
