use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{middleware, routes, state::AppState};

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/echo", post(routes::echo::create_echo))
        .route("/idempotency/stats", get(routes::stats::get_stats))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::idempotency::idempotency_middleware,
        ));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
        middleware::from_fn_with_state,
        routing::post,
    };
    use idempotency::{IdempotencyConfig, IdempotencyService, MemoryStore};
    use tower::ServiceExt;

    use crate::{middleware, state::AppState};

    fn test_state() -> AppState {
        AppState::new(Arc::new(IdempotencyService::new(
            IdempotencyConfig::default(),
            Arc::new(MemoryStore::new()),
        )))
    }

    fn echo_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/echo")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn first_call_executes_and_retry_replays_the_stored_response() {
        let app = super::router(test_state());
        let body = r#"{"sku":"X1","qty":2}"#;

        let first = app
            .clone()
            .oneshot(echo_request(Some("ord-abcdef12"), body))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert_eq!(
            first
                .headers()
                .get("Idempotency-Key")
                .and_then(|v| v.to_str().ok()),
            Some("ord-abcdef12")
        );
        assert!(first.headers().get("X-Idempotent-Replay").is_none());
        let first_json = body_json(first).await;
        let first_id = first_json.pointer("/data/id").unwrap().clone();

        // Same key, identical body: replayed verbatim, marked as a replay.
        let second = app
            .clone()
            .oneshot(echo_request(Some("ord-abcdef12"), body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(
            second
                .headers()
                .get("X-Idempotent-Replay")
                .and_then(|v| v.to_str().ok()),
            Some("true")
        );
        let second_json = body_json(second).await;
        assert_eq!(second_json.pointer("/data/id").unwrap(), &first_id);

        // Same key, different body: conflict, no new resource.
        let third = app
            .oneshot(echo_request(Some("ord-abcdef12"), r#"{"sku":"X1","qty":3}"#))
            .await
            .unwrap();
        assert_eq!(third.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn equivalent_bodies_with_reordered_keys_replay() {
        let app = super::router(test_state());

        let first = app
            .clone()
            .oneshot(echo_request(Some("ord-abcdef12"), r#"{"sku":"X1","qty":2}"#))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(echo_request(Some("ord-abcdef12"), r#"{"qty":2,"sku":"X1"}"#))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert!(second.headers().get("X-Idempotent-Replay").is_some());
    }

    #[tokio::test]
    async fn requests_without_a_key_are_unguarded() {
        let app = super::router(test_state());
        let body = r#"{"sku":"X1"}"#;

        let first = body_json(app.clone().oneshot(echo_request(None, body)).await.unwrap()).await;
        let second = body_json(app.oneshot(echo_request(None, body)).await.unwrap()).await;
        assert_ne!(
            first.pointer("/data/id").unwrap(),
            second.pointer("/data/id").unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_before_execution() {
        let state = test_state();
        let app = super::router(state.clone());

        let response = app
            .oneshot(echo_request(Some("short"), r#"{"sku":"X1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response
                .headers()
                .get("Idempotency-Key")
                .and_then(|v| v.to_str().ok()),
            Some("short")
        );

        let stats = state.idempotency.stats().await.unwrap();
        assert_eq!(stats.total_records, 0);
    }

    #[tokio::test]
    async fn non_mutating_methods_bypass_the_guard() {
        let state = test_state();
        let app = super::router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/idempotency/stats")
                    .header("Idempotency-Key", "stats-abcdef12")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // GET passed through: no claim was recorded for the key.
        let stats = state.idempotency.stats().await.unwrap();
        assert_eq!(stats.total_records, 0);
    }

    #[tokio::test]
    async fn cross_tenant_replay_is_rejected() {
        let app = super::router(test_state());
        let body = r#"{"sku":"X1"}"#;

        let mut first = echo_request(Some("ord-abcdef12"), body);
        first
            .headers_mut()
            .insert("X-User-Id", "u1".parse().unwrap());
        assert_eq!(
            app.clone().oneshot(first).await.unwrap().status(),
            StatusCode::CREATED
        );

        let mut second = echo_request(Some("ord-abcdef12"), body);
        second
            .headers_mut()
            .insert("X-User-Id", "u2".parse().unwrap());
        assert_eq!(
            app.oneshot(second).await.unwrap().status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn failed_responses_are_not_cached() {
        let state = test_state();
        let executions = Arc::new(AtomicU32::new(0));
        let counter = executions.clone();

        let app = Router::new()
            .route(
                "/api/flaky",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        let attempt = counter.fetch_add(1, Ordering::SeqCst);
                        if attempt == 0 {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            )
            .layer(from_fn_with_state(
                state.clone(),
                middleware::idempotency::idempotency_middleware,
            ))
            .with_state(state);

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/flaky")
                .header("Idempotency-Key", "flaky-abcdef12")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);

        // The failure left no record, so the retry re-executes.
        let second = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(executions.load(Ordering::SeqCst), 2);

        // And the success is now cached.
        let third = app.oneshot(request()).await.unwrap();
        assert_eq!(third.status(), StatusCode::OK);
        assert!(third.headers().get("X-Idempotent-Replay").is_some());
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_utf8_responses_are_served_intact_and_not_cached() {
        let state = test_state();
        let executions = Arc::new(AtomicU32::new(0));
        let counter = executions.clone();
        const RAW: &[u8] = &[0xff, 0xfe, 0x00, 0x01];

        let app = Router::new()
            .route(
                "/api/raw",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        RAW.to_vec()
                    }
                }),
            )
            .layer(from_fn_with_state(
                state.clone(),
                middleware::idempotency::idempotency_middleware,
            ))
            .with_state(state);

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/raw")
                .header("Idempotency-Key", "raw-abcdef12")
                .body(Body::empty())
                .unwrap()
        };

        // The bytes pass through untouched; no lossy re-encoding.
        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_bytes = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        assert_eq!(first_bytes.as_ref(), RAW);

        // The body cannot be stored losslessly as text, so the retry
        // re-executes instead of replaying a corrupted copy.
        let second = app.oneshot(request()).await.unwrap();
        assert!(second.headers().get("X-Idempotent-Replay").is_none());
        let second_bytes = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert_eq!(second_bytes.as_ref(), RAW);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversized_request_bodies_are_rejected() {
        let state = test_state();
        let app = super::router(state.clone());

        let max = state.idempotency.config().max_body_size;
        let body = format!("{{\"blob\":\"{}\"}}", "a".repeat(max + 1024));
        let response = app
            .oneshot(echo_request(Some("ord-abcdef12"), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Rejected before any claim was taken.
        let stats = state.idempotency.stats().await.unwrap();
        assert_eq!(stats.total_records, 0);
    }

    #[tokio::test]
    async fn health_is_outside_the_guarded_surface() {
        let app = super::router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
