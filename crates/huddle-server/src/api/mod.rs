mod sessions;

use crate::state::AppState;
use crate::ws;
use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Session introspection
        .route("/api/producers", get(sessions::list_producers))
        .route("/api/rtp-capabilities", get(sessions::get_rtp_capabilities))
        .route("/api/parties/{id}/state", get(sessions::get_party_state))
        // WebSocket endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::testing::{app_state, client_dtls, drain};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(app_state((43000, 43009)));
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rtp_capabilities_lists_configured_codecs() {
        let router = create_router(app_state((43010, 43019)));
        let (status, body) = get_json(router, "/api/rtp-capabilities").await;

        assert_eq!(status, StatusCode::OK);
        let mime_types: Vec<&str> = body["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["mime_type"].as_str())
            .collect();
        assert!(mime_types.contains(&"audio/opus"));
        assert!(mime_types.contains(&"video/VP8"));
    }

    #[tokio::test]
    async fn test_producers_listing_has_no_side_effects() {
        let state = app_state((43020, 43029));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let party = state.lifecycle.on_connect(tx).await;
        drain(&mut rx);

        let (status, body) = get_json(create_router(state.clone()), "/api/producers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        state.coordinator.create_transport(party).await.unwrap();
        let (_, body) = get_json(create_router(state), "/api/producers").await;
        assert_eq!(body, serde_json::json!([]));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_party_state() {
        let state = app_state((43030, 43039));
        let (tx, _rx) = mpsc::unbounded_channel();
        let party = state.lifecycle.on_connect(tx).await;
        let uri = format!("/api/parties/{}/state", party);

        let (status, body) = get_json(create_router(state.clone()), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "no_transport");

        let transport = state.coordinator.create_transport(party).await.unwrap();
        state
            .coordinator
            .connect_transport(party, Some(&transport.id), client_dtls())
            .await
            .unwrap();

        let (_, body) = get_json(create_router(state.clone()), &uri).await;
        assert_eq!(body["state"], "transport_connected");
        assert_eq!(body["publishing"], false);
        assert_eq!(body["subscribing"], false);

        let (status, body) = get_json(
            create_router(state.clone()),
            &format!("/api/parties/{}/state", uuid::Uuid::new_v4()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().starts_with("Not found"));

        let (status, _) = get_json(create_router(state), "/api/parties/nobody/state").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
