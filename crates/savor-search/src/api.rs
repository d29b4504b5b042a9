//! HTTP surface: the WebSocket search endpoint and the restaurant APIs.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use savor_store::{GeoPoint, Store};

use crate::session::SearchSession;
use crate::types::CreateRestaurantsRequest;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Arc<Store>,
    pub session: Arc<SearchSession>,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/restaurants", post(create_restaurants).get(list_restaurants))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    input: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Both coordinates or no origin at all.
fn location_from(latitude: Option<f64>, longitude: Option<f64>) -> Option<GeoPoint> {
    match (latitude, longitude) {
        (Some(lat), Some(long)) => Some(GeoPoint { lat, long }),
        _ => None,
    }
}

async fn search(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let location = location_from(params.latitude, params.longitude);
    info!(input = %params.input, ?location, "search session starting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.input, location))
}

/// Pump session events onto the socket until the sequence ends or the
/// client goes away. Dropping the receiver cancels the session.
async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    input: String,
    location: Option<GeoPoint>,
) {
    let mut events = state.session.search(input, location);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("client closed search connection");
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "search connection error");
                    return;
                }
            },
            event = events.recv() => match event {
                Some(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(error = %e, "failed to encode session event");
                            return;
                        }
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                // End of stream: the session closed its channel.
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
        }
    }
}

async fn create_restaurants(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRestaurantsRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
            .into_response();
    }

    match state.store.create_restaurants(&request.into_drafts()).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({ "message": "restaurants created successfully" })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to create restaurants");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn list_restaurants(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_restaurants().await {
        Ok(restaurants) => Json(restaurants).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list restaurants");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_requires_both_coordinates() {
        assert!(location_from(Some(25.2), None).is_none());
        assert!(location_from(None, Some(55.3)).is_none());
        assert!(location_from(None, None).is_none());

        let origin = location_from(Some(25.2), Some(55.3)).unwrap();
        assert_eq!(origin.lat, 25.2);
        assert_eq!(origin.long, 55.3);
    }

    #[test]
    fn test_search_params_deserialize() {
        let params: SearchParams =
            serde_json::from_str(r#"{"input":"spicy ramen","latitude":25.2,"longitude":55.3}"#)
                .unwrap();
        assert_eq!(params.input, "spicy ramen");
        assert_eq!(params.latitude, Some(25.2));

        let params: SearchParams = serde_json::from_str(r#"{}"#).unwrap();
        assert!(params.input.is_empty());
        assert!(params.latitude.is_none());
    }
}
