//! HTTP surface of the playground.

use crate::telemetry;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use courier_delivery::{
    wire::{Ack, Event},
    ConfigUpdate, Engine, Error as DeliveryError, Method, SimulationConfig, Snapshot,
};
use courier_transport::Transport;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Self::Delivery(err) = &self;
        let status = match err {
            DeliveryError::UnknownMethod(_)
            | DeliveryError::InvalidMessageId(_)
            | DeliveryError::MissingTarget
            | DeliveryError::Malformed(_) => StatusCode::BAD_REQUEST,
            DeliveryError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            DeliveryError::Encode(_) | DeliveryError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state of every handler.
pub struct AppState<T: Transport> {
    pub engine: Engine<T>,
    pub registry: Arc<Registry>,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
        }
    }
}

/// Build the playground router.
pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/messages", post(submit::<T>))
        .route("/acks", post(ack::<T>))
        .route("/config", get(get_config::<T>).post(update_config::<T>))
        .route("/nodes/{id}", put(join::<T>).delete(leave::<T>))
        .route("/snapshot", get(snapshot::<T>))
        .route("/metrics", get(metrics::<T>))
        .with_state(state)
}

/// Body of `POST /messages`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub method: String,
    pub content: String,
}

/// Body returned by `PUT` and `DELETE /nodes/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Membership {
    pub node: String,
    pub subscribed: bool,
    pub changed: bool,
}

async fn submit<T: Transport>(
    State(state): State<AppState<T>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Event>, ApiError> {
    let method: Method = request.method.parse()?;
    let handle = state
        .engine
        .submit(request.from, request.to, method, request.content)?;
    Ok(Json(handle.sent_ack()))
}

async fn ack<T: Transport>(
    State(state): State<AppState<T>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ack = Ack::decode(&body)?;
    let recorded = state.engine.record_ack(ack.msg_id, &ack.node);
    debug!(msg_id = %ack.msg_id, node = %ack.node, recorded, "ack reported over http");
    Ok(Json(json!({ "recorded": recorded })))
}

async fn get_config<T: Transport>(State(state): State<AppState<T>>) -> Json<SimulationConfig> {
    Json(state.engine.config().get())
}

async fn update_config<T: Transport>(
    State(state): State<AppState<T>>,
    Json(update): Json<ConfigUpdate>,
) -> Json<SimulationConfig> {
    Json(state.engine.update_config(&update))
}

async fn join<T: Transport>(
    State(state): State<AppState<T>>,
    Path(node): Path<String>,
) -> Json<Membership> {
    let changed = state.engine.join(node.as_str());
    Json(Membership {
        node,
        subscribed: true,
        changed,
    })
}

async fn leave<T: Transport>(
    State(state): State<AppState<T>>,
    Path(node): Path<String>,
) -> Json<Membership> {
    let changed = state.engine.leave(&node);
    let subscribed = state.engine.subscribers().contains(&node);
    Json(Membership {
        node,
        subscribed,
        changed,
    })
}

async fn snapshot<T: Transport>(State(state): State<AppState<T>>) -> Json<Snapshot> {
    Json(state.engine.snapshot())
}

async fn metrics<T: Transport>(State(state): State<AppState<T>>) -> Response {
    telemetry::render(&state.registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_delivery::{Config, MessageId};
    use courier_transport::memory::Bus;

    fn state() -> AppState<Bus> {
        let mut registry = Registry::default();
        let engine = Engine::new(Bus::new(), &mut registry, Config::default());
        AppState {
            engine,
            registry: Arc::new(registry),
        }
    }

    fn request(method: &str, to: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            from: "alice".into(),
            to: to.map(str::to_string),
            method: method.into(),
            content: "hello".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_returns_sent_ack() {
        let state = state();
        let Json(event) = submit(State(state.clone()), Json(request("Direct", Some("bob"))))
            .await
            .unwrap();
        assert!(matches!(
            event,
            Event::SentAck {
                method: Method::Direct,
                ..
            }
        ));
        assert_eq!(state.engine.snapshot().get(Method::Direct).sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_bad_requests() {
        let state = state();
        let err = submit(State(state.clone()), Json(request("Carrier", None)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = submit(State(state.clone()), Json(request("Direct", None)))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.engine.snapshot().get(Method::Direct).sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_over_http() {
        let state = state();
        let msg_id = MessageId::random();
        let body = Ack::new(msg_id, "bob").encode().unwrap();
        let Json(response) = ack(State(state.clone()), body.clone()).await.unwrap();
        assert_eq!(response["recorded"], true);
        let Json(response) = ack(State(state.clone()), body).await.unwrap();
        assert_eq!(response["recorded"], false);

        let err = ack(State(state), Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_update_clamped() {
        let state = state();
        let update = ConfigUpdate {
            latency_min: Some(500),
            latency_max: Some(100),
            ..ConfigUpdate::default()
        };
        let Json(config) = update_config(State(state.clone()), Json(update)).await;
        assert_eq!(config.latency_max_ms(), 500);
        let Json(current) = get_config(State(state)).await;
        assert_eq!(current, config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership() {
        let state = state();
        let Json(joined) = join(State(state.clone()), Path("bob".into())).await;
        assert_eq!(
            joined,
            Membership {
                node: "bob".into(),
                subscribed: true,
                changed: true,
            }
        );
        let Json(left) = leave(State(state.clone()), Path("bob".into())).await;
        assert!(!left.subscribed);
        assert!(left.changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_exposed() {
        let state = state();
        state.engine.submit("alice", None, Method::PubSub, "hi").unwrap();
        let response = metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
