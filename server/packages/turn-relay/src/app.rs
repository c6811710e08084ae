use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use turn_relay_error::{ProblemDetails, RelayError};

use crate::agent_socket::connect_agent;
use crate::prompt::parse_turn_request;
use crate::relay::{CancelOnDrop, Relay, TurnBody};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    ok: bool,
    agent_connected: bool,
    agent_count: usize,
    turn_active: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub fn build_router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/responses", post(post_responses))
        .route("/v1/responses", post(post_responses))
        .route("/responses/new", post(post_new_turn))
        .route("/v1/responses/new", post(post_new_turn))
        .route("/ws", get(connect_agent))
        .with_state(relay)
}

async fn get_health(State(relay): State<Arc<Relay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        agent_connected: relay.hub().current().is_some(),
        agent_count: relay.hub().client_count(),
        turn_active: relay.active_session_id().is_some(),
    })
}

async fn post_responses(
    State(relay): State<Arc<Relay>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_turn(relay, &body, false).await
}

async fn post_new_turn(
    State(relay): State<Arc<Relay>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_turn(relay, &body, true).await
}

async fn start_turn(relay: Arc<Relay>, body: &[u8], new_chat: bool) -> Result<Response, ApiError> {
    relay.check_available()?;
    let mut request = parse_turn_request(body)?;
    request.new_chat = new_chat;

    let started = relay.start_turn(request)?;
    let mut guard = CancelOnDrop::new(relay.clone(), started.session_id.clone());

    match started.body {
        TurnBody::Stream(rx) => {
            let stream = TurnEventStream {
                inner: UnboundedReceiverStream::new(rx),
                _guard: guard,
            };
            Ok((
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(stream),
            )
                .into_response())
        }
        TurnBody::Buffered(rx) => {
            let result = rx.await;
            guard.disarm();
            let response = result.map_err(|_| RelayError::StreamError {
                message: format!("turn {} ended without a response", started.session_id),
            })?;
            Ok((StatusCode::OK, Json(response)).into_response())
        }
    }
}

/// SSE body for one turn. Dropping it before the turn ends cancels the turn.
struct TurnEventStream {
    inner: UnboundedReceiverStream<Bytes>,
    _guard: CancelOnDrop,
}

impl Stream for TurnEventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|frame| frame.map(Ok))
    }
}
