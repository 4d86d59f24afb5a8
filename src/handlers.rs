/// Axum handlers for the router's HTTP surface
use crate::AppState;
use crate::client::HttpClient;
use crate::dispatcher::ChunkStream;
use crate::models::{CompletionRequest, GenerateRequest, NodeInfo};
use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{StreamExt, future};
use serde_json::{Value, json};
use std::convert::Infallible;
use tracing::{debug, info, instrument};

const GENERATE_ENDPOINT: &str = "generate";

const COMPLETIONS_ENDPOINT: &str = "v1/completions";

fn bad_request(rejection: JsonRejection) -> Response {
    debug!("Rejected request body: {}", rejection.body_text());
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": rejection.body_text()})),
    )
        .into_response()
}

/// Whether a `/generate` chunk reports that the backend stopped generating.
fn is_final_generation(chunk: &Bytes) -> bool {
    serde_json::from_slice::<Value>(chunk)
        .ok()
        .and_then(|body| {
            body.pointer("/meta_info/finish_reason/type")
                .and_then(Value::as_str)
                .map(|finish| matches!(finish, "length" | "stop"))
        })
        .unwrap_or(false)
}

/// Writes every chunk until the first empty one, which marks a failed or exhausted dispatch.
///
/// A chunk for which `is_final` holds is written and then ends the response. Dropping the rest
/// of the stream stops the dispatch before its next backend call.
fn stream_response(
    chunks: ChunkStream,
    content_type: &'static str,
    is_final: fn(&Bytes) -> bool,
) -> Response {
    let mut finished = false;
    let body = chunks
        .take_while(|chunk| future::ready(!chunk.is_empty()))
        .take_while(move |chunk| {
            let write = !finished;
            finished = finished || is_final(chunk);
            future::ready(write)
        })
        .map(Ok::<_, Infallible>);
    ([(header::CONTENT_TYPE, content_type)], Body::from_stream(body)).into_response()
}

#[instrument(skip(state, payload))]
pub async fn register_nodes<T>(
    State(state): State<AppState<T>>,
    payload: Result<Json<NodeInfo>, JsonRejection>,
) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let Json(node) = match payload {
        Ok(node) => node,
        Err(rejection) => return bad_request(rejection),
    };

    state.controller.register_node(node).await;
    Json(json!({"message": "Register node to the controller successfully!"})).into_response()
}

#[instrument(skip(state, payload))]
pub async fn generate<T>(
    State(state): State<AppState<T>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection),
    };
    if state.log_requests {
        info!(?request, "[generate]");
    }

    let chunks = state
        .controller
        .dispatch(vec![request.into()], GENERATE_ENDPOINT);
    stream_response(chunks, "application/json", is_final_generation)
}

#[instrument(skip(state, payload))]
pub async fn v1_completions<T>(
    State(state): State<AppState<T>>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection),
    };
    if state.log_requests {
        info!(?request, "[v1/completions]");
    }

    let content_type = if request.stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    let chunks = state
        .controller
        .dispatch(vec![request.into()], COMPLETIONS_ENDPOINT);
    stream_response(chunks, content_type, |_| false)
}

/// Reports the model served by the first registered node.
#[instrument(skip(state))]
pub async fn get_model_info<T>(State(state): State<AppState<T>>) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    match state.controller.registry().first_node() {
        Some(node) => Json(json!({
            "model_path": node.model_path,
            "is_generation": node.is_generation,
        }))
        .into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "Controller is not initialized or no nodes available."})),
        )
            .into_response(),
    }
}
