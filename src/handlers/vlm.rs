use salvo::http::header::{self, HeaderValue};
use salvo::prelude::*;

use crate::error::ServerError;
use crate::inference::{ChunkStream, NDJSON_CONTENT_TYPE};
use crate::state::AppState;
use crate::types::{CaptionRequest, CaptionResponse, QueryRequest, QueryResponse, CAPTION_PROMPT};
use crate::utils::new_request_id;

use super::helpers::{embed_image_url, get_state, parse_body};

/// POST /query - Answer a question about an image
#[handler]
pub async fn query(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<(), StatusError> {
    let state = get_state(depot)?;
    let request_id = new_request_id();
    tracing::info!("[{}] POST /query", request_id);

    match run_query(&state, req).await {
        Ok(text) => res.render(Json(QueryResponse { answer: text })),
        Err(e) => fail(&request_id, &e, res),
    }
    Ok(())
}

/// POST /caption - Describe an image
#[handler]
pub async fn caption(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<(), StatusError> {
    let state = get_state(depot)?;
    let request_id = new_request_id();
    tracing::info!("[{}] POST /caption", request_id);

    match run_caption(&state, req).await {
        Ok(text) => res.render(Json(CaptionResponse { caption: text })),
        Err(e) => fail(&request_id, &e, res),
    }
    Ok(())
}

/// POST /query/stream - Answer a question as an ndjson chunk stream
#[handler]
pub async fn query_stream(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<(), StatusError> {
    let state = get_state(depot)?;
    let request_id = new_request_id();
    tracing::info!("[{}] POST /query/stream", request_id);

    match open_query_stream(&state, req, &request_id).await {
        Ok(stream) => respond_ndjson(res, stream),
        Err(e) => fail(&request_id, &e, res),
    }
    Ok(())
}

/// POST /caption/stream - Describe an image as an ndjson chunk stream
#[handler]
pub async fn caption_stream(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> Result<(), StatusError> {
    let state = get_state(depot)?;
    let request_id = new_request_id();
    tracing::info!("[{}] POST /caption/stream", request_id);

    match open_caption_stream(&state, req, &request_id).await {
        Ok(stream) => respond_ndjson(res, stream),
        Err(e) => fail(&request_id, &e, res),
    }
    Ok(())
}

async fn run_query(state: &AppState, req: &mut Request) -> Result<String, ServerError> {
    let request: QueryRequest = parse_body(req, state.max_body_size).await?;
    answer(state, &request.image_url, request.question).await
}

async fn run_caption(state: &AppState, req: &mut Request) -> Result<String, ServerError> {
    let request: CaptionRequest = parse_body(req, state.max_body_size).await?;
    answer(state, &request.image_url, CAPTION_PROMPT.to_string()).await
}

async fn answer(state: &AppState, image_url: &str, prompt: String) -> Result<String, ServerError> {
    let embedding = embed_image_url(&state.service, image_url).await?;
    state.service.answer(embedding, prompt).await
}

async fn open_query_stream(
    state: &AppState,
    req: &mut Request,
    request_id: &str,
) -> Result<ChunkStream, ServerError> {
    let request: QueryRequest = parse_body(req, state.max_body_size).await?;
    start_stream(state, &request.image_url, request.question, request_id).await
}

async fn open_caption_stream(
    state: &AppState,
    req: &mut Request,
    request_id: &str,
) -> Result<ChunkStream, ServerError> {
    let request: CaptionRequest = parse_body(req, state.max_body_size).await?;
    start_stream(state, &request.image_url, CAPTION_PROMPT.to_string(), request_id).await
}

/// Everything that can fail with a proper status happens before the first
/// byte of the stream is written.
async fn start_stream(
    state: &AppState,
    image_url: &str,
    prompt: String,
    request_id: &str,
) -> Result<ChunkStream, ServerError> {
    let embedding = embed_image_url(&state.service, image_url).await?;
    state.service.stream(embedding, prompt, request_id)
}

fn respond_ndjson(res: &mut Response, stream: ChunkStream) {
    res.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    res.stream(stream.into_ndjson());
}

fn fail(request_id: &str, err: &ServerError, res: &mut Response) {
    if err.status_code().is_client_error() {
        tracing::warn!("[{}] Rejected: {}", request_id, err);
    } else {
        tracing::error!("[{}] Failed: {}", request_id, err);
    }
    err.render(res);
}
