use salvo::prelude::*;
use serde::de::DeserializeOwned;

use crate::engines::ImageEmbedding;
use crate::error::ServerError;
use crate::inference::VisionService;
use crate::payload;
use crate::state::AppState;

pub(crate) fn get_state(depot: &mut Depot) -> Result<AppState, StatusError> {
    depot
        .obtain::<AppState>()
        .cloned()
        .map_err(|_| StatusError::internal_server_error())
}

/// Parse a JSON body, classifying every failure as a bad request.
pub(crate) async fn parse_body<T: DeserializeOwned>(
    req: &mut Request,
    max_size: usize,
) -> Result<T, ServerError> {
    req.parse_json_with_max_size(max_size)
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))
}

/// Decode the `image_url` field and run it through the vision encoder.
pub(crate) async fn embed_image_url(
    service: &VisionService,
    image_url: &str,
) -> Result<ImageEmbedding, ServerError> {
    let image = payload::decode_image_url(image_url)?;
    tracing::debug!("Decoded {}x{} image", image.width(), image.height());
    service.encode(image).await
}
