use salvo::cors::*;
use salvo::prelude::*;

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .hoop(affix_state::inject(state))
        .hoop(
            Cors::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(AllowMethods::any())
                .allow_headers(AllowHeaders::any())
                .into_handler(),
        )
        .push(Router::with_path("health").get(handlers::health::health))
        // Visual question answering
        .push(Router::with_path("query").post(handlers::vlm::query))
        .push(Router::with_path("query/stream").post(handlers::vlm::query_stream))
        // Captioning
        .push(Router::with_path("caption").post(handlers::vlm::caption))
        .push(Router::with_path("caption/stream").post(handlers::vlm::caption_stream))
}
