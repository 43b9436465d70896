use salvo::prelude::*;

use super::helpers::get_state;

/// GET /health - Health check
#[handler]
pub async fn health(depot: &mut Depot, res: &mut Response) -> Result<(), StatusError> {
    let state = get_state(depot)?;
    let status = if state.service.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    res.render(Json(serde_json::json!({
        "status": status,
        "service": "moondream-server",
        "model": state.service.model_name(),
    })));
    Ok(())
}
