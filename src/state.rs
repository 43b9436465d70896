use std::sync::Arc;

use crate::inference::VisionService;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Loaded model behind the blocking/streaming bridge
    pub service: Arc<VisionService>,
    /// Maximum accepted JSON body size in bytes
    pub max_body_size: usize,
}

impl AppState {
    pub fn new(service: Arc<VisionService>, max_body_size: usize) -> Self {
        Self {
            service,
            max_body_size,
        }
    }
}
