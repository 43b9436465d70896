//! Request/response types

mod error;
mod vlm;

pub use error::*;
pub use vlm::*;
