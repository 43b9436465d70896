pub mod health;
pub mod vlm;

mod helpers;
