pub mod core;
pub mod models;

pub use crate::core::*;
pub use crate::models::*;
