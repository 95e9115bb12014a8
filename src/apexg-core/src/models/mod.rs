pub mod endpoints;
pub mod services;

pub use endpoints::*;
pub use services::*;
