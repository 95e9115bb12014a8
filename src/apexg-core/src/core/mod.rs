pub mod backend;
pub mod breaker;
pub mod cache;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod router;
pub mod registry;

pub use backend::*;
pub use breaker::*;
pub use cache::*;
pub use health::*;
pub use limiter::*;
pub use metrics::*;
pub use router::*;
pub use registry::*;
