//! HTTP/WebSocket boundary (C13): one module per resource group, mirroring
//! the teacher's `api/` layout.

pub mod cancel;
pub mod genius;
pub mod health;
pub mod process;
pub mod rate_limit;
pub mod suggestions;
pub mod ws;

pub use cancel::cancel_routes;
pub use genius::genius_routes;
pub use health::health_routes;
pub use process::process_routes;
pub use suggestions::suggestions_routes;
pub use ws::ws_routes;
