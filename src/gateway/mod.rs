//! Proxy server: routing, rate limiting and request forwarding

mod proxy;
mod rate_limit;
mod rewrite;
mod router;
mod server;
mod trace;

pub use proxy::{Forwarder, InboundRequest};
pub use rate_limit::{RateLimitState, rate_limit_middleware};
pub use rewrite::PathRewriter;
pub use router::{AppState, create_router};
pub use server::Gateway;
