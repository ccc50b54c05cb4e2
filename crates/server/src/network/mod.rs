//! Network subsystem
//!
//! HTTP front end of the server:
//! - Minimal HTTP/1.1 request parser with head and body limits
//! - Router for the page, device list and bind/unbind endpoints
//! - Push-stream connections fed by the subscriber hub
//! - Accept loop with per-connection tasks and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! HttpServer
//!   ├─> accept connections (bounded wait, checks shutdown)
//!   └─> spawn task per connection
//!         ├─> read_request
//!         ├─> Router::respond        (page, devices, bind/unbind)
//!         └─> EventStream::run       (/events)
//!               └─> SubscriberHub    (frames queued by broadcast)
//! ```

pub mod http;
pub mod hub;
pub mod router;
pub mod server;
pub mod stream;

// Re-export public types
pub use hub::{DEFAULT_MAX_SUBSCRIBERS, HubError, SubscriberHub, Subscription};
pub use router::{Route, Router};
pub use server::{HttpServer, ServerOptions};
pub use stream::{EventStream, StreamEnd, StreamOptions, StreamState};
