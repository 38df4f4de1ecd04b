//! HTTP gateway: per-request admission in front of the keyed counters.

mod routes;
mod server;
mod service;

pub use routes::{router, ValueResponse};
pub use server::HttpServer;
pub use service::Gateway;
