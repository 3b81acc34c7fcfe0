//! assessor-gateway - HTTP surface for the assessor
//!
//! Serves `POST /chat` (bearer-protected, one dispatch per request) and
//! `GET /health`.

pub mod auth;
pub mod protocol;
pub mod server;

pub use server::{GatewayServer, GatewayState};
