//! HTTP trigger API for Trellis: workflow and execution management,
//! approval decisions, and the public signature-authenticated webhook
//! trigger surface.

mod auth;
mod middleware;
mod routes;
mod server;
mod signature;
mod state;
mod webhook;

pub use server::GatewayServer;
pub use signature::{canonical_body, sign, verify};
