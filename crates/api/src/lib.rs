//! HTTP surface: publish endpoint, auth middleware, client and server bootstrap.

pub mod app;
pub mod client;
pub mod middleware;
pub mod server;
pub mod tasks;

pub use app::{AppState, build_app};
pub use client::{Client, ClientConfig, ClientError};
