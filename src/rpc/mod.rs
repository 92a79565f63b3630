pub mod client;

pub use client::{SignedClient, WsClient};
