//! Adapter interfaces for external systems.
//!
//! Adapters connect the core to the backend: a live frame link over
//! WebSocket and the HTTP history endpoint.

pub mod history;
pub mod websocket;

pub use history::{HistoryError, HistorySource, HttpHistoryClient};
pub use websocket::{Connector, Link, WsConnector};
