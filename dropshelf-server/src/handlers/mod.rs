//! HTTP and WebSocket request handlers

pub mod auth;
pub mod files;
pub mod handle_websocket;
pub mod upload;

pub use auth::{adduser_handler, login_handler};
pub use files::{archive_handler, download_handler, health_handler, shortlink_handler};
pub use handle_websocket::websocket_handler;
pub use upload::upload_handler;
