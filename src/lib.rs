//! CrabView: peer-to-peer camera stream viewing for Tauri applications
//!
//! This crate negotiates receive-only WebRTC sessions with remote camera
//! workers. A backend registry issues each stream session, a WebSocket relay
//! carries the offer/answer/ICE exchange, and a per-camera controller keeps
//! the session alive across transient failures.
//!
//! # Features
//! - Session lifecycle as an explicit state machine
//! - Bounded exponential-backoff reconnects with manual override
//! - Session-scoped signaling that ignores stale or foreign messages
//! - Status change events for the frontend
//!
//! # Usage
//! Add this to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! crabview = "0.3"
//! tauri = { version = "2.0", features = ["protocol-asset"] }
//! ```
//!
//! Then in your Tauri app:
//! ```rust,ignore
//! fn main() {
//!     tauri::Builder::default()
//!         .plugin(crabview::init())
//!         .run(tauri::generate_context!())
//!         .expect("error while running tauri application");
//! }
//! ```
//!
//! Without Tauri, drive a [`StreamSessionController`] directly:
//! ```rust,ignore
//! let config = crabview::config::CrabViewConfig::load_layered(Some("crabview.toml"))?;
//! let controller = crabview::StreamSessionController::new(
//!     crabview::StreamTarget::new("cam-7", "site-2"),
//!     config.stream_dependencies()?,
//!     config.controller_options(),
//! );
//! controller.start().await?;
//! ```
pub mod commands;
pub mod config;
pub mod errors;
pub mod invariant_ppt;
pub mod types;
pub mod webrtc;

// Mock collaborators for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::CrabViewConfig;
pub use errors::StreamError;
pub use types::{ConnectionState, SessionState, SessionStatus, StreamTarget};
pub use crate::webrtc::controller::{ControllerOptions, StreamDependencies, StreamSessionController};

use tauri::{
    plugin::{Builder, TauriPlugin},
    Runtime,
};

/// Initialize the CrabView plugin with all commands
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("crabview")
        .invoke_handler(tauri::generate_handler![
            // Stream commands
            commands::stream::start_camera_stream,
            commands::stream::stop_camera_stream,
            commands::stream::reconnect_camera_stream,
            commands::stream::get_camera_stream_status,
            commands::stream::list_camera_streams,
            // Configuration commands
            commands::config::get_config,
            commands::config::update_config,
            commands::config::reset_config,
        ])
        .build()
}

/// Initialize logging for stream sessions
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabview=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        max_retries: crate::webrtc::retry::MAX_RETRIES,
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub max_retries: u32,
}
