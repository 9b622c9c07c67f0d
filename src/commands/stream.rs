use crate::commands::config::current_config;
use crate::types::{SessionStatus, StreamTarget};
use crate::webrtc::controller::{ControllerOptions, StreamDependencies, StreamSessionController};
use std::collections::HashMap;
use tauri::{command, AppHandle, Emitter, Runtime};
use tokio::sync::{watch, RwLock};

/// Tauri event carrying every `SessionStatus` change
pub const STATUS_EVENT: &str = "crabview://stream-status";

// One controller per camera id
lazy_static::lazy_static! {
    static ref STREAMS: RwLock<HashMap<String, StreamSessionController>> = RwLock::new(HashMap::new());
}

/// Register the controller for `target` without starting it.
///
/// A camera whose previous session has settled keeps its controller; one that
/// is still active is refused. The flag is true only for the call that
/// inserted the controller.
pub async fn register_stream(
    target: StreamTarget,
    deps: StreamDependencies,
    options: ControllerOptions,
) -> Result<(StreamSessionController, bool), String> {
    let mut streams = STREAMS.write().await;
    match streams.get(&target.camera_id) {
        Some(existing) if !existing.state().is_settled() => Err(format!(
            "Camera {} is already streaming ({})",
            target.camera_id,
            existing.state()
        )),
        Some(existing) => Ok((existing.clone(), false)),
        None => {
            let controller = StreamSessionController::new(target.clone(), deps, options);
            streams.insert(target.camera_id.clone(), controller.clone());
            Ok((controller, true))
        }
    }
}

/// Start (or restart) the stream for `target` using the given collaborators.
pub async fn open_stream(
    target: StreamTarget,
    deps: StreamDependencies,
    options: ControllerOptions,
) -> Result<StreamSessionController, String> {
    let (controller, _) = register_stream(target, deps, options).await?;
    controller.start().await.map_err(|e| e.to_string())?;
    Ok(controller)
}

fn forward_status<R: Runtime>(app: AppHandle<R>, mut status: watch::Receiver<SessionStatus>) {
    tauri::async_runtime::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if let Err(e) = app.emit(STATUS_EVENT, &current) {
                log::warn!("Failed to emit stream status: {}", e);
            }
        }
        log::debug!("Status forwarding ended");
    });
}

async fn lookup(camera_id: &str) -> Option<StreamSessionController> {
    STREAMS.read().await.get(camera_id).cloned()
}

/// Start viewing a remote camera
#[command]
pub async fn start_camera_stream<R: Runtime>(
    app: AppHandle<R>,
    camera_id: String,
    site_id: String,
) -> Result<SessionStatus, String> {
    log::info!("Starting camera stream {} at site {}", camera_id, site_id);

    let config = current_config()?;
    let deps = config.stream_dependencies().map_err(|e| e.to_string())?;

    let (controller, created) = register_stream(
        StreamTarget::new(camera_id, site_id),
        deps,
        config.controller_options(),
    )
    .await?;
    // Forward from insertion so a failed first start is still reported
    if created {
        forward_status(app, controller.subscribe());
    }
    controller.start().await.map_err(|e| e.to_string())?;
    Ok(controller.status())
}

/// Stop viewing a camera. Unknown cameras are not an error.
#[command]
pub async fn stop_camera_stream(camera_id: String) -> Result<(), String> {
    log::info!("Stopping camera stream {}", camera_id);

    let controller = STREAMS.write().await.remove(&camera_id);
    match controller {
        Some(controller) => controller.stop().await,
        None => log::debug!("No stream registered for {}", camera_id),
    }
    Ok(())
}

/// Manually reconnect a camera stream, resetting its retry budget
#[command]
pub async fn reconnect_camera_stream(camera_id: String) -> Result<SessionStatus, String> {
    log::info!("Reconnecting camera stream {}", camera_id);

    let controller = lookup(&camera_id)
        .await
        .ok_or_else(|| format!("No stream for camera {}", camera_id))?;
    controller.reconnect().await.map_err(|e| e.to_string())?;
    Ok(controller.status())
}

/// Current status of one camera stream
#[command]
pub async fn get_camera_stream_status(camera_id: String) -> Result<Option<SessionStatus>, String> {
    Ok(lookup(&camera_id).await.map(|c| c.status()))
}

/// Status of every registered camera stream
#[command]
pub async fn list_camera_streams() -> Result<Vec<SessionStatus>, String> {
    let streams = STREAMS.read().await;
    let mut statuses: Vec<SessionStatus> = streams.values().map(|c| c.status()).collect();
    statuses.sort_by(|a, b| a.target.camera_id.cmp(&b.target.camera_id));
    Ok(statuses)
}
