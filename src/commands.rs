// Tauri commands and the shared engine state

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tauri::{AppHandle, Emitter, Manager, State};
use uuid::Uuid;

use crate::buffer::{BufferStatus, RollingBuffer};
use crate::capture::segment_writer::MatroskaSinkFactory;
use crate::capture::source::GstScreenSource;
use crate::capture::{
    CaptureError, CaptureObserver, CaptureSession, CaptureState, SessionCommand, SessionHandle,
};
use crate::capture::session::SessionConfig;
use crate::clips::{ClipIndex, ClipRecord};
use crate::config::Config;
use crate::export::ExportManager;
use crate::gstreamer_init;
use crate::notifications;
use crate::platform::{self, ActivityTracker};

/// Everything the command handlers share, managed by the Tauri app
pub struct Engine {
    pub config: Arc<RwLock<Config>>,
    pub buffer: Arc<RwLock<RollingBuffer>>,
    pub session: Mutex<Option<SessionHandle>>,
    pub exporter: Arc<ExportManager>,
    pub clips: Arc<ClipIndex>,
    pub activity: ActivityTracker,
}

/// Forwards engine callbacks to the webview as events
struct EventObserver {
    app: AppHandle,
}

impl CaptureObserver for EventObserver {
    fn state_changed(&self, state: &CaptureState) {
        let _ = self.app.emit("capture-state-changed", state);
    }

    fn buffered_duration_changed(&self, _buffered_secs: f64) {
        let engine = self.app.state::<Engine>();
        let status = engine.buffer.read().status();
        let _ = self.app.emit("buffer-status-changed", status);
    }

    fn warning(&self, message: &str) {
        let _ = self.app.emit("capture-warning", message.to_string());
    }

    fn fatal_error(&self, error: &CaptureError) {
        let message = error.to_string();
        let _ = self.app.emit("capture-warning", message.clone());
        let engine = self.app.state::<Engine>();
        if engine.config.read().notify_capture_error {
            notifications::notify_capture_error(&self.app, &message);
        }
    }
}

// ============================================================================
// Capture
// ============================================================================

#[tauri::command]
pub fn get_capture_state(engine: State<'_, Engine>) -> CaptureState {
    engine
        .session
        .lock()
        .as_ref()
        .map(|s| s.state())
        .unwrap_or_default()
}

#[tauri::command]
pub fn start_capture(app: AppHandle, engine: State<'_, Engine>) -> Result<CaptureState, String> {
    let mut session = engine.session.lock();
    if session.as_ref().is_some_and(|s| s.is_running()) {
        return Err(CaptureError::AlreadyRunning.to_string());
    }

    if !gstreamer_init::is_gstreamer_available() {
        return Err(
            CaptureError::StreamSetupFailed("GStreamer is not available".into()).to_string(),
        );
    }

    let config = engine.config.read().clone();

    // Refuse to start into a disk that cannot hold the buffer
    let required =
        platform::required_buffer_space(config.quality.bitrate_kbps(), config.max_buffer_secs);
    if let Some(available) = platform::available_disk_space(&config.buffer_path) {
        if available < required {
            return Err(CaptureError::InsufficientDiskSpace {
                available,
                required,
            }
            .to_string());
        }
    }

    let activity = engine.activity.clone();
    let handle = CaptureSession::spawn(
        SessionConfig::from(&config),
        Box::new(GstScreenSource::new()),
        Box::new(MatroskaSinkFactory),
        engine.buffer.clone(),
        Arc::new(EventObserver { app }),
        Box::new(move || activity.idle_time()),
        Box::new(platform::capture_permission_granted),
    )
    .map_err(|e| e.to_string())?;

    let state = handle.state();
    *session = Some(handle);
    log::info!("Capture started");
    Ok(state)
}

#[tauri::command]
pub async fn stop_capture(engine: State<'_, Engine>) -> Result<(), String> {
    let handle = engine.session.lock().take();
    let Some(handle) = handle else {
        return Ok(());
    };

    // Joining waits for the final segment to flush; keep it off the IPC thread
    tauri::async_runtime::spawn_blocking(move || handle.stop())
        .await
        .map_err(|e| e.to_string())?;
    log::info!("Capture stopped");
    Ok(())
}

#[tauri::command]
pub fn pause_capture(engine: State<'_, Engine>) {
    if let Some(session) = engine.session.lock().as_ref() {
        session.send(SessionCommand::Pause);
    }
}

#[tauri::command]
pub fn resume_capture(engine: State<'_, Engine>) {
    if let Some(session) = engine.session.lock().as_ref() {
        session.send(SessionCommand::Resume);
    }
}

/// The frontend watches for monitor layout changes; buffered history is not
/// splicable across one
#[tauri::command]
pub fn notify_display_changed(engine: State<'_, Engine>) {
    if let Some(session) = engine.session.lock().as_ref() {
        session.send(SessionCommand::DisplayChanged);
    }
}

#[tauri::command]
pub fn report_user_activity(engine: State<'_, Engine>) {
    engine.activity.touch();
}

// ============================================================================
// Buffer
// ============================================================================

#[tauri::command]
pub fn get_buffer_status(engine: State<'_, Engine>) -> BufferStatus {
    engine.buffer.read().status()
}

#[tauri::command]
pub fn clear_buffer(app: AppHandle, engine: State<'_, Engine>) -> Result<(), String> {
    if engine.exporter.is_exporting() {
        return Err("cannot clear the buffer while an export is running".into());
    }
    let status = {
        let mut buffer = engine.buffer.write();
        buffer.clear();
        buffer.status()
    };
    let _ = app.emit("buffer-status-changed", status);
    log::info!("Buffer cleared");
    Ok(())
}

// ============================================================================
// Export
// ============================================================================

#[tauri::command]
pub async fn export_last(
    app: AppHandle,
    engine: State<'_, Engine>,
    duration_secs: f64,
) -> Result<ClipRecord, String> {
    let exporter = engine.exporter.clone();
    let clips = engine.clips.clone();
    let config = engine.config.read().clone();

    let progress_app = app.clone();
    let descriptor = tauri::async_runtime::spawn_blocking(move || {
        exporter.export_last(duration_secs, &config.export_path, |fraction| {
            let _ = progress_app.emit("export-progress", fraction);
        })
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())?;

    finish_export(&app, &clips, descriptor)
}

#[tauri::command]
pub async fn export_range(
    app: AppHandle,
    engine: State<'_, Engine>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<ClipRecord, String> {
    let exporter = engine.exporter.clone();
    let clips = engine.clips.clone();
    let config = engine.config.read().clone();

    let progress_app = app.clone();
    let descriptor = tauri::async_runtime::spawn_blocking(move || {
        exporter.export_range(start, end, &config.export_path, |fraction| {
            let _ = progress_app.emit("export-progress", fraction);
        })
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())?;

    finish_export(&app, &clips, descriptor)
}

fn finish_export(
    app: &AppHandle,
    clips: &ClipIndex,
    descriptor: crate::export::ClipDescriptor,
) -> Result<ClipRecord, String> {
    let record = clips.insert(&descriptor).map_err(|e| e.to_string())?;
    let _ = app.emit("export-complete", record.clone());

    let engine = app.state::<Engine>();
    if engine.config.read().notify_export_complete {
        let name = record
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip".into());
        notifications::notify_export_complete(app, &name, record.duration_secs);
    }
    Ok(record)
}

#[tauri::command]
pub fn cancel_export(engine: State<'_, Engine>) {
    engine.exporter.cancel();
}

// ============================================================================
// Clips
// ============================================================================

#[tauri::command]
pub fn get_clips(engine: State<'_, Engine>) -> Result<Vec<ClipRecord>, String> {
    engine.clips.list().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn delete_clip(engine: State<'_, Engine>, id: Uuid) -> Result<(), String> {
    engine.clips.delete(id).map_err(|e| e.to_string())
}

// ============================================================================
// Config
// ============================================================================

#[tauri::command]
pub fn get_config(engine: State<'_, Engine>) -> Config {
    engine.config.read().clone()
}

#[tauri::command]
pub fn update_config(
    app: AppHandle,
    engine: State<'_, Engine>,
    new_config: Config,
) -> Result<(), String> {
    new_config.save(&app).map_err(|e| e.to_string())?;

    let old = {
        let mut config = engine.config.write();
        std::mem::replace(&mut *config, new_config.clone())
    };

    // A smaller budget evicts immediately, not at the next registration
    if new_config.max_buffer_secs != old.max_buffer_secs {
        let status = {
            let mut buffer = engine.buffer.write();
            buffer.set_max_duration(new_config.max_buffer_secs);
            buffer.status()
        };
        let _ = app.emit("buffer-status-changed", status);
    }

    // Capture parameters land at the running session's next rotation
    if let Some(session) = engine.session.lock().as_ref() {
        session.send(SessionCommand::UpdateConfig(SessionConfig::from(&new_config)));
    }

    log::info!("Config updated");
    Ok(())
}
