// Hindsight: continuous screen capture with retroactive clip export
//
// The engine keeps a rolling, duration-bounded buffer of short Matroska
// segments on disk. At any moment the user can export the last N seconds,
// or any absolute time window still in the buffer, without having decided
// to record in advance.

pub mod buffer;
pub mod capture;
pub mod clips;
pub mod commands;
pub mod config;
pub mod export;
pub mod gstreamer_init;
pub mod notifications;
pub mod platform;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tauri::Manager;

use buffer::RollingBuffer;
use clips::ClipIndex;
use commands::Engine;
use config::Config;
use export::ExportManager;
use platform::ActivityTracker;

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    env_logger::init();
    gstreamer_init::init_gstreamer_env();

    tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _args, _cwd| {
            // Second launch focuses the existing window instead
            if let Some(window) = app.get_webview_window("main") {
                let _ = window.show();
                let _ = window.set_focus();
            }
        }))
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_notification::init())
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            let config = Config::load_or_default(app.handle());

            // Segments from a previous run are still exportable history
            let buffer = RollingBuffer::recover(
                config.buffer_path.clone(),
                config.max_buffer_secs,
            )?;
            let buffer = Arc::new(RwLock::new(buffer));

            let db_path = app
                .path()
                .app_data_dir()
                .map(|dir| dir.join("clips.db"))
                .unwrap_or_else(|_| std::path::PathBuf::from("clips.db"));
            let clips = Arc::new(ClipIndex::open(&db_path)?);

            app.manage(Engine {
                config: Arc::new(RwLock::new(config)),
                exporter: Arc::new(ExportManager::new(buffer.clone())),
                buffer,
                session: Mutex::new(None),
                clips,
                activity: ActivityTracker::new(),
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::get_capture_state,
            commands::start_capture,
            commands::stop_capture,
            commands::pause_capture,
            commands::resume_capture,
            commands::notify_display_changed,
            commands::report_user_activity,
            commands::get_buffer_status,
            commands::clear_buffer,
            commands::export_last,
            commands::export_range,
            commands::cancel_export,
            commands::get_clips,
            commands::delete_clip,
            commands::get_config,
            commands::update_config,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
