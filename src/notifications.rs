// Desktop notifications

use tauri::AppHandle;
use tauri_plugin_notification::NotificationExt;

/// Notify that an export finished and where the clip landed
pub fn notify_export_complete(app: &AppHandle, clip_name: &str, duration_secs: f64) {
    let result = app
        .notification()
        .builder()
        .title("Clip exported")
        .body(format!("{} ({:.0}s) is ready", clip_name, duration_secs))
        .show();

    if let Err(e) = result {
        log::warn!("Failed to show export notification: {}", e);
    }
}

/// Notify that capture stopped on an unrecoverable error
pub fn notify_capture_error(app: &AppHandle, message: &str) {
    let result = app
        .notification()
        .builder()
        .title("Capture stopped")
        .body(message)
        .show();

    if let Err(e) = result {
        log::warn!("Failed to show capture error notification: {}", e);
    }
}
