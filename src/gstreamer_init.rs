//! GStreamer initialization and environment configuration
//!
//! On Windows the installer may ship a private GStreamer deployment next to
//! the executable; this module points the environment at it before the first
//! GStreamer call. Everywhere else the system installation is used.

use std::sync::Once;

static GSTREAMER_INIT: Once = Once::new();

/// Initialize GStreamer. Must run before any pipeline is built.
pub fn init_gstreamer_env() {
    GSTREAMER_INIT.call_once(|| {
        #[cfg(target_os = "windows")]
        {
            if let Err(e) = setup_private_gstreamer_windows() {
                log::warn!("Failed to set up private GStreamer: {}", e);
                log::info!("Will attempt to use system GStreamer installation");
            }
        }

        match gstreamer::init() {
            Ok(_) => {
                let (major, minor, micro, _) = gstreamer::version();
                log::info!("GStreamer {}.{}.{} initialized", major, minor, micro);
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                log::error!("Screen capture and export will not be available");
            }
        }
    });
}

/// Whether GStreamer initialized successfully
pub fn is_gstreamer_available() -> bool {
    gstreamer::init().is_ok()
}

#[cfg(target_os = "windows")]
fn setup_private_gstreamer_windows() -> Result<(), String> {
    use std::env;

    let exe_path =
        env::current_exe().map_err(|e| format!("Failed to get executable path: {}", e))?;
    let app_dir = exe_path.parent().ok_or("Failed to get app directory")?;

    let gstreamer_dir = app_dir.join("gstreamer");
    let bin_dir = gstreamer_dir.join("1.0").join("msvc_x86_64").join("bin");
    let plugin_dir = gstreamer_dir
        .join("1.0")
        .join("msvc_x86_64")
        .join("lib")
        .join("gstreamer-1.0");

    if !bin_dir.exists() {
        log::debug!("No private GStreamer deployment found at {:?}", gstreamer_dir);
        return Ok(());
    }

    log::info!("Found private GStreamer deployment at {:?}", gstreamer_dir);

    let path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{};{}", bin_dir.display(), path));

    if plugin_dir.exists() {
        env::set_var("GST_PLUGIN_PATH", plugin_dir.to_str().unwrap_or_default());
    }

    let scanner = bin_dir.join("gst-plugin-scanner.exe");
    if scanner.exists() {
        env::set_var("GST_PLUGIN_SCANNER", scanner.to_str().unwrap_or_default());
    }

    // Keep the private plugins out of the system registry
    env::set_var("GST_REGISTRY_FORK", "no");
    if let Some(local_app_data) = dirs::data_local_dir() {
        let registry_path = local_app_data.join("com.hindsight.app").join("gst-registry.bin");
        if let Some(parent) = registry_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        env::set_var("GST_REGISTRY", registry_path.to_str().unwrap_or_default());
    }

    Ok(())
}
