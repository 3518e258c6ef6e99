use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::PixelFormat;

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Find the first V4L2 capture node offering `preferred`, falling back to
/// any node with a format the conversion engine accepts.
pub fn auto_detect_device(preferred: PixelFormat) -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        for fmt in formats {
            let format = [PixelFormat::Yuyv422, PixelFormat::Mono8]
                .into_iter()
                .find(|f| fmt.fourcc == FourCC::new(&f.fourcc()));
            match format {
                Some(format) if format == preferred => {
                    info!("Found {:?} device: {} - {}", format, path, caps.card);
                    return Ok(FoundDevice { path, format });
                }
                Some(format) if fallback.is_none() => {
                    fallback = Some(FoundDevice {
                        path: path.clone(),
                        format,
                    });
                }
                _ => {}
            }
        }
    }

    match fallback {
        Some(found) => {
            warn!(
                "No {:?} device found, using {:?} on {}",
                preferred, found.format, found.path
            );
            Ok(found)
        }
        None => Err(eyre!("No suitable capture device found")),
    }
}

/// Pin the calling thread to `core`, if that core exists.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(id) = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.id == core)
    else {
        warn!("CPU core {} not available, capture thread stays unpinned", core);
        return false;
    };

    let pinned = core_affinity::set_for_current(id);
    if pinned {
        info!("Capture thread pinned to core {}", core);
    }
    pinned
}
