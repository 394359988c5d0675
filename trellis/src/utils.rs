use std::{env, path::Path};

pub fn format_bytes(bytesval: usize, precision: usize) -> String {
    let mut val = bytesval as f32;

    for unit in ["bytes", "KiB", "MiB", "GiB", "TiB"] {
        if val < 1024.0 {
            return format!("{:.precision$} {}", val, unit, precision = precision);
        }

        val /= 1024.0;
    }

    format!("{bytesval} bytes")
}

pub fn find_ffmpeg() -> Option<String> {
    let bin = if cfg!(target_os = "windows") {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    };

    if Path::new(bin).exists() {
        return Some(bin.to_owned());
    }

    env::var("PATH")
        .ok()?
        .split(if cfg!(target_os = "windows") {
            ';'
        } else {
            ':'
        })
        .find_map(|s| {
            let x = Path::new(s).join(bin);

            if x.exists() {
                Some(x.to_str().unwrap().to_owned())
            } else {
                None
            }
        })
}

/// Default data directory (vault, device identities), created on demand.
pub fn data_dir() -> std::path::PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| ".".into())
        .join("trellis")
}
