//! USB backend resolution.
//!
//! Before opening any device, the resolver looks for a native libusb
//! library at a fixed, ordered list of per-OS locations. The located path
//! is diagnostic only: device access always goes through nusb's built-in
//! enumeration, which is verified once up front when no candidate library
//! exists, so a host with neither a native library nor working enumeration
//! fails fast with the full probe list. Every candidate is probed and
//! recorded even after a hit, so failures can report the complete list.

use std::path::{Path, PathBuf};

use nusb::MaybeFuture;
use tracing::{debug, info, warn};

use crate::error::JensenError;

/// Outcome of backend resolution.
#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    /// First native library found, if any candidate existed. Reported for
    /// diagnostics; transfers do not load it.
    pub library: Option<PathBuf>,
    /// Every path probed, in order.
    pub probed: Vec<PathBuf>,
}

/// Ordered candidate library paths for a given OS name (`std::env::consts::OS`
/// values). `exe_dir` feeds the Windows co-located-DLL candidate.
pub fn candidate_paths(os: &str, exe_dir: Option<&Path>) -> Vec<PathBuf> {
    match os {
        "macos" => vec![
            // Apple-Silicon Homebrew, Intel Homebrew, MacPorts, system
            PathBuf::from("/opt/homebrew/lib/libusb-1.0.0.dylib"),
            PathBuf::from("/usr/local/lib/libusb-1.0.0.dylib"),
            PathBuf::from("/opt/local/lib/libusb-1.0.0.dylib"),
            PathBuf::from("/usr/lib/libusb-1.0.0.dylib"),
        ],
        "linux" => vec![
            PathBuf::from("/usr/lib/aarch64-linux-gnu/libusb-1.0.so.0"),
            PathBuf::from("/usr/lib/x86_64-linux-gnu/libusb-1.0.so.0"),
            PathBuf::from("/usr/lib/libusb-1.0.so.0"),
            PathBuf::from("/usr/local/lib/libusb-1.0.so.0"),
        ],
        "windows" => match exe_dir {
            Some(dir) => vec![dir.join("libusb-1.0.dll")],
            None => vec![PathBuf::from("libusb-1.0.dll")],
        },
        _ => Vec::new(),
    }
}

/// Probe the candidate list with an injectable existence check.
///
/// All candidates are visited in order regardless of early hits; the first
/// existing path wins.
pub fn resolve_with<F>(os: &str, exe_dir: Option<&Path>, probe: F) -> ResolvedBackend
where
    F: Fn(&Path) -> bool,
{
    let mut probed = Vec::new();
    let mut library = None;
    for path in candidate_paths(os, exe_dir) {
        let exists = probe(&path);
        debug!(path = %path.display(), exists, "Probed backend candidate");
        if exists && library.is_none() {
            library = Some(path.clone());
        }
        probed.push(path);
    }
    ResolvedBackend { library, probed }
}

/// Resolve the backend for the running host.
///
/// A located native library is reported but never loaded; it signals that
/// the host has a working USB stack. When no candidate exists, enumeration
/// is attempted once to verify the host; if that also fails, the error
/// carries every attempted path.
pub fn resolve() -> Result<ResolvedBackend, JensenError> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let resolved = resolve_with(std::env::consts::OS, exe_dir.as_deref(), |p| p.exists());

    match &resolved.library {
        Some(path) => {
            info!(library = %path.display(), "Native USB library located");
        }
        None => {
            warn!("No native USB library candidate exists, falling back to default discovery");
            nusb::list_devices()
                .wait()
                .map_err(|_| JensenError::BackendInit {
                    attempted: resolved.probed.clone(),
                })?;
        }
    }
    Ok(resolved)
}
