use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use crate::executable::Platform;

const RELEASE_HOST: &str = "github.com:443";

pub const OFFLINE_MESSAGE: &str = "No internet connection. Cannot download pogscript executable";

/// Whether the release host resolves.
pub fn is_online() -> bool {
    RELEASE_HOST
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Download the pogscript release for `platform` to `exe_path`.
///
/// `progress` receives human-readable status lines. Blocking; run it off the
/// async executor.
pub fn install(
    platform: Platform,
    exe_path: &Path,
    progress: impl Fn(&str),
) -> Result<String, String> {
    if !is_online() {
        return Err(OFFLINE_MESSAGE.to_string());
    }

    progress("Downloading pogscript...");
    let url = platform.release_url();
    log::info!("Downloading {} to {}", url, exe_path.display());

    if let Err(e) = download_to(&url, exe_path) {
        log::warn!("Download failed: {}", e);
        return Err(format!("Download failed: {}", e));
    }

    Ok("Successfully downloaded pogscript executable".to_string())
}

fn partial_path(exe_path: &Path) -> PathBuf {
    let mut name = exe_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "pogscript".into());
    name.push(".part");
    exe_path.with_file_name(name)
}

/// Fetch `url` into a sibling `.part` file and move it over `exe_path` only
/// once the body is complete. The partial file is removed on failure.
fn download_to(url: &str, exe_path: &Path) -> Result<(), String> {
    if let Some(dir) = exe_path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
    }

    let partial = partial_path(exe_path);
    let result = fetch(url, &partial).and_then(|()| {
        fs::rename(&partial, exe_path)
            .map_err(|e| format!("Failed to move into {}: {}", exe_path.display(), e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn fetch(url: &str, dest: &Path) -> Result<(), String> {
    let response = ureq::get(url).call().map_err(|e| e.to_string())?;
    let mut reader = response.into_body().into_reader();
    let mut file = fs::File::create(dest)
        .map_err(|e| format!("Failed to create {}: {}", dest.display(), e))?;
    io::copy(&mut reader, &mut file).map_err(|e| e.to_string())?;
    drop(file);

    mark_executable(dest).map_err(|e| format!("Failed to mark executable: {}", e))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove the installed executable.
pub fn uninstall(exe_path: &Path) -> Result<String, String> {
    match fs::remove_file(exe_path) {
        Ok(()) => {
            log::info!("Removed {}", exe_path.display());
            Ok("Successfully uninstalled pogscript executable".to_string())
        }
        Err(e) => {
            log::warn!("Uninstall failed: {}", e);
            Err(format!("Uninstall failed: {}", e))
        }
    }
}
