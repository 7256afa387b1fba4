//! Managed Go compiler installs
//!
//! When no usable compiler is on the PATH, a release archive is downloaded
//! from the official distribution endpoint and extracted under a managed
//! directory, together with a dedicated module cache so the host
//! environment is never polluted. Installation is idempotent: an existing
//! managed install short-circuits the download.

use super::archive::{extract, ArchiveFormat};
use super::{go_binary_name, GoCli, InstallHooks, ToolchainError, TARGET_GO_VERSION};
use crate::cancel::CancelToken;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GOMODCACHE_DIR_NAME: &str = "modcache";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Root directory for managed toolchain installs.
pub fn managed_root() -> Result<PathBuf, ToolchainError> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or(ToolchainError::NotFound)?;
    let root = base.join("stencil").join("build");
    fs::create_dir_all(&root).map_err(ToolchainError::Io)?;
    Ok(root)
}

/// Dedicated module cache for managed installs.
pub fn managed_gomodcache_dir(root: &Path) -> Result<PathBuf, ToolchainError> {
    let dir = root.join(GOMODCACHE_DIR_NAME);
    fs::create_dir_all(&dir).map_err(ToolchainError::Io)?;
    Ok(dir)
}

fn managed_go_binary(root: &Path) -> PathBuf {
    root.join("go").join("bin").join(go_binary_name())
}

/// Release archive URL for a version and host platform.
pub fn go_download_url(version: &str, os: &str, arch: &str) -> Result<String, ToolchainError> {
    let goos = match os {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        other => {
            return Err(ToolchainError::UnsupportedPlatform {
                os: other.to_string(),
                arch: arch.to_string(),
            })
        }
    };
    let goarch = match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => {
            return Err(ToolchainError::UnsupportedPlatform {
                os: os.to_string(),
                arch: other.to_string(),
            })
        }
    };
    let ext = if goos == "windows" { ".zip" } else { ".tar.gz" };
    Ok(format!("https://go.dev/dl/go{version}.{goos}-{goarch}{ext}"))
}

/// Return the managed compiler, installing it first if absent.
pub fn get_or_install_go(
    root: &Path,
    hooks: &InstallHooks,
    cancel: &CancelToken,
) -> Result<GoCli, ToolchainError> {
    let binary = managed_go_binary(root);
    if let Ok(cli) = GoCli::at(&binary) {
        tracing::debug!(path = %binary.display(), "reusing managed go install");
        return Ok(cli);
    }

    if let Some(on_download) = &hooks.on_download {
        on_download();
    }
    install_go(TARGET_GO_VERSION, root, cancel)?;
    if let Some(on_complete) = &hooks.on_download_complete {
        on_complete();
    }

    GoCli::at(binary)
}

/// Download and extract a Go release archive into `root`.
pub fn install_go(version: &str, root: &Path, cancel: &CancelToken) -> Result<GoCli, ToolchainError> {
    cancel.bail()?;

    let url = go_download_url(version, std::env::consts::OS, std::env::consts::ARCH)?;
    let format = ArchiveFormat::from_path(&url).unwrap_or(ArchiveFormat::TarGz);

    tracing::info!(%url, "downloading go toolchain");

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| ToolchainError::Download {
            url: url.clone(),
            source: e,
        })?;

    let response = client
        .get(&url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| ToolchainError::Download {
            url: url.clone(),
            source: e,
        })?;

    extract(response, root, format, cancel)?;

    GoCli::at(managed_go_binary(root))
}
