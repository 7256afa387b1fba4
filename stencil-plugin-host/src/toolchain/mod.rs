//! Go toolchain provisioning and plugin builds
//!
//! Plugins are small Go programs cross-compiled to WASI bytecode
//! (`GOOS=wasip1 GOARCH=wasm`). This module locates a Go compiler on the
//! host, or installs a managed copy when none is present, gates on a
//! minimum version, and drives the actual `go build` invocation.
//!
//! The expensive bootstrap runs at most once per process: [`ToolsProvider`]
//! memoizes the `{builder, compiler}` bundle, replaying a cached error
//! rather than retrying a failed install.

pub mod archive;
mod install;

pub use install::{go_download_url, install_go, managed_gomodcache_dir, managed_root};

use crate::cancel::{CancelToken, Cancelled};
use crate::sandbox::{PluginCompiler, SandboxError};
use regex::Regex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Minimum supported Go minor version (1.x).
pub const MIN_MINOR_GO_VERSION: u32 = 24;

/// Version installed when no usable compiler is found on the host.
pub const TARGET_GO_VERSION: &str = "1.25.5";

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("go compiler not found on PATH")]
    NotFound,

    #[error("go compiler not found at {0}")]
    NotFoundAt(PathBuf),

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid version output: {0}")]
    InvalidVersion(String),

    #[error(
        "go CLI (at {path}) is version {version}. please upgrade to at least 1.{min_minor} to properly build plugins"
    )]
    TooOld {
        path: PathBuf,
        version: GoVersion,
        min_minor: u32,
    },

    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unsupported host platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),

    #[error("go.mod file required for {0}")]
    MissingGoMod(PathBuf),

    #[error("failed to build plugin {path}: {stderr}")]
    BuildFailed { path: PathBuf, stderr: String },

    #[error("plugin build produced no output: {0}")]
    MissingOutput(#[source] io::Error),

    #[error("failed to create WASM compiler: {0}")]
    Compiler(#[source] SandboxError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("{0}")]
    Io(#[source] io::Error),
}

/// A parsed `<major>.<minor>.<patch>` compiler version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for GoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".+go([0-9]+)\.([0-9]+)\.([0-9]+)?.+").expect("static pattern"))
}

/// Parse a version triplet out of free-form `go version` output.
///
/// Anything other than exactly three captured groups is rejected.
pub fn parse_go_version(output: &str) -> Result<GoVersion, ToolchainError> {
    let invalid = || ToolchainError::InvalidVersion(output.trim().to_string());

    let caps = version_regex().captures(output).ok_or_else(invalid)?;

    let mut parts = [0u32; 3];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps
            .get(i + 1)
            .ok_or_else(invalid)?
            .as_str()
            .parse()
            .map_err(|_| invalid())?;
    }

    Ok(GoVersion {
        major: parts[0],
        minor: parts[1],
        patch: parts[2],
    })
}

/// Handle to a Go compiler binary.
#[derive(Debug, Clone)]
pub struct GoCli {
    path: PathBuf,
}

/// The `go` binary name for the host platform.
pub fn go_binary_name() -> &'static str {
    if cfg!(windows) {
        "go.exe"
    } else {
        "go"
    }
}

impl GoCli {
    /// Probe the host's command search path.
    pub fn locate() -> Result<Self, ToolchainError> {
        let path_var = std::env::var_os("PATH").ok_or(ToolchainError::NotFound)?;
        Self::locate_in(&path_var)
    }

    /// Probe an explicit, `PATH`-formatted search path.
    pub fn locate_in(paths: &std::ffi::OsStr) -> Result<Self, ToolchainError> {
        for dir in std::env::split_paths(paths) {
            let candidate = dir.join(go_binary_name());
            if candidate.is_file() {
                return Ok(Self { path: candidate });
            }
        }
        Err(ToolchainError::NotFound)
    }

    /// Use the compiler at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, ToolchainError> {
        let path = path.into();
        if !path.is_file() {
            return Err(ToolchainError::NotFoundAt(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `go version` and parse the triplet out of its output.
    pub fn version(&self) -> Result<GoVersion, ToolchainError> {
        let output = Command::new(&self.path)
            .arg("version")
            .output()
            .map_err(|e| ToolchainError::Spawn {
                tool: self.path.display().to_string(),
                source: e,
            })?;

        parse_go_version(&String::from_utf8_lossy(&output.stdout))
    }

    /// Fail if the compiler's minor version is below `min_minor`.
    pub fn ensure_minimum_version(&self, min_minor: u32) -> Result<(), ToolchainError> {
        let version = self.version()?;
        if version.minor < min_minor {
            return Err(ToolchainError::TooOld {
                path: self.path.clone(),
                version,
                min_minor,
            });
        }
        Ok(())
    }
}

/// Walk up from `start` looking for a directory containing `name`.
fn find_sibling(start: &Path, name: &str) -> Option<PathBuf> {
    let mut dir = if start.is_dir() {
        Some(start)
    } else {
        start.parent()
    };
    while let Some(d) = dir {
        let candidate = d.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent();
    }
    None
}

/// Builds Go plugin sources into WASI bytecode.
pub struct GoBuilder {
    cli: GoCli,
    /// Overrides GOMODCACHE for managed installs, keeping the host
    /// environment clean.
    gomodcache: Option<PathBuf>,
}

impl GoBuilder {
    pub fn new(cli: GoCli, gomodcache: Option<PathBuf>) -> Self {
        Self { cli, gomodcache }
    }

    pub fn cli(&self) -> &GoCli {
        &self.cli
    }

    /// Cross-compile one plugin source to WASI bytecode and return it.
    pub fn build_wasm(&self, from: &Path) -> Result<Vec<u8>, ToolchainError> {
        let gomod = find_sibling(from, "go.mod")
            .ok_or_else(|| ToolchainError::MissingGoMod(from.to_path_buf()))?;
        let module_dir = gomod.parent().unwrap_or(Path::new("."));

        let scratch = tempfile::tempdir().map_err(ToolchainError::Io)?;
        let out_path = scratch.path().join("plugin.wasm");

        let mut cmd = Command::new(self.cli.path());
        cmd.arg("build")
            .arg("-buildmode=c-shared")
            .arg("-o")
            .arg(&out_path)
            .arg(from)
            .current_dir(module_dir)
            .env("GOOS", "wasip1")
            .env("GOARCH", "wasm");

        if let Some(cache) = &self.gomodcache {
            cmd.env("GOMODCACHE", cache);
        }

        let output = cmd.output().map_err(|e| ToolchainError::Spawn {
            tool: self.cli.path().display().to_string(),
            source: e,
        })?;

        if !output.status.success() {
            return Err(ToolchainError::BuildFailed {
                path: from.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        std::fs::read(&out_path).map_err(ToolchainError::MissingOutput)
    }
}

/// Progress hooks for a managed compiler install.
#[derive(Default)]
pub struct InstallHooks {
    pub on_download: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_download_complete: Option<Box<dyn Fn() + Send + Sync>>,
}

/// The memoized `{builder, compiler}` bundle used by registry builds.
pub struct BuildTools {
    pub builder: GoBuilder,
    pub compiler: PluginCompiler,
}

/// Lazily constructs [`BuildTools`] at most once per process.
///
/// The first `get` performs the full bootstrap (PATH probe, optional
/// download and install, version gate). Later calls replay the cached
/// bundle or the cached error; a failed bootstrap is never retried.
pub struct ToolsProvider {
    cell: OnceLock<Result<Arc<BuildTools>, Arc<ToolchainError>>>,
    hooks: InstallHooks,
    cancel: CancelToken,
}

impl ToolsProvider {
    pub fn new(hooks: InstallHooks, cancel: CancelToken) -> Self {
        Self {
            cell: OnceLock::new(),
            hooks,
            cancel,
        }
    }

    pub fn get(&self) -> Result<Arc<BuildTools>, Arc<ToolchainError>> {
        self.cell
            .get_or_init(|| build_tools(&self.hooks, &self.cancel).map(Arc::new).map_err(Arc::new))
            .clone()
    }
}

fn build_tools(hooks: &InstallHooks, cancel: &CancelToken) -> Result<BuildTools, ToolchainError> {
    let mut gomodcache = None;

    let cli = match GoCli::locate() {
        Ok(cli) => cli,
        Err(_) => {
            tracing::debug!("go not detected on PATH, checking managed install directory");
            let root = managed_root()?;
            let cli = install::get_or_install_go(&root, hooks, cancel)?;
            gomodcache = Some(managed_gomodcache_dir(&root)?);
            cli
        }
    };

    cli.ensure_minimum_version(MIN_MINOR_GO_VERSION)?;

    let compiler = PluginCompiler::new().map_err(ToolchainError::Compiler)?;

    Ok(BuildTools {
        builder: GoBuilder::new(cli, gomodcache),
        compiler,
    })
}
