//! Sandboxed plugin runtime
//!
//! Compiles plugin bytecode into a wasmtime module and exposes a sequential
//! request/response contract over the guest's stdio streams. Each message is
//! a JSON document terminated by a single delimiter byte; the guest's stderr
//! is captured and surfaced on failure.
//!
//! Filesystem visibility is capability-gated: the mount list is built from
//! the access policy before every instantiation. With no grants the guest
//! gets no preopens at all, so path lookups fail closed.
//!
//! Lifecycle per plugin handle: `Uncompiled -> Compiled -> Running -> Closed`.
//! `close` fires at most once; any call after it is an error.

use crate::policy::{Permission, PluginAccessPolicy};
use crate::pool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use stencil_plugin_api::{
    ExitCode, Request, Response, ENV_HOST_PROJECT_PATH, ENV_MESSAGE_DELIMITER, ENV_PROJECT_PATH,
    GUEST_PROJECT_PATH, HANDLE_REQUEST_FN, MESSAGE_DELIMITER,
};
use thiserror::Error;
use wasmtime::{Config, Engine, ExternType, Linker, Module, Store, ValType};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

/// Upper bound on a single framed response, including diagnostics.
const MAX_STREAM_BYTES: usize = 32 * 1024 * 1024;

/// Errors raised by the sandbox runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("func {HANDLE_REQUEST_FN} must be exported in your plugin")]
    HandlerNotExported,

    #[error("func {HANDLE_REQUEST_FN} must take no parameters and return a single int64")]
    AbiMismatch,

    #[error("instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("failed to preopen directory {path}: {source}")]
    Preopen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("call to {function} failed: {source}\nLogs:\n{logs}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
        logs: String,
    },

    #[error("{code}\nLogs:\n{logs}")]
    PluginExit { code: ExitCode, logs: String },

    #[error("protocol error: {reason}\nLogs:\n{logs}")]
    Protocol { reason: String, logs: String },

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("plugin is closed")]
    Closed,
}

/// A capability binding exposing one host directory to the guest.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Path visible inside the guest.
    pub guest_path: String,

    /// Host directory backing the mount.
    pub host_path: PathBuf,

    /// Whether the guest may write through the mount.
    pub writable: bool,
}

impl Mount {
    /// A read-only mount at the given guest path.
    pub fn read_only(guest_path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            guest_path: guest_path.into(),
            host_path: host_path.into(),
            writable: false,
        }
    }
}

/// Build the mount list for one invocation from the access policy.
///
/// Granting the read-only CWD capability mounts `cwd` at the fixed guest
/// project path. With no grants the list is empty and the guest sees no
/// host filesystem at all.
pub fn project_mounts(policy: &PluginAccessPolicy, cwd: &Path) -> Vec<Mount> {
    if policy.authorize(Permission::CwdRo) {
        vec![Mount::read_only(GUEST_PROJECT_PATH, cwd)]
    } else {
        Vec::new()
    }
}

struct WasiState {
    wasi: WasiP1Ctx,
}

/// Compiles plugin bytecode into runnable [`Plugin`] handles.
///
/// Holds the wasmtime engine; cheap to clone modules out of, expensive to
/// construct, so callers are expected to share one per build.
pub struct PluginCompiler {
    engine: Engine,
    compiled: AtomicUsize,
}

impl PluginCompiler {
    pub fn new() -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(SandboxError::EngineCreation)?;
        Ok(Self {
            engine,
            compiled: AtomicUsize::new(0),
        })
    }

    /// Number of modules successfully compiled so far.
    pub fn compiled_count(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }

    /// Compile bytecode and validate the guest ABI.
    ///
    /// The module must export [`HANDLE_REQUEST_FN`] taking no parameters and
    /// returning exactly one `i64`. Any mismatch is rejected here, at load
    /// time, before the module ever runs.
    pub fn compile(&self, bytes: &[u8], mounts: Vec<Mount>) -> Result<Plugin, SandboxError> {
        let module = Module::new(&self.engine, bytes).map_err(SandboxError::ModuleCompilation)?;

        let handler = module
            .get_export(HANDLE_REQUEST_FN)
            .ok_or(SandboxError::HandlerNotExported)?;

        let ExternType::Func(func_ty) = handler else {
            return Err(SandboxError::HandlerNotExported);
        };

        if func_ty.params().len() != 0 || func_ty.results().len() != 1 {
            return Err(SandboxError::AbiMismatch);
        }
        if !matches!(func_ty.results().next(), Some(ValType::I64)) {
            return Err(SandboxError::AbiMismatch);
        }

        self.compiled.fetch_add(1, Ordering::Relaxed);

        Ok(Plugin {
            engine: self.engine.clone(),
            module,
            mounts,
            delimiter: MESSAGE_DELIMITER,
            scratch: Some(pool::get_buffer()),
            logs: Vec::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// An instantiated sandbox module bound to stdio buffers and a message
/// delimiter.
///
/// The request/response protocol is strictly sequential; the `&mut self`
/// receiver on [`send_request`](Self::send_request) enforces that a handle
/// is never called concurrently. Handles are never shared across concurrent
/// callers.
pub struct Plugin {
    engine: Engine,
    module: Module,
    mounts: Vec<Mount>,
    delimiter: u8,
    scratch: Option<Vec<u8>>,
    logs: Vec<u8>,
    closed: AtomicBool,
}

impl Plugin {
    /// Send one framed request and read back one framed response.
    ///
    /// A non-OK handler exit code, an empty frame, or a malformed frame is
    /// an error carrying the guest's captured stderr.
    pub fn send_request(&mut self, req: &Request) -> Result<Response, SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::Closed);
        }

        let mut frame = self.scratch.take().unwrap_or_default();
        frame.clear();
        serde_json::to_writer(&mut frame, req).map_err(SandboxError::Encode)?;
        frame.push(self.delimiter);

        let stdin = MemoryInputPipe::new(frame.clone());
        self.scratch = Some(frame);

        let stdout = MemoryOutputPipe::new(MAX_STREAM_BYTES);
        let stderr = MemoryOutputPipe::new(MAX_STREAM_BYTES);

        let wasi = self.build_wasi(stdin, stdout.clone(), stderr.clone())?;
        let mut store = Store::new(&self.engine, WasiState { wasi });

        let mut linker: Linker<WasiState> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)
            .map_err(SandboxError::Instantiation)?;

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(SandboxError::Instantiation)?;

        // Reactor modules (e.g. Go's wasip1 c-shared target) expose their
        // setup as _initialize rather than _start.
        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ()).map_err(|e| SandboxError::FunctionCall {
                function: "_initialize",
                source: e,
                logs: pipe_to_string(&stderr),
            })?;
        }

        let handler = instance
            .get_typed_func::<(), i64>(&mut store, HANDLE_REQUEST_FN)
            .map_err(|_| SandboxError::HandlerNotExported)?;

        let raw_code = handler
            .call(&mut store, ())
            .map_err(|e| SandboxError::FunctionCall {
                function: HANDLE_REQUEST_FN,
                source: e,
                logs: pipe_to_string(&stderr),
            })?;

        drop(store);

        self.logs = stderr.contents().to_vec();

        let code = ExitCode(raw_code as u64);
        if !code.is_ok() {
            return Err(SandboxError::PluginExit {
                code,
                logs: self.logs_string(),
            });
        }

        let out = stdout.contents();
        let frame_end =
            out.iter()
                .position(|&b| b == self.delimiter)
                .ok_or_else(|| SandboxError::Protocol {
                    reason: "response is missing the message delimiter".into(),
                    logs: self.logs_string(),
                })?;

        if frame_end == 0 {
            return Err(SandboxError::Protocol {
                reason: "response frame is empty".into(),
                logs: self.logs_string(),
            });
        }

        serde_json::from_slice(&out[..frame_end]).map_err(|e| SandboxError::Protocol {
            reason: format!("malformed response: {e}"),
            logs: self.logs_string(),
        })
    }

    /// Diagnostic output captured from the guest's last invocation.
    pub fn logs(&self) -> &[u8] {
        &self.logs
    }

    fn logs_string(&self) -> String {
        String::from_utf8_lossy(&self.logs).into_owned()
    }

    /// Release the handle's resources. Idempotent; safe to call repeatedly
    /// or after a failed request.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(buf) = self.scratch.take() {
            pool::put_buffer(buf);
        }
        self.logs = Vec::new();
    }

    fn build_wasi(
        &self,
        stdin: MemoryInputPipe,
        stdout: MemoryOutputPipe,
        stderr: MemoryOutputPipe,
    ) -> Result<WasiP1Ctx, SandboxError> {
        let mut builder = WasiCtxBuilder::new();
        builder.stdin(stdin).stdout(stdout).stderr(stderr);

        let host_project = self
            .mounts
            .iter()
            .find(|m| m.guest_path == GUEST_PROJECT_PATH)
            .map(|m| m.host_path.to_string_lossy().into_owned())
            .unwrap_or_default();

        builder
            .env(ENV_PROJECT_PATH, GUEST_PROJECT_PATH)
            .env(ENV_HOST_PROJECT_PATH, &host_project)
            .env(
                ENV_MESSAGE_DELIMITER,
                String::from_utf8_lossy(&[self.delimiter]),
            );

        for mount in &self.mounts {
            let (dir_perms, file_perms) = if mount.writable {
                (DirPerms::all(), FilePerms::all())
            } else {
                (DirPerms::READ, FilePerms::READ)
            };

            builder
                .preopened_dir(&mount.host_path, &mount.guest_path, dir_perms, file_perms)
                .map_err(|e| SandboxError::Preopen {
                    path: mount.host_path.clone(),
                    source: e,
                })?;
        }

        Ok(builder.build_p1())
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.close();
    }
}

fn pipe_to_string(pipe: &MemoryOutputPipe) -> String {
    String::from_utf8_lossy(&pipe.contents()).into_owned()
}
