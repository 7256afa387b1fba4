//! stencil-plugin-host: Wasm sandbox runtime for stencil plugins
//!
//! This crate hosts the sandboxed side of package generation: the
//! capability policy deciding what a plugin may see of the host filesystem,
//! the wasmtime runtime that compiles and drives plugin modules over a
//! delimiter-framed stdio protocol, and the toolchain provisioner that
//! turns plugin sources into WASI bytecode.

pub mod cancel;
pub mod policy;
pub mod pool;
pub mod sandbox;
pub mod toolchain;

pub use cancel::{CancelToken, Cancelled};
pub use policy::{Permission, PluginAccessPolicy};
pub use sandbox::{project_mounts, Mount, Plugin, PluginCompiler, SandboxError};
pub use stencil_plugin_api::{
    ExitCode, Issue, IssueLevel, Request, RequestMetadata, Response, WriteFileRequest,
    WriteFileResponse,
};
pub use toolchain::{BuildTools, GoBuilder, GoCli, InstallHooks, ToolchainError, ToolsProvider};
