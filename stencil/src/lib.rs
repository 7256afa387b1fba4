//! stencil: declare reusable, parameterized packages of files and
//! materialize them into a project tree.
//!
//! Packages bundle static templates and sandboxed wasm content generators.
//! The library splits into the registry data model, the per-package
//! generation pipeline, and the registry build pipeline; the sandbox and
//! toolchain plumbing live in the `stencil-plugin-host` crate.

pub mod build;
pub mod cli;
pub mod data;
pub mod diff;
pub mod generator;
pub mod project;
pub mod registry;
pub mod source;
pub mod template;

pub use build::{BuildError, BuildHooks, RegistryBuilder, DEFAULT_OUTPUT_DIR};
pub use data::{MapDataSource, PackageDataSource};
pub use generator::{GenerateError, GeneratedFile, GenerationOutput, PackageGenerator};
pub use project::{Project, ProjectError};
pub use registry::{
    load_package, load_registry, CompiledPackage, FileKind, FileSource, FileSpec, Package,
    Registry, RegistryError,
};
pub use source::{SourceError, SourceResolver};
