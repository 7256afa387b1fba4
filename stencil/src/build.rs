//! Registry builds
//!
//! Hydrates a registry's packages into distributable artifacts: static and
//! template file references are inlined as text, plugin sources are
//! cross-compiled to WASI bytecode (or fetched when already compiled) and
//! written as sidecar blobs. The output directory receives one JSON file
//! per package plus a catalog file whose entries carry no file content.
//!
//! A plugin source built once is never rebuilt within the same run; a
//! second file naming the same source reuses the first artifact. The Go
//! toolchain bootstrap only happens when a package actually needs a
//! from-source build.

use crate::registry::{
    is_http_path, load_registry, parent_of, to_pretty_json, FileKind, FileSource, Package,
    Registry, RegistryError,
};
use crate::source::{SourceError, SourceResolver};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stencil_plugin_host::{
    cancel::{CancelToken, Cancelled},
    sandbox::{PluginCompiler, SandboxError},
    toolchain::{ToolchainError, ToolsProvider},
};
use thiserror::Error;

/// Default output directory for registry artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "./public/r";

const PLUGINS_DIR: &str = "plugins";
const CATALOG_FILE: &str = "registry.json";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("package {package}: {source}")]
    Source {
        package: String,
        #[source]
        source: SourceError,
    },

    #[error("package {package}, file {path}: plugin sources must be local when building from source")]
    RemotePluginSource { package: String, path: String },

    #[error(transparent)]
    Toolchain(Arc<ToolchainError>),

    #[error("package {package}, file {path}: {source}")]
    Verify {
        package: String,
        path: String,
        #[source]
        source: SandboxError,
    },

    #[error("failed to create WASM compiler: {0}")]
    Compiler(#[source] SandboxError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl From<Arc<ToolchainError>> for BuildError {
    fn from(e: Arc<ToolchainError>) -> Self {
        BuildError::Toolchain(e)
    }
}

/// Progress hooks for one registry build.
#[derive(Default)]
pub struct BuildHooks {
    /// Fired before each package's hydration starts.
    pub before_package: Option<Box<dyn Fn(&str) + Send + Sync>>,

    /// Fired after each package's artifact is written.
    pub on_package: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

/// Builds registry artifacts from a registry definition.
pub struct RegistryBuilder<'a> {
    tools: &'a ToolsProvider,
    compiler: PluginCompiler,
    cancel: CancelToken,
    hooks: BuildHooks,
}

impl<'a> RegistryBuilder<'a> {
    pub fn new(
        tools: &'a ToolsProvider,
        cancel: CancelToken,
        hooks: BuildHooks,
    ) -> Result<Self, BuildError> {
        let compiler = PluginCompiler::new().map_err(BuildError::Compiler)?;
        Ok(Self {
            tools,
            compiler,
            cancel,
            hooks,
        })
    }

    /// Build all artifacts for the registry at `registry_path` into
    /// `out_dir`.
    pub fn build(&self, registry_path: &str, out_dir: &Path) -> Result<(), BuildError> {
        let mut registry = load_registry(registry_path)?;
        let base = parent_of(registry_path);
        let resolver = SourceResolver::with_base(base.clone()).with_cancel(self.cancel.clone());

        fs::create_dir_all(out_dir).map_err(|e| BuildError::Write {
            path: out_dir.to_path_buf(),
            source: e,
        })?;

        // Hydrated artifact paths keyed by the plugin's source reference.
        let mut built: HashMap<String, String> = HashMap::new();

        for package in &mut registry.packages {
            self.cancel.bail()?;

            if let Some(before) = &self.hooks.before_package {
                before(&package.name);
            }

            self.hydrate_package(package, &base, &resolver, out_dir, &mut built)?;

            let artifact = out_dir.join(format!("{}.json", package.name));
            let encoded = to_pretty_json(&package.name, package)?;
            fs::write(&artifact, encoded).map_err(|e| BuildError::Write {
                path: artifact,
                source: e,
            })?;

            tracing::info!(package = %package.name, "built package artifact");

            if let Some(done) = &self.hooks.on_package {
                done(&package.name);
            }
        }

        write_catalog(&registry, out_dir)
    }

    fn hydrate_package(
        &self,
        package: &mut Package,
        base: &str,
        resolver: &SourceResolver,
        out_dir: &Path,
        built: &mut HashMap<String, String>,
    ) -> Result<(), BuildError> {
        let name = package.name.clone();

        for file in &mut package.files {
            self.cancel.bail()?;

            match file.kind {
                FileKind::Static | FileKind::Template => {
                    if let Some(FileSource::Reference(reference)) = &file.source {
                        let bytes =
                            resolver
                                .fetch_reference(reference)
                                .map_err(|e| BuildError::Source {
                                    package: name.clone(),
                                    source: e,
                                })?;
                        let text = String::from_utf8(bytes).map_err(|e| BuildError::Source {
                            package: name.clone(),
                            source: SourceError::InvalidText {
                                path: file.path.clone(),
                                source: e.utf8_error(),
                            },
                        })?;
                        file.source = Some(FileSource::Text(text));
                    }
                }
                FileKind::Plugin => {
                    let Some(FileSource::Reference(reference)) = file.source.clone() else {
                        continue;
                    };

                    if let Some(artifact) = built.get(&reference) {
                        file.source = Some(FileSource::Reference(artifact.clone()));
                        continue;
                    }

                    let bytecode = if reference.ends_with(".wasm") {
                        resolver
                            .fetch_reference(&reference)
                            .map_err(|e| BuildError::Source {
                                package: name.clone(),
                                source: e,
                            })?
                    } else {
                        // Cross-compile a plugin source. The compiler only
                        // reads from disk, so the source must be local.
                        if is_http_path(base) || is_http_path(&reference) {
                            return Err(BuildError::RemotePluginSource {
                                package: name.clone(),
                                path: file.path.clone(),
                            });
                        }
                        let source_path = Path::new(base).join(&reference);
                        let bundle = self.tools.get()?;
                        bundle
                            .builder
                            .build_wasm(&source_path)
                            .map_err(|e| BuildError::Toolchain(Arc::new(e)))?
                    };

                    // Reject broken bytecode at build time, not at install
                    // time.
                    self.compiler
                        .compile(&bytecode, Vec::new())
                        .map_err(|e| BuildError::Verify {
                            package: name.clone(),
                            path: file.path.clone(),
                            source: e,
                        })?;

                    let stem = Path::new(&file.path)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file.path.clone());
                    let artifact_rel = format!("{PLUGINS_DIR}/{name}_{stem}.wasm");

                    let blob_path = out_dir.join(&artifact_rel);
                    if let Some(parent) = blob_path.parent() {
                        fs::create_dir_all(parent).map_err(|e| BuildError::Write {
                            path: parent.to_path_buf(),
                            source: e,
                        })?;
                    }
                    fs::write(&blob_path, &bytecode).map_err(|e| BuildError::Write {
                        path: blob_path,
                        source: e,
                    })?;

                    built.insert(reference, artifact_rel.clone());
                    file.source = Some(FileSource::Reference(artifact_rel));
                }
            }
        }

        Ok(())
    }
}

/// Write the catalog file. Entries never embed file content; every file's
/// source is stripped before encoding.
fn write_catalog(registry: &Registry, out_dir: &Path) -> Result<(), BuildError> {
    let mut catalog = registry.clone();
    for package in &mut catalog.packages {
        for file in &mut package.files {
            file.source = None;
        }
    }

    let path = out_dir.join(CATALOG_FILE);
    let encoded = to_pretty_json(&catalog.name, &catalog)?;
    fs::write(&path, encoded).map_err(|e| BuildError::Write { path, source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_plugin_host::toolchain::InstallHooks;

    fn write_registry(dir: &Path, body: &str) -> String {
        let path = dir.join("registry.json");
        fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn builder_tools() -> ToolsProvider {
        ToolsProvider::new(InstallHooks::default(), CancelToken::new())
    }

    #[test]
    fn test_build_inlines_static_references_and_strips_catalog() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.tmpl"), "# {{ name }}\n").unwrap();
        let registry_path = write_registry(
            dir.path(),
            r#"{
                "name": "demo",
                "packages": [{
                    "name": "docs",
                    "files": [{
                        "path": "readme.tmpl",
                        "type": "template",
                        "source": {"reference": "readme.tmpl"},
                        "target": "README.md"
                    }]
                }]
            }"#,
        );

        let out = tempfile::tempdir().unwrap();
        let tools = builder_tools();
        let builder =
            RegistryBuilder::new(&tools, CancelToken::new(), BuildHooks::default()).unwrap();
        builder.build(&registry_path, out.path()).unwrap();

        let artifact = fs::read_to_string(out.path().join("docs.json")).unwrap();
        assert!(artifact.contains("# {{ name }}"));

        let catalog = fs::read_to_string(out.path().join("registry.json")).unwrap();
        assert!(catalog.contains("\"docs\""));
        assert!(!catalog.contains("source"));
    }

    #[test]
    fn test_build_precompiled_plugin_blob_is_copied_once() {
        let dir = tempfile::tempdir().unwrap();
        let wasm = wat::parse_str(
            r#"(module (func (export "handle_request") (result i64) i64.const 0))"#,
        )
        .unwrap();
        fs::write(dir.path().join("gen.wasm"), &wasm).unwrap();
        let registry_path = write_registry(
            dir.path(),
            r#"{
                "name": "demo",
                "packages": [{
                    "name": "tooling",
                    "files": [
                        {"path": "gen.wasm", "type": "plugin",
                         "source": {"reference": "gen.wasm"}, "target": "a.txt"},
                        {"path": "gen.wasm", "type": "plugin",
                         "source": {"reference": "gen.wasm"}, "target": "b.txt"}
                    ]
                }]
            }"#,
        );

        let out = tempfile::tempdir().unwrap();
        let tools = builder_tools();
        let builder =
            RegistryBuilder::new(&tools, CancelToken::new(), BuildHooks::default()).unwrap();
        builder.build(&registry_path, out.path()).unwrap();

        let blob = out.path().join("plugins/tooling_gen.wasm");
        assert_eq!(fs::read(&blob).unwrap(), wasm);

        // Both files point at the single hydrated artifact.
        let artifact = fs::read_to_string(out.path().join("tooling.json")).unwrap();
        assert_eq!(artifact.matches("plugins/tooling_gen.wasm").count(), 2);
    }

    #[test]
    fn test_build_rejects_broken_plugin_bytecode() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gen.wasm"), wat::parse_str("(module)").unwrap()).unwrap();
        let registry_path = write_registry(
            dir.path(),
            r#"{
                "name": "demo",
                "packages": [{
                    "name": "broken",
                    "files": [{"path": "gen.wasm", "type": "plugin",
                               "source": {"reference": "gen.wasm"}, "target": "a.txt"}]
                }]
            }"#,
        );

        let out = tempfile::tempdir().unwrap();
        let tools = builder_tools();
        let builder =
            RegistryBuilder::new(&tools, CancelToken::new(), BuildHooks::default()).unwrap();
        let err = builder.build(&registry_path, out.path()).unwrap_err();
        assert!(matches!(err, BuildError::Verify { .. }));
    }

    #[test]
    fn test_build_respects_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = write_registry(
            dir.path(),
            r#"{"name": "demo", "packages": [{"name": "p", "files": []}]}"#,
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        let out = tempfile::tempdir().unwrap();
        let tools = builder_tools();
        let builder = RegistryBuilder::new(&tools, cancel, BuildHooks::default()).unwrap();
        assert!(matches!(
            builder.build(&registry_path, out.path()),
            Err(BuildError::Cancelled(_))
        ));
    }
}
