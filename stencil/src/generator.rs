//! Package generation
//!
//! Walks a package's files in declaration order and turns each into a
//! `(path, contents)` pair: static and template files render through the
//! template engine, plugin files run inside the sandbox. Generation is
//! all-or-nothing per package; any file failure discards everything the
//! package produced so far.
//!
//! Plugin bytecode is compiled at most once per distinct byte content
//! within a generation; a second file referencing identical bytes reuses
//! the already-compiled module.

use crate::data::PackageDataSource;
use crate::registry::{CompiledPackage, FileKind};
use crate::source::{SourceError, SourceResolver};
use crate::template::{render_str, Template, TemplateError};
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use stencil_plugin_api::{IssueLevel, Request, RequestMetadata, WriteFileRequest};
use stencil_plugin_host::{
    project_mounts, CancelToken, Cancelled, Plugin, PluginAccessPolicy, PluginCompiler,
    SandboxError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("file {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: SourceError,
    },

    #[error("file {path}: {source}")]
    Template {
        path: String,
        #[source]
        source: TemplateError,
    },

    #[error("file {path}: {source}")]
    Sandbox {
        path: String,
        #[source]
        source: SandboxError,
    },

    #[error("plugin for {path} reported errors: {joined}\nLogs:\n{logs}")]
    PluginIssues {
        path: String,
        joined: String,
        logs: String,
    },

    #[error("plugin for {path} returned no file contents")]
    MissingContents { path: String },

    #[error("failed to determine working directory: {0}")]
    Cwd(#[source] std::io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// One generated file, ready for diffing and writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// Rendered destination path, relative to the project root.
    pub target: String,

    pub contents: Vec<u8>,
}

/// The result of generating one package.
#[derive(Debug, Default)]
pub struct GenerationOutput {
    /// Files in package-declaration order.
    pub files: Vec<GeneratedFile>,

    /// Warning-level plugin issues. Already logged; kept for display.
    pub warnings: Vec<String>,
}

/// Orchestrates source resolution, template rendering, and sandboxed
/// plugin execution for one package.
pub struct PackageGenerator<'a> {
    compiler: &'a PluginCompiler,
    policy: &'a PluginAccessPolicy,
    cwd: PathBuf,
    cancel: CancelToken,
}

impl<'a> PackageGenerator<'a> {
    pub fn new(
        compiler: &'a PluginCompiler,
        policy: &'a PluginAccessPolicy,
    ) -> Result<Self, GenerateError> {
        let cwd = std::env::current_dir().map_err(GenerateError::Cwd)?;
        Ok(Self {
            compiler,
            policy,
            cwd,
            cancel: CancelToken::new(),
        })
    }

    /// Override the directory exposed to plugins holding the read-only
    /// CWD capability.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Attach a caller-supplied cancellation token, checked before each
    /// file and each remote fetch.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Generate every file of `compiled` against `data`.
    pub fn generate(
        &self,
        compiled: &CompiledPackage,
        data: &dyn PackageDataSource,
    ) -> Result<GenerationOutput, GenerateError> {
        let package = &compiled.package;
        let resolver = SourceResolver::for_package_path(&compiled.source_path)
            .with_cancel(self.cancel.clone());

        let mut output = GenerationOutput::default();
        // Compiled plugin modules keyed by a hash of their bytecode.
        let mut plugins: HashMap<u64, Plugin> = HashMap::new();

        let result = (|| {
            for (index, file) in package.files.iter().enumerate() {
                self.cancel.bail()?;

                let target = render_str("target", &file.target, data.raw_data()).map_err(|e| {
                    GenerateError::Template {
                        path: file.path.clone(),
                        source: e,
                    }
                })?;

                let contents = match file.kind {
                    FileKind::Static | FileKind::Template => {
                        let text = resolver.resolve_text(package, index).map_err(|e| {
                            GenerateError::Source {
                                path: file.path.clone(),
                                source: e,
                            }
                        })?;
                        let template = Template::parse(&file.path, &text).map_err(|e| {
                            GenerateError::Template {
                                path: file.path.clone(),
                                source: e,
                            }
                        })?;
                        let rendered =
                            template
                                .render(data.raw_data())
                                .map_err(|e| GenerateError::Template {
                                    path: file.path.clone(),
                                    source: e,
                                })?;
                        rendered.into_bytes()
                    }
                    FileKind::Plugin => {
                        let bytes = resolver.resolve(package, index).map_err(|e| {
                            GenerateError::Source {
                                path: file.path.clone(),
                                source: e,
                            }
                        })?;
                        self.run_plugin(
                            &mut plugins,
                            &bytes,
                            package.name.clone(),
                            file.path.clone(),
                            target.clone(),
                            data,
                            &mut output.warnings,
                        )?
                    }
                };

                output.files.push(GeneratedFile { target, contents });
            }
            Ok(())
        })();

        for plugin in plugins.values_mut() {
            plugin.close();
        }

        result.map(|()| output)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_plugin(
        &self,
        plugins: &mut HashMap<u64, Plugin>,
        bytecode: &[u8],
        package: String,
        path: String,
        target: String,
        data: &dyn PackageDataSource,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<u8>, GenerateError> {
        let sandbox_err = |path: &str| {
            let path = path.to_string();
            move |e| GenerateError::Sandbox {
                path,
                source: e,
            }
        };

        let plugin = match plugins.entry(bytecode_key(bytecode)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mounts = project_mounts(self.policy, &self.cwd);
                let plugin = self
                    .compiler
                    .compile(bytecode, mounts)
                    .map_err(sandbox_err(&path))?;
                entry.insert(plugin)
            }
        };

        let request = Request {
            metadata: RequestMetadata {
                package,
                target,
                path: path.clone(),
            },
            data: data.plugin_data(),
            write_file: Some(WriteFileRequest {}),
        };

        let response = plugin.send_request(&request).map_err(sandbox_err(&path))?;

        let mut errors = Vec::new();
        for issue in &response.issues {
            match issue.level {
                IssueLevel::Error => errors.push(issue.message.clone()),
                _ => {
                    tracing::warn!(file = %path, "{}", issue.message);
                    warnings.push(issue.message.clone());
                }
            }
        }

        if !errors.is_empty() {
            return Err(GenerateError::PluginIssues {
                path,
                joined: errors.join("; "),
                logs: String::from_utf8_lossy(plugin.logs()).into_owned(),
            });
        }

        response
            .write_file
            .map(|w| w.contents)
            .ok_or(GenerateError::MissingContents { path })
    }
}

fn bytecode_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MapDataSource;
    use crate::registry::{FileSource, FileSpec, Package};
    use serde_json::Value;

    fn compiled(files: Vec<FileSpec>) -> CompiledPackage {
        CompiledPackage {
            package: Package {
                name: "greeting".into(),
                description: String::new(),
                schema: Default::default(),
                permissions: Vec::new(),
                files,
            },
            source_path: "greeting.json".into(),
        }
    }

    fn data(pairs: &[(&str, &str)]) -> MapDataSource {
        let mut source = MapDataSource::default();
        for (k, v) in pairs {
            source.insert(*k, Value::String(v.to_string()));
        }
        source
    }

    #[test]
    fn test_template_files_render_content_and_target() {
        let pkg = compiled(vec![FileSpec {
            path: "greeting.txt.tmpl".into(),
            kind: FileKind::Template,
            source: Some(FileSource::Text("hello {{ planet }}".into())),
            target: "{{ dir }}/greeting.txt".into(),
        }]);

        let compiler = PluginCompiler::new().unwrap();
        let policy = PluginAccessPolicy::default();
        let generator = PackageGenerator::new(&compiler, &policy).unwrap();

        let out = generator
            .generate(&pkg, &data(&[("planet", "world"), ("dir", "docs")]))
            .unwrap();
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].target, "docs/greeting.txt");
        assert_eq!(out.files[0].contents, b"hello world");
    }

    #[test]
    fn test_file_failure_discards_earlier_results() {
        let pkg = compiled(vec![
            FileSpec {
                path: "ok.txt".into(),
                kind: FileKind::Static,
                source: Some(FileSource::Text("fine".into())),
                target: "ok.txt".into(),
            },
            FileSpec {
                path: "bad.txt".into(),
                kind: FileKind::Static,
                source: None,
                target: "bad.txt".into(),
            },
        ]);

        let compiler = PluginCompiler::new().unwrap();
        let policy = PluginAccessPolicy::default();
        let generator = PackageGenerator::new(&compiler, &policy).unwrap();

        let err = generator.generate(&pkg, &data(&[])).unwrap_err();
        assert!(matches!(err, GenerateError::Source { .. }));
    }

    #[test]
    fn test_plugin_abi_failure_aborts_package() {
        // A module without the handler export fails at compile, before any
        // request is sent.
        let wasm = wat::parse_str("(module)").unwrap();
        let pkg = compiled(vec![FileSpec {
            path: "gen.wasm".into(),
            kind: FileKind::Plugin,
            source: Some(FileSource::Raw(wasm)),
            target: "generated.txt".into(),
        }]);

        let compiler = PluginCompiler::new().unwrap();
        let policy = PluginAccessPolicy::default();
        let generator = PackageGenerator::new(&compiler, &policy).unwrap();

        let err = generator.generate(&pkg, &data(&[])).unwrap_err();
        assert!(matches!(
            err,
            GenerateError::Sandbox {
                source: SandboxError::HandlerNotExported,
                ..
            }
        ));
    }

    // Writes a framed response for bytes "hi" to stdout and exits 0.
    const RESPONDER: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"write_file\":{\"contents\":[104,105]}}\0d")
  (func (export "handle_request") (result i64)
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 38))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
    i64.const 0))
"#;

    #[test]
    fn test_identical_plugin_bytes_compile_once() {
        let wasm = wat::parse_str(RESPONDER).unwrap();
        let pkg = compiled(vec![
            FileSpec {
                path: "gen.wasm".into(),
                kind: FileKind::Plugin,
                source: Some(FileSource::Raw(wasm)),
                target: "a.txt".into(),
            },
            FileSpec {
                path: "gen.wasm".into(),
                kind: FileKind::Plugin,
                source: Some(FileSource::FileIndex(0)),
                target: "b.txt".into(),
            },
        ]);

        let compiler = PluginCompiler::new().unwrap();
        let policy = PluginAccessPolicy::default();
        let generator = PackageGenerator::new(&compiler, &policy).unwrap();

        let out = generator.generate(&pkg, &data(&[])).unwrap();
        assert_eq!(out.files.len(), 2);
        assert_eq!(out.files[0].contents, b"hi");
        assert_eq!(out.files[1].contents, b"hi");

        // The second file reuses the first's compiled module.
        assert_eq!(compiler.compiled_count(), 1);
    }

    #[test]
    fn test_cancelled_token_stops_generation() {
        let pkg = compiled(vec![FileSpec {
            path: "a.txt".into(),
            kind: FileKind::Static,
            source: Some(FileSource::Text("fine".into())),
            target: "a.txt".into(),
        }]);

        let cancel = CancelToken::new();
        cancel.cancel();

        let compiler = PluginCompiler::new().unwrap();
        let policy = PluginAccessPolicy::default();
        let generator = PackageGenerator::new(&compiler, &policy)
            .unwrap()
            .with_cancel(cancel);

        assert!(matches!(
            generator.generate(&pkg, &data(&[])),
            Err(GenerateError::Cancelled(_))
        ));
    }

    #[test]
    fn test_bytecode_key_distinguishes_content() {
        assert_eq!(bytecode_key(b"abc"), bytecode_key(b"abc"));
        assert_ne!(bytecode_key(b"abc"), bytecode_key(b"abd"));
    }
}
