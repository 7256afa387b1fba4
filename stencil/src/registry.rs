//! Registry and package data model
//!
//! A registry is a named catalog of packages; a package is a named,
//! schema-parameterized bundle of file descriptors. Both are stored as
//! pretty-printed JSON: one file per package plus a catalog file whose
//! entries never embed file content.
//!
//! Loaded packages are immutable; the build pipeline mutates only a clone
//! (the hydrated variant that inlines resolved source bytes).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use stencil_plugin_host::Permission;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} is not a valid registry document: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A named catalog of packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub name: String,

    #[serde(default)]
    pub packages: Vec<Package>,
}

/// A named, schema-parameterized bundle of files to materialize into a
/// project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// The typed field schema consumed by the out-of-scope UI layer.
    /// Kept opaque here; the core only forwards raw key/value data.
    #[serde(default)]
    pub schema: Map<String, Value>,

    /// Capabilities the package's plugins request.
    #[serde(default)]
    pub permissions: Vec<Permission>,

    #[serde(default)]
    pub files: Vec<FileSpec>,
}

/// One file of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    /// Source-relative identity of the file inside the package.
    pub path: String,

    #[serde(rename = "type", default)]
    pub kind: FileKind,

    /// Where the file's bytes come from. Absent only in catalog output,
    /// where sources are stripped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<FileSource>,

    /// Template expression yielding the on-disk destination path.
    pub target: String,
}

/// Declared type of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Static,
    Template,
    Plugin,
}

/// Where a file's bytes come from. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    /// Inline text.
    Text(String),

    /// A fetchable reference: local path relative to the registry root,
    /// or an HTTP URL.
    Reference(String),

    /// Inline raw bytes (hydrated plugin bytecode).
    Raw(Vec<u8>),

    /// Back-reference to a prior file in the same package, by index.
    FileIndex(usize),
}

/// A package plus its load context; produced once per load and read-only
/// for the duration of one generation.
#[derive(Debug, Clone)]
pub struct CompiledPackage {
    pub package: Package,

    /// Path or URL the package was loaded from; relative references
    /// resolve against its parent.
    pub source_path: String,
}

/// True if `p` should be fetched over HTTP rather than from disk.
pub fn is_http_path(p: &str) -> bool {
    p.starts_with("http://") || p.starts_with("https://")
}

fn fetch_bytes(path: &str) -> Result<Vec<u8>, RegistryError> {
    if is_http_path(path) {
        let body = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .and_then(|c| c.get(path).send())
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|e| RegistryError::Fetch {
                path: path.to_string(),
                source: e,
            })?;
        Ok(body.to_vec())
    } else {
        std::fs::read(path).map_err(|e| RegistryError::Read {
            path: path.to_string(),
            source: e,
        })
    }
}

/// Load a package document from a local path or URL.
pub fn load_package(path: &str) -> Result<CompiledPackage, RegistryError> {
    let bytes = fetch_bytes(path)?;
    let package: Package = serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode {
        path: path.to_string(),
        source: e,
    })?;

    Ok(CompiledPackage {
        package,
        source_path: path.to_string(),
    })
}

/// Load a registry catalog document from a local path or URL.
pub fn load_registry(path: &str) -> Result<Registry, RegistryError> {
    let bytes = fetch_bytes(path)?;
    serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode {
        path: path.to_string(),
        source: e,
    })
}

/// Pretty-print an entity for registry artifact output.
pub fn to_pretty_json<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>, RegistryError> {
    let mut out = serde_json::to_vec_pretty(value).map_err(|e| RegistryError::Encode {
        name: name.to_string(),
        source: e,
    })?;
    out.push(b'\n');
    Ok(out)
}

/// Parent directory of a package or registry path, for resolving relative
/// references. Works for both URL and filesystem paths.
pub fn parent_of(path: &str) -> String {
    if is_http_path(path) {
        match path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => path.to_string(),
        }
    } else {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_union_encoding() {
        let text: FileSource = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert_eq!(text, FileSource::Text("hello".into()));

        let idx: FileSource = serde_json::from_str(r#"{"file_index":2}"#).unwrap();
        assert_eq!(idx, FileSource::FileIndex(2));

        let reference = FileSource::Reference("plugins/gen.wasm".into());
        let encoded = serde_json::to_string(&reference).unwrap();
        assert_eq!(encoded, r#"{"reference":"plugins/gen.wasm"}"#);
    }

    #[test]
    fn test_package_round_trip() {
        let doc = r#"{
            "name": "greeting",
            "description": "Greets",
            "permissions": ["cwd_ro"],
            "files": [
                {"path": "greeting.txt.tmpl", "type": "template",
                 "source": {"text": "hello {{ planet }}"},
                 "target": "greeting.txt"}
            ]
        }"#;

        let pkg: Package = serde_json::from_str(doc).unwrap();
        assert_eq!(pkg.name, "greeting");
        assert_eq!(pkg.permissions, vec![Permission::CwdRo]);
        assert_eq!(pkg.files[0].kind, FileKind::Template);

        let encoded = to_pretty_json(&pkg.name, &pkg).unwrap();
        let decoded: Package = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.files.len(), 1);
    }

    #[test]
    fn test_catalog_entries_omit_sources() {
        let mut pkg: Package = serde_json::from_str(
            r#"{"name":"p","files":[{"path":"a","source":{"text":"x"},"target":"a"}]}"#,
        )
        .unwrap();
        pkg.files[0].source = None;

        let encoded = serde_json::to_string(&pkg).unwrap();
        assert!(!encoded.contains("source"));
    }

    #[test]
    fn test_parent_of_paths() {
        assert_eq!(parent_of("registry/reg.json"), "registry");
        assert_eq!(parent_of("https://example.com/r/reg.json"), "https://example.com/r");
    }
}
