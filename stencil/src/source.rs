//! File source resolution
//!
//! Turns a file descriptor's source union into concrete bytes: inline text
//! is copied, references are fetched from disk or over HTTP relative to the
//! package's own location, raw bytes are returned as-is, and an index
//! back-references a prior file in the same package whose raw bytes are
//! already populated. Fetches buffer fully before returning and check the
//! cancellation token first.

use crate::registry::{is_http_path, parent_of, FileSource, Package};
use std::path::Path;
use std::time::Duration;
use stencil_plugin_host::{CancelToken, Cancelled};
use thiserror::Error;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("file {path} has no source")]
    MissingSource { path: String },

    #[error("file {path} references file index {index}, which is not a prior file")]
    IndexNotPrior { path: String, index: usize },

    #[error("file {path} references file index {index}, which has no raw bytes")]
    IndexNotHydrated { path: String, index: usize },

    #[error("failed to read {reference}: {source}")]
    Read {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch {reference}: {source}")]
    Fetch {
        reference: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("file {path} is not valid UTF-8: {source}")]
    InvalidText {
        path: String,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Resolves file sources against a package's load location.
pub struct SourceResolver {
    /// Directory or URL prefix that relative references resolve against.
    base: String,

    cancel: CancelToken,
}

impl SourceResolver {
    /// A resolver rooted at the parent of the package's own path.
    pub fn for_package_path(package_path: &str) -> Self {
        Self {
            base: parent_of(package_path),
            cancel: CancelToken::new(),
        }
    }

    /// A resolver with an explicit base directory.
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            cancel: CancelToken::new(),
        }
    }

    /// Attach a caller-supplied cancellation token, checked before each
    /// fetch.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve the bytes of the file at `index` within `package`.
    ///
    /// An index source must point at a prior file whose raw bytes are
    /// already populated; chained index references are not followed.
    pub fn resolve(&self, package: &Package, index: usize) -> Result<Vec<u8>, SourceError> {
        let file = &package.files[index];
        let source = file.source.as_ref().ok_or_else(|| SourceError::MissingSource {
            path: file.path.clone(),
        })?;

        match source {
            FileSource::Text(text) => Ok(text.clone().into_bytes()),
            FileSource::Raw(bytes) => Ok(bytes.clone()),
            FileSource::Reference(reference) => self.fetch_reference(reference),
            FileSource::FileIndex(target) => {
                // Only backward references are legal; a forward (or self)
                // index can never be hydrated yet.
                if *target >= index {
                    return Err(SourceError::IndexNotPrior {
                        path: file.path.clone(),
                        index: *target,
                    });
                }
                let sibling = &package.files[*target];
                match &sibling.source {
                    Some(FileSource::Raw(bytes)) if !bytes.is_empty() => Ok(bytes.clone()),
                    _ => Err(SourceError::IndexNotHydrated {
                        path: file.path.clone(),
                        index: *target,
                    }),
                }
            }
        }
    }

    /// Resolve a file and validate the bytes as UTF-8 text.
    pub fn resolve_text(&self, package: &Package, index: usize) -> Result<String, SourceError> {
        let bytes = self.resolve(package, index)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => Err(SourceError::InvalidText {
                path: package.files[index].path.clone(),
                source: e.utf8_error(),
            }),
        }
    }

    /// Fetch a reference: an absolute URL, a URL relative to an HTTP base,
    /// or a filesystem path relative to a local base.
    pub fn fetch_reference(&self, reference: &str) -> Result<Vec<u8>, SourceError> {
        self.cancel.bail()?;

        let resolved = self.join(reference);

        if is_http_path(&resolved) {
            let body = reqwest::blocking::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .and_then(|c| c.get(&resolved).send())
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|e| SourceError::Fetch {
                    reference: resolved.clone(),
                    source: e,
                })?;
            Ok(body.to_vec())
        } else {
            std::fs::read(&resolved).map_err(|e| SourceError::Read {
                reference: resolved.clone(),
                source: e,
            })
        }
    }

    fn join(&self, reference: &str) -> String {
        if is_http_path(reference) || Path::new(reference).is_absolute() {
            return reference.to_string();
        }
        if self.base.is_empty() {
            return reference.to_string();
        }
        if is_http_path(&self.base) {
            format!("{}/{}", self.base.trim_end_matches('/'), reference)
        } else {
            Path::new(&self.base)
                .join(reference)
                .to_string_lossy()
                .into_owned()
        }
    }
}
