//! Archive extraction for toolchain release artifacts
//!
//! Handles the two formats toolchain releases ship in: a gzip-compressed tar
//! stream (POSIX) and a zip stream (Windows). Both extractors normalize
//! entry names and reject anything escaping the destination before touching
//! the filesystem, skip platform metadata noise, preserve modes and
//! symlinks, and recreate hardlinks best-effort with a full-copy fallback.

use crate::cancel::{CancelToken, Cancelled};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("entry {0} escapes the extraction root")]
    PathEscape(String),

    #[error("failed to extract {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed archive: {0}")]
    Malformed(#[source] io::Error),

    #[error("malformed zip archive: {0}")]
    MalformedZip(#[source] zip::result::ZipError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Supported archive stream formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from a download path, by extension.
    pub fn from_path(path: &str) -> Option<Self> {
        if path.ends_with(".tar.gz") {
            Some(Self::TarGz)
        } else if path.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Extract an archive stream into `dest`.
///
/// The zip format needs random access, so the stream is buffered fully in
/// memory first. Cancellation is checked between entries.
pub fn extract(
    mut from: impl Read,
    dest: &Path,
    format: ArchiveFormat,
    cancel: &CancelToken,
) -> Result<(), ArchiveError> {
    match format {
        ArchiveFormat::TarGz => extract_tar_gz(from, dest, cancel),
        ArchiveFormat::Zip => {
            let mut buf = Vec::new();
            from.read_to_end(&mut buf).map_err(ArchiveError::Malformed)?;
            extract_zip(io::Cursor::new(buf), dest, cancel)
        }
    }
}

fn extract_tar_gz(from: impl Read, dest: &Path, cancel: &CancelToken) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(from));

    for entry in archive.entries().map_err(ArchiveError::Malformed)? {
        cancel.bail()?;

        let mut entry = entry.map_err(ArchiveError::Malformed)?;
        let raw_name = entry
            .path()
            .map_err(ArchiveError::Malformed)?
            .to_string_lossy()
            .into_owned();

        let Some(rel) = sanitize_entry_name(&raw_name)? else {
            continue;
        };
        let dest_path = dest.join(&rel);

        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0);

        match kind {
            tar::EntryType::Directory => {
                make_dir(&dest_path, mode).map_err(|e| io_err(&raw_name, e))?;
            }
            tar::EntryType::Regular => {
                ensure_parent(&dest_path).map_err(|e| io_err(&raw_name, e))?;
                let mut out =
                    fs::File::create(&dest_path).map_err(|e| io_err(&raw_name, e))?;
                io::copy(&mut entry, &mut out).map_err(|e| io_err(&raw_name, e))?;
                set_mode(&dest_path, mode);
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(ArchiveError::Malformed)?
                    .ok_or_else(|| {
                        io_err(&raw_name, io::Error::other("symlink without target"))
                    })?;
                ensure_parent(&dest_path).map_err(|e| io_err(&raw_name, e))?;
                let _ = fs::remove_file(&dest_path);
                make_symlink(&target, &dest_path).map_err(|e| io_err(&raw_name, e))?;
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(ArchiveError::Malformed)?
                    .ok_or_else(|| {
                        io_err(&raw_name, io::Error::other("hardlink without target"))
                    })?;
                let Some(target_rel) = sanitize_entry_name(&target.to_string_lossy())? else {
                    continue;
                };
                let target_path = dest.join(target_rel);
                if !target_path.exists() {
                    return Err(io_err(
                        &raw_name,
                        io::Error::other("hardlink target not present in archive"),
                    ));
                }
                ensure_parent(&dest_path).map_err(|e| io_err(&raw_name, e))?;
                let _ = fs::remove_file(&dest_path);
                if fs::hard_link(&target_path, &dest_path).is_err() {
                    // Some filesystems refuse hardlinks; copy instead.
                    fs::copy(&target_path, &dest_path).map_err(|e| io_err(&raw_name, e))?;
                }
            }
            // Sockets, devices, and friends are skipped.
            _ => continue,
        }
    }

    Ok(())
}

fn extract_zip(
    from: impl Read + Seek,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<(), ArchiveError> {
    let mut archive = zip::ZipArchive::new(from).map_err(ArchiveError::MalformedZip)?;

    for i in 0..archive.len() {
        cancel.bail()?;

        let mut file = archive.by_index(i).map_err(ArchiveError::MalformedZip)?;
        let raw_name = file.name().to_string();

        let Some(rel) = sanitize_entry_name(&raw_name)? else {
            continue;
        };
        let dest_path = dest.join(&rel);
        let mode = file.unix_mode().unwrap_or(0);

        if file.is_dir() {
            make_dir(&dest_path, mode).map_err(|e| io_err(&raw_name, e))?;
            continue;
        }

        // Zip has no dedicated symlink type; the unix mode bits carry it.
        if mode & 0o170000 == 0o120000 {
            let mut target = String::new();
            file.read_to_string(&mut target)
                .map_err(|e| io_err(&raw_name, e))?;
            ensure_parent(&dest_path).map_err(|e| io_err(&raw_name, e))?;
            let _ = fs::remove_file(&dest_path);
            make_symlink(Path::new(&target), &dest_path).map_err(|e| io_err(&raw_name, e))?;
            continue;
        }

        ensure_parent(&dest_path).map_err(|e| io_err(&raw_name, e))?;
        let mut out = fs::File::create(&dest_path).map_err(|e| io_err(&raw_name, e))?;
        io::copy(&mut file, &mut out).map_err(|e| io_err(&raw_name, e))?;
        set_mode(&dest_path, mode);
    }

    Ok(())
}

/// Normalize an entry name to a safe relative path.
///
/// Returns `None` for entries that should be skipped: empty names, the root
/// directory entry, and platform metadata (`._*` resource forks,
/// `.DS_Store`). Absolute names are made relative; any remaining `..`
/// component is a hard error.
fn sanitize_entry_name(name: &str) -> Result<Option<PathBuf>, ArchiveError> {
    if name.is_empty() || is_metadata_entry(name) {
        return Ok(None);
    }

    let trimmed = name.trim_start_matches('/').trim_start_matches("./");
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut out = PathBuf::new();
    for comp in Path::new(trimmed).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::PathEscape(name.to_string()));
            }
        }
    }

    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

fn is_metadata_entry(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.starts_with("._") || base == ".DS_Store"
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn make_dir(path: &Path, mode: u32) -> io::Result<()> {
    fs::create_dir_all(path)?;
    set_mode(path, mode);
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn make_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, dest)
}

fn io_err(path: &str, source: io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_tar_gz() -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_path("pkg").unwrap();
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, io::empty()).unwrap();

        let contents = b"package contents\n";
        let mut file = tar::Header::new_gnu();
        file.set_path("pkg/data.txt").unwrap();
        file.set_mode(0o644);
        file.set_size(contents.len() as u64);
        file.set_cksum();
        builder.append(&file, &contents[..]).unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_path("pkg/data-link").unwrap();
        link.set_link_name("data.txt").unwrap();
        link.set_size(0);
        link.set_cksum();
        builder.append(&link, io::empty()).unwrap();

        let mut hard = tar::Header::new_gnu();
        hard.set_entry_type(tar::EntryType::Link);
        hard.set_path("pkg/data-hard").unwrap();
        hard.set_link_name("pkg/data.txt").unwrap();
        hard.set_size(0);
        hard.set_cksum();
        builder.append(&hard, io::empty()).unwrap();

        builder.into_inner().unwrap().finish().unwrap()
    }

    fn build_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);

        writer.add_directory("pkg", options).unwrap();
        writer.start_file("pkg/data.txt", options).unwrap();
        writer.write_all(b"package contents\n").unwrap();
        writer
            .add_symlink("pkg/data-link", "data.txt", options)
            .unwrap();
        // Zip has no hardlink concept; ship a plain copy at that path.
        writer.start_file("pkg/data-hard", options).unwrap();
        writer.write_all(b"package contents\n").unwrap();

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_tar_and_zip_round_trip_identically() {
        let cancel = CancelToken::new();

        let tar_dir = tempfile::tempdir().unwrap();
        extract(
            io::Cursor::new(build_tar_gz()),
            tar_dir.path(),
            ArchiveFormat::TarGz,
            &cancel,
        )
        .unwrap();

        let zip_dir = tempfile::tempdir().unwrap();
        extract(
            io::Cursor::new(build_zip()),
            zip_dir.path(),
            ArchiveFormat::Zip,
            &cancel,
        )
        .unwrap();

        for dir in [tar_dir.path(), zip_dir.path()] {
            let data = fs::read(dir.join("pkg/data.txt")).unwrap();
            assert_eq!(data, b"package contents\n");

            let hard = fs::read(dir.join("pkg/data-hard")).unwrap();
            assert_eq!(hard, data);

            let linked = fs::read(dir.join("pkg/data-link")).unwrap();
            assert_eq!(linked, data);
        }

        let meta = fs::symlink_metadata(tar_dir.path().join("pkg/data-link")).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn test_dangling_hardlink_is_an_error() {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut hard = tar::Header::new_gnu();
        hard.set_entry_type(tar::EntryType::Link);
        hard.set_path("pkg/data-hard").unwrap();
        hard.set_link_name("pkg/absent.txt").unwrap();
        hard.set_size(0);
        hard.set_cksum();
        builder.append(&hard, io::empty()).unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = extract(
            io::Cursor::new(archive),
            dir.path(),
            ArchiveFormat::TarGz,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }

    #[test]
    fn test_traversal_entries_rejected() {
        assert!(matches!(
            sanitize_entry_name("../../etc/passwd"),
            Err(ArchiveError::PathEscape(_))
        ));
        assert!(matches!(
            sanitize_entry_name("pkg/../../escape"),
            Err(ArchiveError::PathEscape(_))
        ));
    }

    #[test]
    fn test_noise_entries_skipped() {
        assert!(sanitize_entry_name("").unwrap().is_none());
        assert!(sanitize_entry_name("./").unwrap().is_none());
        assert!(sanitize_entry_name("pkg/._data.txt").unwrap().is_none());
        assert!(sanitize_entry_name("pkg/.DS_Store").unwrap().is_none());
    }

    #[test]
    fn test_absolute_names_made_relative() {
        let rel = sanitize_entry_name("/pkg/data.txt").unwrap().unwrap();
        assert_eq!(rel, PathBuf::from("pkg/data.txt"));
    }

    #[test]
    fn test_cancellation_between_entries() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let dir = tempfile::tempdir().unwrap();
        let err = extract(
            io::Cursor::new(build_tar_gz()),
            dir.path(),
            ArchiveFormat::TarGz,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled(_)));
    }
}
