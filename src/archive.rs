//! Archive codec
//!
//! Builds, merges and extracts tar streams. Tar is the unit of exchange for
//! everything that crosses a sandbox boundary: persisted provider state,
//! the parameter file injected into a container, result files downloaded
//! from one, and the gzip-compressed working directory seed a provider ships
//! in its catalog.
//!
//! Mode bits survive a build/extract round trip; ownership and timestamps
//! are recorded but not restored.

use crate::error::{ProvisionError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

/// Archive every file and directory below each of `relative_paths`.
///
/// Entry names are relative to `root`. A directory is always written before
/// anything inside it; siblings are ordered by file name so the same tree
/// always produces the same entry order.
///
/// Fails with an IO error if a path is missing or disappears during the
/// walk. Callers persisting several paths should skip missing ones first.
pub fn build_from_paths<S: AsRef<str>>(root: &Path, relative_paths: &[S]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    for relative in relative_paths {
        let relative = relative.as_ref();
        ensure_relative(Path::new(relative))?;

        for entry in WalkDir::new(root.join(relative)).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| {
                    ProvisionError::validation(format!(
                        "'{}' is outside of '{}'",
                        entry.path().display(),
                        root.display()
                    ))
                })?
                .to_path_buf();

            // the root itself (persist path "." or "")
            if name.as_os_str().is_empty() {
                continue;
            }

            if entry.file_type().is_dir() {
                builder.append_dir(&name, entry.path())?;
            } else {
                builder.append_path_with_name(entry.path(), &name)?;
            }
        }
    }

    Ok(builder.into_inner()?)
}

/// Wrap one in-memory buffer as a single-entry archive.
pub fn build_single_file(name: &str, body: &[u8], mode: u32) -> Result<Vec<u8>> {
    ensure_relative(Path::new(name))?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(body.len() as u64);
    header.set_mode(mode);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );

    let mut builder = Builder::new(Vec::new());
    builder.append_data(&mut header, name, body)?;
    Ok(builder.into_inner()?)
}

/// Recreate the archive's directories and files below `dest`, in stream order.
///
/// Only directories and regular files are supported; anything else (links,
/// devices, fifos) fails with a decode error. Entries that would land
/// outside `dest` are rejected as well.
pub fn extract(archive: &[u8], dest: &Path) -> Result<()> {
    extract_from(archive, dest)
}

/// Decompress a gzip stream and extract the archive inside it.
pub fn extract_gz(compressed: &[u8], dest: &Path) -> Result<()> {
    extract_from(GzDecoder::new(compressed), dest)
}

/// Decompress a gzip stream.
pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| ProvisionError::decode(format!("invalid gzip stream: {}", e)))?;
    Ok(out)
}

fn extract_from<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);

    for entry in archive.entries().map_err(decode_error)? {
        let mut entry = entry.map_err(decode_error)?;
        let relative = entry.path().map_err(decode_error)?.into_owned();
        let target = join_inside(dest, &relative)?;
        let mode = entry.header().mode().map_err(decode_error)? & 0o7777;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                // a previous restore may have left a read-only copy behind
                if target.is_file() {
                    fs::remove_file(&target)?;
                }
                let expected = entry.size();
                let mut file = fs::File::create(&target)?;
                let written = io::copy(&mut entry, &mut file)?;
                check_complete(&relative.display().to_string(), written, expected)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                return Err(ProvisionError::decode(format!(
                    "unknown file type {:?} for file {}",
                    other,
                    relative.display()
                )));
            }
        }
        debug!(path = %target.display(), "extracted");
    }

    Ok(())
}

/// Concatenate the entries of several archives into one stream.
///
/// Headers and bodies are copied verbatim (including long-name and pax
/// records), archive by archive, in input order.
pub fn merge<A: AsRef<[u8]>>(archives: &[A]) -> Result<Vec<u8>> {
    match archives {
        [] => Err(ProvisionError::EmptyInput("no archives to merge".to_string())),
        [single] => Ok(single.as_ref().to_vec()),
        _ => {
            let mut builder = Builder::new(Vec::new());
            for archive in archives {
                let mut reader = Archive::new(archive.as_ref());
                for entry in reader.entries().map_err(decode_error)?.raw(true) {
                    let mut entry = entry.map_err(decode_error)?;
                    let header = entry.header().clone();
                    builder.append(&header, &mut entry)?;
                }
            }
            Ok(builder.into_inner()?)
        }
    }
}

/// Body and name of the first regular file in the stream.
pub fn first_file(archive: &[u8]) -> Result<(Vec<u8>, String)> {
    let mut reader = Archive::new(archive);

    for entry in reader.entries().map_err(decode_error)? {
        let mut entry = entry.map_err(decode_error)?;
        if matches!(
            entry.header().entry_type(),
            EntryType::Regular | EntryType::Continuous
        ) {
            let name = entry.path().map_err(decode_error)?.display().to_string();
            let expected = entry.size();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).map_err(decode_error)?;
            check_complete(&name, body.len() as u64, expected)?;
            return Ok((body, name));
        }
    }

    Err(ProvisionError::NoRegularFile)
}

/// Move every entry of `archive` below `prefix`.
///
/// `docker cp` names entries after the last component of the copied path;
/// re-rooting puts `state/terraform.tfstate` back under `state/`.
pub fn rebase(archive: &[u8], prefix: &Path) -> Result<Vec<u8>> {
    if prefix.as_os_str().is_empty() {
        return Ok(archive.to_vec());
    }
    ensure_relative(prefix)?;

    let mut builder = Builder::new(Vec::new());
    let mut reader = Archive::new(archive);
    for entry in reader.entries().map_err(decode_error)? {
        let mut entry = entry.map_err(decode_error)?;
        let path = prefix.join(entry.path().map_err(decode_error)?);
        let mut header = entry.header().clone();
        builder.append_data(&mut header, path, &mut entry)?;
    }
    Ok(builder.into_inner()?)
}

/// Drop the first path component of every entry.
///
/// Used for a download of the working directory itself, whose entries are
/// named `<dir>/...`. The entry for `<dir>` goes away.
pub fn strip_root(archive: &[u8]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut reader = Archive::new(archive);
    for entry in reader.entries().map_err(decode_error)? {
        let mut entry = entry.map_err(decode_error)?;
        let path: PathBuf = entry
            .path()
            .map_err(decode_error)?
            .components()
            .skip(1)
            .collect();
        if path.as_os_str().is_empty() {
            continue;
        }
        let mut header = entry.header().clone();
        builder.append_data(&mut header, path, &mut entry)?;
    }
    Ok(builder.into_inner()?)
}

/// A body shorter than its header claims means the stream was cut off.
fn check_complete(name: &str, actual: u64, expected: u64) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ProvisionError::decode(format!(
            "entry '{}' is truncated: {} of {} bytes",
            name, actual, expected
        )))
    }
}

/// Entry names in this crate's archives are always relative and never climb.
fn ensure_relative(path: &Path) -> Result<()> {
    if path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(())
    } else {
        Err(ProvisionError::validation(format!(
            "path '{}' must be relative and stay inside the working directory",
            path.display()
        )))
    }
}

fn join_inside(dest: &Path, relative: &Path) -> Result<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ProvisionError::decode(format!(
                    "entry '{}' escapes the destination directory",
                    relative.display()
                )));
            }
        }
    }
    Ok(target)
}

fn decode_error(err: io::Error) -> ProvisionError {
    ProvisionError::decode(err.to_string())
}
