// tar.gz export and import of the store tree
use crate::store::{atomic_write, mode_of, set_mode};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lr_core::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub files: usize,
    pub directories: usize,
}

/// Gzip-compressed tar of everything under `root`, names relative to it.
///
/// Entries are emitted in sorted order with their permission bits. Anything
/// that is neither a regular file nor a directory is left out.
pub fn export(root: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    let mut count = 0;
    append_dir(&mut builder, root, Path::new(""), &mut count)?;

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io("failed to finish archive", e))?;
    let bytes = encoder
        .finish()
        .map_err(|e| Error::io("failed to compress archive", e))?;

    info!(root = %root.display(), entries = count, bytes = bytes.len(), "store exported");
    Ok(bytes)
}

fn append_dir<W: std::io::Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    relative: &Path,
    count: &mut usize,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| Error::io_at(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::io_at(dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = relative.join(entry.file_name());
        let metadata = fs::symlink_metadata(&path).map_err(|e| Error::io_at(&path, e))?;

        let mut header = Header::new_gnu();
        header.set_mode(mode_of(&metadata));
        header.set_mtime(
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );

        if metadata.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &name, std::io::empty())
                .map_err(|e| Error::io_at(&path, e))?;
            *count += 1;
            append_dir(builder, &path, &name, count)?;
        } else if metadata.is_file() {
            let data = fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            builder
                .append_data(&mut header, &name, data.as_slice())
                .map_err(|e| Error::io_at(&path, e))?;
            *count += 1;
        } else {
            debug!(path = %path.display(), "skipping non-regular store entry");
        }
    }

    Ok(())
}

enum StagedKind {
    Directory,
    File(Vec<u8>),
}

struct Staged {
    relative: PathBuf,
    mode: u32,
    kind: StagedKind,
}

/// Unpack an exported archive under `root`.
///
/// Every entry is read and checked before anything touches the disk; a single
/// rejected entry leaves `root` untouched.
pub fn import(root: &Path, bytes: &[u8]) -> Result<ImportSummary> {
    let staged = stage_entries(bytes)?;
    check_resolved(root, &staged)?;

    fs::create_dir_all(root).map_err(|e| Error::io_at(root, e))?;

    let mut summary = ImportSummary::default();
    let mut dir_modes = Vec::new();

    for entry in &staged {
        let target = root.join(&entry.relative);
        match &entry.kind {
            StagedKind::Directory => {
                fs::create_dir_all(&target).map_err(|e| Error::io_at(&target, e))?;
                dir_modes.push((target, entry.mode));
                summary.directories += 1;
            }
            StagedKind::File(data) => {
                atomic_write(&target, data)?;
                set_mode(&target, entry.mode)?;
                summary.files += 1;
            }
        }
    }

    // deepest first, so a read-only parent does not block its children
    dir_modes.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
    for (dir, mode) in dir_modes {
        set_mode(&dir, mode)?;
    }

    info!(
        root = %root.display(),
        files = summary.files,
        directories = summary.directories,
        "store imported"
    );
    Ok(summary)
}

fn stage_entries(bytes: &[u8]) -> Result<Vec<Staged>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| Error::io("failed to read archive", e))?;

    let mut staged = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io("failed to read archive entry", e))?;
        let raw = entry
            .path()
            .map_err(|e| Error::io("failed to read archive entry name", e))?
            .into_owned();

        let relative = match checked_relative(&raw) {
            Some(relative) => relative,
            None => return Err(reject(&raw)),
        };
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;

        let kind = match entry.header().entry_type() {
            EntryType::Directory => StagedKind::Directory,
            EntryType::Regular | EntryType::Continuous => {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .map_err(|e| Error::io_at(&raw, e))?;
                StagedKind::File(data)
            }
            _ => return Err(reject(&raw)),
        };

        if relative.as_os_str().is_empty() {
            continue;
        }
        staged.push(Staged {
            relative,
            mode,
            kind,
        });
    }

    Ok(staged)
}

/// The entry name as a path that stays under the import root, if it does.
fn checked_relative(name: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

/// Every existing path component below `root` must be a real directory or file
/// that resolves inside `root`; a symlink anywhere on the way is refused.
fn check_resolved(root: &Path, staged: &[Staged]) -> Result<()> {
    let canonical_root = match fs::canonicalize(root) {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io_at(root, e)),
    };

    for entry in staged {
        let mut current = root.to_path_buf();
        for part in entry.relative.components() {
            current.push(part);
            match fs::symlink_metadata(&current) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    return Err(reject(&entry.relative));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(Error::io_at(&current, e)),
            }

            let resolved = fs::canonicalize(&current).map_err(|e| Error::io_at(&current, e))?;
            if !resolved.starts_with(&canonical_root) {
                return Err(reject(&entry.relative));
            }
        }
    }

    Ok(())
}

fn reject(name: &Path) -> Error {
    warn!(entry = %name.display(), "archive entry rejected");
    Error::PathTraversal {
        entry: name.display().to_string(),
    }
}
