// File-store helpers for the snapshot tree
use lr_core::{Error, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Mode given to snapshot files.
pub const FILE_MODE: u32 = 0o644;

/// Write `content` to `path` through a temp file in the same directory and a rename.
///
/// Readers see either the old file or the new one, never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| Error::io_at(dir, e))?;
    temp.write_all(content).map_err(|e| Error::io_at(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| Error::io_at(temp.path(), e))?;
    set_mode(temp.path(), FILE_MODE)?;

    temp.persist(path).map_err(|e| Error::io_at(path, e.error))?;
    Ok(())
}

/// File contents, or `None` when the file does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io_at(path, e)),
    }
}

/// Non-blank lines that are not `#` comments, trimmed.
pub fn content_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// One line per entry, newline-terminated.
pub fn render_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::io_at(path, e))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { FILE_MODE }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("routes").join("main.conf");

        atomic_write(&target, b"default via 10.0.0.1\n").unwrap();
        atomic_write(&target, b"default via 10.0.0.2\n").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "default via 10.0.0.2\n");
        let leftovers = fs::read_dir(dir.path().join("routes")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_files_are_world_readable() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("rules.v4");
        atomic_write(&target, b"*filter\nCOMMIT\n").unwrap();
        assert_eq!(mode_of(&fs::metadata(&target).unwrap()), 0o644);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_optional(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn comments_and_blanks_are_not_content() {
        let lines = content_lines("# saved\n\n  10.0.0.0/8 via 192.168.1.1  \n#x\nblackhole 10.9.0.0/16\n");
        assert_eq!(lines, vec!["10.0.0.0/8 via 192.168.1.1", "blackhole 10.9.0.0/16"]);
        assert_eq!(render_lines(&lines), "10.0.0.0/8 via 192.168.1.1\nblackhole 10.9.0.0/16\n");
    }
}
