use crate::error::Result;
use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` in one rename. The temp file is created next to
/// the target so the rename never crosses filesystems; a crash leaves either
/// the old run file or the new one, never a torn write.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".relay-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    Ok(std::fs::create_dir_all(path)?)
}

/// Scaffolding helper: `Ok(false)` when `path` already exists and was left alone.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        Ok(false)
    } else {
        atomic_write(path, data).map(|()| true)
    }
}

/// Split a Markdown document with YAML frontmatter into `(frontmatter, body)`.
///
/// Returns `None` when the document does not open with a `---` fence or the
/// closing fence is missing.
pub fn split_frontmatter(doc: &str) -> Option<(&str, &str)> {
    let rest = doc
        .strip_prefix("---\n")
        .or_else(|| doc.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body.trim_start_matches(['\r', '\n'])));
        }
        offset += line.len();
    }
    None
}
