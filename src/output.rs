use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Write `value` as pretty JSON to `path`, all or nothing.
///
/// The document goes to a temp file in the destination directory which is
/// renamed over `path` only after a successful flush, so readers never see a
/// partially written artifact.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> eyre::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| eyre::eyre!("Failed to create output directory '{}': {}", dir.display(), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| eyre::eyre!("Failed to create temp file in '{}': {}", dir.display(), e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| eyre::eyre!("Failed to serialize '{}': {}", path.display(), e))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| eyre::eyre!("Failed to replace '{}': {}", path.display(), e.error))?;

    tracing::debug!(path = %path.display(), "Wrote artifact");
    Ok(())
}

/// Remove the files directly under `dir` whose name matches `is_stale`.
/// A missing directory has nothing to remove. Returns the number removed.
pub fn prune_artifacts(dir: &Path, is_stale: impl Fn(&str) -> bool) -> eyre::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(eyre::eyre!("Failed to list '{}': {}", dir.display(), e));
        }
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let stale = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(&is_stale);
        if stale {
            std::fs::remove_file(&path)
                .map_err(|e| eyre::eyre!("Failed to remove '{}': {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "Removed stale artifact");
            removed += 1;
        }
    }
    Ok(removed)
}
