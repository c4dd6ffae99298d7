use crate::error::Result;
use anyhow::Context;
use std::path::Path;

/// Reads a whole file into memory, dropping the handle immediately.
pub(crate) fn read_file_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read `{}`", path.display()))
}

pub(crate) fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
