//! Packs FLE objects into an `.ar` archive container.
//!
//! Archives nest their members' documents verbatim under `members`, stamping
//! each with the input file's basename so it can be recovered on load.

use crate::error::LinkError;
use crate::error::Result;
use crate::fle_writer;
use crate::fs;
use anyhow::bail;
use anyhow::Context;
use serde_json::Map;
use serde_json::Value;
use std::path::Path;
use std::path::PathBuf;

pub fn pack_archive(output: &Path, inputs: &[PathBuf]) -> Result {
    if inputs.is_empty() {
        bail!(LinkError::BadInput(
            "an archive needs at least one member".to_owned()
        ));
    }
    let mut members = Vec::with_capacity(inputs.len());
    for input in inputs {
        members.push(read_member(input)?);
    }
    let mut archive = Map::new();
    archive.insert("type".to_owned(), Value::from(".ar"));
    archive.insert("name".to_owned(), Value::from(fs::basename(output)));
    archive.insert("members".to_owned(), Value::Array(members));
    let text = fle_writer::to_pretty_string(&Value::Object(archive));
    std::fs::write(output, text)
        .with_context(|| format!("Failed to write `{}`", output.display()))?;
    Ok(())
}

fn read_member(path: &Path) -> Result<Value> {
    let content = fs::read_file_string(path)?;
    let content = content
        .strip_prefix("#!")
        .map(|rest| rest.split_once('\n').map(|(_, body)| body).unwrap_or(""))
        .unwrap_or(&content);
    let mut value: Value = serde_json::from_str(content)
        .with_context(|| format!("`{}` is not a valid FLE document", path.display()))?;
    let Some(map) = value.as_object_mut() else {
        bail!(LinkError::BadFormat(format!(
            "`{}` is not a JSON object",
            path.display()
        )));
    };
    map.insert("name".to_owned(), Value::from(fs::basename(path)));
    Ok(value)
}
