use anyhow::{Result, anyhow};
use std::path::Path;

/// Characters Azure rejects or misroutes in a blob name.
const FORBIDDEN_BLOB_CHARS: [char; 2] = ['\\', '\0'];

/// Maximum blob name length accepted by Azure Blob Storage.
pub const MAX_BLOB_NAME_LEN: usize = 1024;

/// First `keep` characters of a secret, for diagnostics only.
pub fn redacted_prefix(value: &str, keep: usize) -> String {
    value.chars().take(keep).collect()
}

/// Object name for an uploaded file: its final path component.
pub fn blob_name_for(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Path has no usable file name: {}", path.display()))?;
    validate_blob_name(name)?;
    Ok(name.to_string())
}

pub fn validate_blob_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(anyhow!("Invalid blob name: {:?}", name));
    }
    if name.len() > MAX_BLOB_NAME_LEN {
        return Err(anyhow!(
            "Blob name exceeds {} characters: {}",
            MAX_BLOB_NAME_LEN,
            name
        ));
    }
    if name.contains(FORBIDDEN_BLOB_CHARS) || name.chars().any(|c| c.is_control()) {
        return Err(anyhow!("Blob name contains forbidden characters: {:?}", name));
    }
    Ok(())
}
