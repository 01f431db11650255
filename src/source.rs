use std::path::Path;

use crate::error::ReviewError;

/// Largest source file accepted for review (10 MiB).
pub const MAX_SOURCE_BYTES: u64 = 10 * 1024 * 1024;

/// Read a source file for review.
///
/// Size is checked from metadata before reading. Invalid UTF-8 is replaced
/// rather than rejected.
pub async fn load_source(path: &Path) -> Result<String, ReviewError> {
    let shown = path.display();

    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ReviewError::Source(format!("file does not exist: {shown}"))
        } else {
            ReviewError::Source(format!("cannot stat {shown}: {e}"))
        }
    })?;

    if !meta.is_file() {
        return Err(ReviewError::Source(format!("not a file: {shown}")));
    }

    if meta.len() > MAX_SOURCE_BYTES {
        return Err(ReviewError::Source(format!(
            "file too large: {} bytes (max {MAX_SOURCE_BYTES})",
            meta.len()
        )));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ReviewError::Source(format!("failed to read {shown}: {e}")))?;

    tracing::info!(path = %shown, bytes = bytes.len(), "loaded source file");
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
