//! Guarded file read/write.

use super::policy::{check_path_in_roots, Guardrails};
use crate::error::{PolicyError, Result};
use anyhow::Context as _;
use std::path::Path;
use std::sync::Arc;

/// Read a file, capped at the guardrail output byte limit.
pub async fn read_file(path: &Path, guardrails: &Arc<Guardrails>) -> Result<String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if metadata.len() > guardrails.max_output_bytes {
        return Err(PolicyError::OutputTooLarge {
            max_bytes: guardrails.max_output_bytes,
        }
        .into());
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Write a file inside the allowed write roots, creating parent directories.
pub async fn write_file(path: &Path, contents: &[u8], guardrails: &Arc<Guardrails>) -> Result<()> {
    check_path_in_roots(path, &guardrails.allowed_write_roots)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn write_outside_roots_is_denied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guardrails = Arc::new(Guardrails::default());
        let error = write_file(&dir.path().join("x.txt"), b"hi", &guardrails)
            .await
            .expect_err("empty roots deny");
        assert_eq!(error.kind(), ErrorKind::PathOutsideAllowedRoots);
    }

    #[tokio::test]
    async fn write_then_read_inside_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut guardrails = Guardrails::default();
        guardrails.allowed_write_roots = vec![dir.path().to_path_buf()];
        let guardrails = Arc::new(guardrails);

        let path = dir.path().join("nested/out.txt");
        write_file(&path, b"payload", &guardrails)
            .await
            .expect("write inside root");
        let read = read_file(&path, &guardrails).await.expect("read back");
        assert_eq!(read, "payload");
    }

    #[tokio::test]
    async fn oversized_read_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.txt");
        tokio::fs::write(&path, vec![b'x'; 64]).await.expect("seed");

        let mut guardrails = Guardrails::default();
        guardrails.max_output_bytes = 16;
        let error = read_file(&path, &Arc::new(guardrails))
            .await
            .expect_err("cap exceeded");
        assert_eq!(error.kind(), ErrorKind::ToolOutputTooLarge);
    }
}
