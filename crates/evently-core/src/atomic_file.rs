//! Whole-document JSON persistence via temp-file-then-rename.
//!
//! Both the pending-events document and the automation-state document are
//! rewritten wholesale on every save. Writing to `<path>.tmp` and renaming
//! over the final path means a crash mid-write leaves the previous, still
//! valid document in place rather than a half-written one.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{ParseSnafu, ReadSnafu, RenameSnafu, SerializeSnafu, WriteSnafu};
use crate::{CoreResult, LOG_TARGET};
use snafu::ResultExt as _;

/// Reads `path` as JSON, returning `default` (without touching disk errors)
/// when the file doesn't exist yet — the expected first-boot state.
pub async fn read_or_default<T>(path: &Path) -> CoreResult<T>
where
    T: DeserializeOwned + Default,
{
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(target: LOG_TARGET, path = %path.display(), "No document on disk yet, starting empty");
            return Ok(T::default());
        }
        Err(source) => {
            return Err(ReadSnafu {
                path: path.to_owned(),
                source,
            }
            .build())
        }
    };

    serde_json::from_slice(&bytes).context(ParseSnafu {
        path: path.to_owned(),
    })
}

/// Serializes `value` and writes it atomically to `path`.
pub async fn write_atomic<T>(path: &Path, value: &T) -> CoreResult<()>
where
    T: Serialize,
{
    let json = serde_json::to_vec_pretty(value).context(SerializeSnafu {
        path: path.to_owned(),
    })?;

    let tmp_path = tmp_path_for(path);

    trace!(target: LOG_TARGET, path = %tmp_path.display(), bytes = json.len(), "Writing temp document");
    tokio::fs::write(&tmp_path, &json)
        .await
        .context(WriteSnafu {
            path: tmp_path.clone(),
        })?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .context(RenameSnafu {
            tmp_path,
            path: path.to_owned(),
        })?;

    debug!(target: LOG_TARGET, path = %path.display(), "Document saved");
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[test_log::test(tokio::test)]
    async fn missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let doc: Doc = read_or_default(&path).await.unwrap();
        assert_eq!(doc, Doc::default());
    }

    #[test_log::test(tokio::test)]
    async fn round_trips_through_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_atomic(&path, &Doc { value: 42 }).await.unwrap();
        assert!(!tmp_path_for(&path).exists());

        let doc: Doc = read_or_default(&path).await.unwrap();
        assert_eq!(doc, Doc { value: 42 });
    }
}
