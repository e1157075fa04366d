use crate::types::{PostRecord, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Flat JSON shape handed to file-based consumers.
#[derive(Debug, Serialize)]
struct ExportedPost<'a> {
    id: u64,
    url: &'a str,
    username: &'a str,
    text: &'a str,
    created_at: String,
}

impl<'a> From<&'a PostRecord> for ExportedPost<'a> {
    fn from(record: &'a PostRecord) -> Self {
        Self {
            id: record.id.get(),
            url: &record.url,
            username: &record.author,
            text: &record.text,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

/// Drops one pretty-printed JSON file per newly stored post into a
/// directory. File names are `{id}_{uuid}.json` so concurrent writers never
/// clobber each other.
pub struct JsonExporter {
    dir: PathBuf,
}

impl JsonExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub async fn export(&self, record: &PostRecord) -> Result<PathBuf> {
        let body = serde_json::to_string_pretty(&ExportedPost::from(record))?;
        let path = self
            .dir
            .join(format!("{}_{}.json", record.id, Uuid::new_v4().simple()));
        tokio::fs::write(&path, body).await?;
        debug!("Exported post {} to {}", record.id, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use interfaces::{PostId, ProcessingState};

    #[tokio::test]
    async fn writes_one_file_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let exporter = JsonExporter::new(tmp.path().join("out")).unwrap();
        let record = PostRecord {
            id: PostId(1790000000000000001),
            source: "panewscn".to_string(),
            author: "PANewsCN".to_string(),
            url: "https://twitter.com/PANewsCN/status/1790000000000000001".to_string(),
            text: "比特币 ETF 净流入".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
            state: ProcessingState::Unprocessed,
        };

        let first = exporter.export(&record).await.unwrap();
        let second = exporter.export(&record).await.unwrap();
        assert_ne!(first, second);

        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("1790000000000000001_"));
        assert!(name.ends_with(".json"));

        let body = std::fs::read_to_string(&first).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["username"], "PANewsCN");
        assert_eq!(value["text"], "比特币 ETF 净流入");
        assert_eq!(value["created_at"], "2025-06-01T08:30:00+00:00");
        assert!(body.contains("比特币"));
    }
}
