//! Run metadata sidecar (`{run}.meta.json`)
//!
//! The sidecar is owned by the run-tracking layer; this crate only reads
//! and writes the handful of fields it needs. Unknown fields are kept
//! verbatim so a round trip through [`RunMeta`] never drops data written by
//! someone else.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{RunStatus, StatusEvent};
use crate::store::BackendKind;

/// Typed view of the sidecar document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Storage backend chosen when the run was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunMeta {
    /// Read the sidecar, returning `None` when it does not exist
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Write the sidecar atomically (temp file + rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read-modify-write the status fields, creating the sidecar if needed
    pub fn update_status(path: &Path, status: RunStatus, exit_code: Option<i32>) -> Result<Self> {
        let mut meta = Self::read(path)?.unwrap_or_default();
        let now = Utc::now();
        meta.status = Some(status);
        meta.exit_code = exit_code;
        meta.created_at.get_or_insert(now);
        meta.updated_at = Some(now);
        meta.write(path)?;
        Ok(meta)
    }

    /// Status event for this document, if it carries a status
    pub fn status_event(&self, project: &str, run: &str) -> Option<StatusEvent> {
        self.status
            .map(|status| StatusEvent::new(project, run, status, self.exit_code))
    }
}
