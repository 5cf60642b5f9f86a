use chrono::Utc;
use keygate_contracts::{RequesterId, ResourceId};
use keygate_kernel::jcs_sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only JSONL trail; each record carries the hash of the previous one.
pub struct AuditJsonl {
    inner: Mutex<AuditFile>,
}

struct AuditFile {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub requester_id: i64,
    pub action: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resource_id: Option<String>,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(
        requester: RequesterId,
        action: &str,
        result: &str,
        resource: Option<&ResourceId>,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            requester_id: requester.0,
            action: action.to_string(),
            result: result.to_string(),
            resource_id: resource.map(|r| r.to_string()),
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    pub async fn new(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<AuditRecord>(line)
                    .ok()
                    .map(|rec| rec.record_hash)
            })
        });

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            inner: Mutex::new(AuditFile { file, last_hash }),
        })
    }

    /// Write failures are logged and swallowed.
    pub async fn append(&self, mut rec: AuditRecord) {
        let mut inner = self.inner.lock().await;
        rec.prev_hash = inner.last_hash.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "audit record hash failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "audit record serialize failed");
                return;
            }
        };
        let written = write_line(&mut inner.file, &line).await;
        match written {
            Ok(()) => inner.last_hash = Some(rec.record_hash),
            Err(e) => warn!(error = %e, "audit append failed"),
        }
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
