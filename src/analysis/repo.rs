use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::model::AnalysisRecord;
use crate::errors::AnalysisError;
use crate::images::services::AssetManager;

const REQUIRED_FIELDS: [&str; 6] = [
    "id",
    "created_at",
    "overall_assessment",
    "items",
    "original_image_ref",
    "processed_image_ref",
];

/// On-disk layout: `{ "analyses": { "<id>": record }, "next_id": n, "last_updated": ts }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    analyses: Map<String, Value>,
    #[serde(default = "first_id")]
    next_id: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_updated: Option<OffsetDateTime>,
}

fn first_id() -> u64 {
    1
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            analyses: Map::new(),
            next_id: first_id(),
            last_updated: None,
        }
    }
}

impl StoreDocument {
    fn max_id(&self) -> Option<u64> {
        self.analyses.keys().filter_map(|k| k.parse::<u64>().ok()).max()
    }
}

/// Outcome of the self-check. Anomalies are logged, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub duplicate_ids: Vec<u64>,
    /// Entries whose key is not an id or disagrees with the record's own id.
    pub mismatched_keys: Vec<String>,
    /// `(old, new)` when `next_id` had to be moved past the largest id.
    pub next_id_corrected: Option<(u64, u64)>,
    pub missing_fields: Vec<(String, Vec<&'static str>)>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub total_analyses: usize,
    pub next_id: u64,
    pub analysis_ids: Vec<u64>,
    pub document_path: String,
    pub document_exists: bool,
    pub document_size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    pub integrity: IntegrityReport,
}

fn integrity_check(doc: &mut StoreDocument) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let mut seen = HashSet::new();

    for (key, record) in &doc.analyses {
        let inner = record.get("id").and_then(Value::as_u64);
        match (key.parse::<u64>().ok(), inner) {
            (Some(k), Some(i)) if k == i => {
                if !seen.insert(i) {
                    report.duplicate_ids.push(i);
                }
            }
            (_, Some(i)) => {
                report.mismatched_keys.push(key.clone());
                if !seen.insert(i) {
                    report.duplicate_ids.push(i);
                }
            }
            (_, None) => {
                if key.parse::<u64>().is_err() {
                    report.mismatched_keys.push(key.clone());
                }
            }
        }

        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| record.get(*f).is_none())
            .collect();
        if !missing.is_empty() {
            warn!(id = %key, ?missing, "analysis is missing required fields");
            report.missing_fields.push((key.clone(), missing));
        }
    }

    if !report.duplicate_ids.is_empty() {
        warn!(ids = ?report.duplicate_ids, "duplicate analysis ids detected");
    }
    if !report.mismatched_keys.is_empty() {
        warn!(keys = ?report.mismatched_keys, "analysis keys do not match record ids");
    }

    let max_id = doc.max_id().into_iter().chain(seen).max();
    if let Some(max_id) = max_id {
        if doc.next_id <= max_id {
            let corrected = max_id.saturating_add(1);
            warn!(next_id = doc.next_id, max_id, corrected, "next_id not above max id; correcting");
            report.next_id_corrected = Some((doc.next_id, corrected));
            doc.next_id = corrected;
        }
    }

    report
}

/// Keyed store of analysis records kept in one JSON document.
///
/// Queries always re-read the document so edits made by other processes are
/// seen. The in-memory mirror only carries the id counter between allocations;
/// allocation, `save` and `delete` are serialized on its lock.
pub struct AnalysisStore {
    path: PathBuf,
    mirror: Mutex<StoreDocument>,
}

impl AnalysisStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }

        let mut doc = read_document(&path).await?;
        if let Some(max_id) = doc.max_id() {
            doc.next_id = doc.next_id.max(max_id.saturating_add(1));
        }
        info!(
            path = %path.display(),
            analyses = doc.analyses.len(),
            next_id = doc.next_id,
            "analysis store opened"
        );

        Ok(Self {
            path,
            mirror: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads the mirror from disk without ever moving the counter backwards.
    async fn refresh(&self, mirror: &mut StoreDocument) -> anyhow::Result<()> {
        let disk = read_document(&self.path).await?;
        let next_id = mirror.next_id.max(disk.next_id);
        *mirror = disk;
        mirror.next_id = next_id;
        if let Some(max_id) = mirror.max_id() {
            mirror.next_id = mirror.next_id.max(max_id.saturating_add(1));
        }
        Ok(())
    }

    /// Hands out an id for a new analysis.
    ///
    /// A requested id at or above the counter is honoured and the counter moves
    /// past it. A requested id that is taken, or that lies below the counter and
    /// may have been used before, is replaced by a fresh one.
    ///
    /// A requested id with no successor is rejected with
    /// [`AnalysisError::Validation`] wrapped in the returned error.
    #[instrument(skip(self))]
    pub async fn allocate_id(&self, requested: Option<u64>) -> anyhow::Result<u64> {
        let mut mirror = self.mirror.lock().await;
        self.refresh(&mut *mirror).await?;

        let fresh = |doc: &mut StoreDocument| -> anyhow::Result<u64> {
            let id = doc.next_id;
            doc.next_id = id.checked_add(1).context("analysis id space exhausted")?;
            Ok(id)
        };

        let id = match requested {
            Some(id) if doc_contains(&mirror, id) => {
                warn!(requested = id, "id already exists; allocating a new one");
                fresh(&mut *mirror)?
            }
            Some(id) if id >= mirror.next_id => {
                mirror.next_id = id.checked_add(1).ok_or_else(|| {
                    anyhow::Error::new(AnalysisError::validation(format!(
                        "requested id {} is out of range",
                        id
                    )))
                })?;
                id
            }
            Some(id) => {
                warn!(requested = id, next_id = mirror.next_id, "id below counter; allocating a new one");
                fresh(&mut *mirror)?
            }
            None => fresh(&mut *mirror)?,
        };
        info!(id, next_id = mirror.next_id, "analysis id allocated");
        Ok(id)
    }

    /// Persists a new record. Records are never overwritten.
    #[instrument(skip(self, record))]
    pub async fn save(&self, id: u64, record: &AnalysisRecord) -> anyhow::Result<()> {
        anyhow::ensure!(record.id == id, "record id {} does not match {}", record.id, id);

        let mut mirror = self.mirror.lock().await;
        self.refresh(&mut *mirror).await?;
        anyhow::ensure!(!doc_contains(&mirror, id), "analysis {} already exists", id);

        let mut record = record.clone();
        record.refresh_aggregates();
        mirror
            .analyses
            .insert(id.to_string(), serde_json::to_value(&record)?);
        mirror.next_id = mirror.next_id.max(id.saturating_add(1));

        integrity_check(&mut mirror);
        self.flush(&mut mirror).await?;
        info!(id, total = mirror.analyses.len(), "analysis saved");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: u64) -> anyhow::Result<Option<AnalysisRecord>> {
        let doc = read_document(&self.path).await?;
        doc.analyses
            .get(&id.to_string())
            .map(|v| decode(v.clone()))
            .transpose()
            .with_context(|| format!("decode analysis {}", id))
    }

    pub async fn exists(&self, id: u64) -> anyhow::Result<bool> {
        Ok(doc_contains(&read_document(&self.path).await?, id))
    }

    /// All records in document order. Undecodable entries are skipped.
    pub async fn list(&self) -> anyhow::Result<Vec<AnalysisRecord>> {
        let doc = read_document(&self.path).await?;
        Ok(doc
            .analyses
            .into_iter()
            .filter_map(|(key, v)| match decode(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(id = %key, error = %e, "skipping unreadable analysis");
                    None
                }
            })
            .collect())
    }

    /// Removes a record after removing its images and everything under its
    /// storage folder. `Ok(false)` when the id is unknown.
    #[instrument(skip(self, assets))]
    pub async fn delete(&self, id: u64, assets: &AssetManager, folder: &str) -> anyhow::Result<bool> {
        let mut mirror = self.mirror.lock().await;
        self.refresh(&mut *mirror).await?;

        let Some(raw) = mirror.analyses.get(&id.to_string()).cloned() else {
            warn!(id, "analysis not found");
            return Ok(false);
        };

        for field in ["original_image_ref", "processed_image_ref"] {
            match raw.get(field).and_then(Value::as_str) {
                Some(url) if assets.key_for(url).is_some() => {
                    assets.delete(url).await.with_context(|| format!("delete {}", field))?;
                }
                Some(url) => warn!(id, %url, "image locator outside bucket; leaving it"),
                None => warn!(id, field, "analysis has no image locator"),
            }
        }
        assets
            .delete_folder(&format!("{}/{}", folder, id))
            .await
            .context("delete analysis folder")?;

        mirror.analyses.remove(&id.to_string());
        integrity_check(&mut mirror);
        self.flush(&mut mirror).await?;
        info!(id, "analysis deleted");
        Ok(true)
    }

    /// Runs the self-check against the current document. A corrected counter
    /// is kept in memory and written with the next mutation.
    pub async fn integrity_check(&self) -> anyhow::Result<IntegrityReport> {
        let mut mirror = self.mirror.lock().await;
        self.refresh(&mut *mirror).await?;
        let report = integrity_check(&mut mirror);
        if report.is_clean() {
            info!("integrity check passed");
        }
        Ok(report)
    }

    pub async fn snapshot(&self) -> anyhow::Result<StoreSnapshot> {
        let mut mirror = self.mirror.lock().await;
        self.refresh(&mut *mirror).await?;
        let integrity = integrity_check(&mut mirror);

        let mut analysis_ids: Vec<u64> = mirror
            .analyses
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect();
        analysis_ids.sort_unstable();

        let meta = tokio::fs::metadata(&self.path).await.ok();
        Ok(StoreSnapshot {
            total_analyses: mirror.analyses.len(),
            next_id: mirror.next_id,
            analysis_ids,
            document_path: self.path.display().to_string(),
            document_exists: meta.is_some(),
            document_size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
            last_modified: meta
                .and_then(|m| m.modified().ok())
                .map(OffsetDateTime::from),
            integrity,
        })
    }

    /// Rewrites the whole document through a temp file.
    async fn flush(&self, doc: &mut StoreDocument) -> anyhow::Result<()> {
        doc.last_updated = Some(OffsetDateTime::now_utc());
        let body = serde_json::to_vec_pretty(&*doc).context("serialize analyses")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

fn doc_contains(doc: &StoreDocument, id: u64) -> bool {
    doc.analyses.contains_key(&id.to_string())
}

fn decode(v: Value) -> anyhow::Result<AnalysisRecord> {
    let mut record: AnalysisRecord = serde_json::from_value(v)?;
    record.refresh_aggregates();
    Ok(record)
}

async fn read_document(path: &Path) -> anyhow::Result<StoreDocument> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}
