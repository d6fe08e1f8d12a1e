//! Read-side reconciliation of store and snapshot complaints, plus service wiring.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use grv_core::{CanonicalComplaint, Normalizer, RawRecord, SourcedComplaint, DEFAULT_INSTITUTE};
use grv_sources::{ComplaintSource, SnapshotSource, StoreSource};
pub use grv_sources::{SnapshotLocation, SourceError};
use grv_storage::{ComplaintStore, NewStudent, StoreConfig};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "grv-reconcile";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub snapshot: SnapshotLocation,
    pub default_institute: String,
    pub web_port: u16,
    pub tx_timeout: Duration,
    pub seed_path: PathBuf,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://grievance.db?mode=rwc".to_string()),
            db_max_connections: lookup("GRV_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            snapshot: SnapshotLocation::from_path_list(
                lookup("GRV_SNAPSHOT_PATH").unwrap_or_else(|| "./data/complaints.json".to_string()),
            ),
            default_institute: lookup("GRV_DEFAULT_INSTITUTE")
                .unwrap_or_else(|| DEFAULT_INSTITUTE.to_string()),
            web_port: lookup("GRV_WEB_PORT")
                .or_else(|| lookup("PORT"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            tx_timeout: Duration::from_secs(
                lookup("GRV_TX_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            seed_path: lookup("GRV_SEED_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/departments.yaml")),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            tx_timeout: self.tx_timeout,
        }
    }
}

/// Combines both tagged streams; the first record per id survives after a
/// stable sort by source priority, so the store always shadows the snapshot.
pub fn merge(
    store: Vec<SourcedComplaint>,
    snapshot: Vec<SourcedComplaint>,
) -> Vec<CanonicalComplaint> {
    let mut tagged = store;
    tagged.extend(snapshot);
    tagged.sort_by_key(|item| item.source.priority());

    let mut seen = HashSet::with_capacity(tagged.len());
    let mut merged = Vec::with_capacity(tagged.len());
    let mut shadowed = 0usize;
    for item in tagged {
        if seen.insert(item.complaint.id.clone()) {
            merged.push(item.into_complaint());
        } else {
            shadowed += 1;
        }
    }
    if shadowed > 0 {
        debug!(shadowed, "dropped duplicate complaint ids");
    }
    merged
}

/// Per-request read service over the relational and snapshot sources.
pub struct Reconciler {
    store: Arc<dyn ComplaintSource>,
    snapshot: Arc<dyn ComplaintSource>,
    default_institute: String,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ComplaintSource>, snapshot: Arc<dyn ComplaintSource>) -> Self {
        Self {
            store,
            snapshot,
            default_institute: DEFAULT_INSTITUTE.to_string(),
        }
    }

    pub fn with_default_institute(mut self, institute: impl Into<String>) -> Self {
        self.default_institute = institute.into();
        self
    }

    fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.default_institute.clone(), Utc::now())
    }

    pub fn canonicalize(&self, raw: &RawRecord) -> CanonicalComplaint {
        self.normalizer().normalize(raw).into_complaint()
    }

    /// Merged view of both sources. A source that cannot be read contributes nothing.
    pub async fn merged(&self) -> Vec<CanonicalComplaint> {
        let (store, snapshot) = tokio::join!(
            read_soft(self.store.as_ref()),
            read_soft(self.snapshot.as_ref())
        );
        let normalizer = self.normalizer();
        let merged = merge(
            normalize_all(&normalizer, &store),
            normalize_all(&normalizer, &snapshot),
        );
        info!(
            store = store.len(),
            snapshot = snapshot.len(),
            merged = merged.len(),
            "reconciled complaints"
        );
        merged
    }

    /// Store-only view; an unreachable store is an error here since nothing else can answer.
    pub async fn store_report(&self) -> Result<Vec<CanonicalComplaint>, SourceError> {
        let records = self.store.fetch().await.inspect_err(|err| {
            error!(error = %err, "complaint report failed");
        })?;
        let normalizer = self.normalizer();
        Ok(records
            .iter()
            .map(|raw| normalizer.normalize(raw).into_complaint())
            .collect())
    }
}

async fn read_soft(source: &dyn ComplaintSource) -> Vec<RawRecord> {
    match source.fetch().await {
        Ok(records) => records,
        Err(err) => {
            warn!(source = %source.source(), error = %err, "complaint source unavailable; contributing no records");
            Vec::new()
        }
    }
}

fn normalize_all(normalizer: &Normalizer, records: &[RawRecord]) -> Vec<SourcedComplaint> {
    records.iter().map(|raw| normalizer.normalize(raw)).collect()
}

/// Store handle and read service shared by the web and CLI entry points.
#[derive(Clone)]
pub struct Backend {
    pub store: ComplaintStore,
    pub reconciler: Arc<Reconciler>,
}

impl Backend {
    pub fn from_parts(
        store: ComplaintStore,
        snapshot: SnapshotLocation,
        default_institute: impl Into<String>,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::new(StoreSource::new(store.clone())),
            Arc::new(SnapshotSource::new(snapshot)),
        )
        .with_default_institute(default_institute);
        Self {
            store,
            reconciler: Arc::new(reconciler),
        }
    }

    pub async fn connect(config: &ServiceConfig) -> Result<Self> {
        let store = ComplaintStore::connect(&config.store_config()).await?;
        store.migrate().await?;
        Ok(Self::from_parts(
            store,
            config.snapshot.clone(),
            config.default_institute.clone(),
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub departments: Vec<DepartmentSeed>,
    #[serde(default)]
    pub students: Vec<StudentSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepartmentSeed {
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudentSeed {
    pub roll_number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub institute: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub departments: usize,
    pub students: usize,
}

pub async fn load_seed_file(path: &Path) -> Result<Option<SeedFile>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let seed = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(seed))
}

pub async fn apply_seed(store: &ComplaintStore, seed: &SeedFile) -> Result<SeedSummary> {
    for dept in &seed.departments {
        store
            .upsert_department(&dept.name, dept.contact.as_deref())
            .await
            .with_context(|| format!("seeding department {}", dept.name))?;
    }
    for student in &seed.students {
        store
            .upsert_student(&NewStudent {
                roll_number: student.roll_number.clone(),
                name: student.name.clone(),
                email: student.email.clone(),
                institute: student.institute.clone(),
            })
            .await
            .with_context(|| format!("seeding student {}", student.roll_number))?;
    }
    Ok(SeedSummary {
        departments: seed.departments.len(),
        students: seed.students.len(),
    })
}

/// Runs migrations and applies the seed file when one exists.
pub async fn run_migrate(config: &ServiceConfig) -> Result<SeedSummary> {
    let store = ComplaintStore::connect(&config.store_config()).await?;
    store.migrate().await?;
    let summary = match load_seed_file(&config.seed_path).await? {
        Some(seed) => apply_seed(&store, &seed).await?,
        None => {
            info!(path = %config.seed_path.display(), "no seed file; schema only");
            SeedSummary::default()
        }
    };
    store.close().await;
    Ok(summary)
}
