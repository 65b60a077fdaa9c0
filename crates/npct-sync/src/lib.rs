//! ETL pipeline orchestration: extract from the organisation registry,
//! reconcile against the reference dataset, load into Postgres.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use npct_core::{
    normalize_org_number, CompanyRecord, ReconciledCompany, ReferenceCompany, RunOutcome,
};
use npct_registry::{parse_outcome, AuthError, RegistryClient, RegistryConfig, TokenManager};
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "npct-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub ids_path: PathBuf,
    pub reference_path: PathBuf,
    pub run_report_path: PathBuf,
    pub worker_count: usize,
    pub request_delay: Duration,
    pub registry: RegistryConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| {
                "postgres://postgres@localhost:5432/nordic_private_credit".to_string()
            }),
            ids_path: std::env::var("NPCT_IDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("bolagsverket_corporate_ids.txt")),
            reference_path: std::env::var("NPCT_REFERENCE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fi_nordic_cleaned_utf8_bom.csv")),
            run_report_path: std::env::var("NPCT_RUN_REPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("etl_last_run.json")),
            worker_count: std::env::var("NPCT_WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12),
            request_delay: Duration::from_millis(
                std::env::var("NPCT_REQUEST_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            registry: RegistryConfig {
                client_id: std::env::var("NPCT_CLIENT_ID").unwrap_or_default(),
                client_secret: std::env::var("NPCT_CLIENT_SECRET").unwrap_or_default(),
                token_url: std::env::var("NPCT_TOKEN_URL").unwrap_or_else(|_| {
                    "https://portal.api.bolagsverket.se/oauth2/token".to_string()
                }),
                api_url: std::env::var("NPCT_API_URL").unwrap_or_else(|_| {
                    "https://gw.api.bolagsverket.se/vardefulla-datamangder/v1/organisationer"
                        .to_string()
                }),
                scope: std::env::var("NPCT_SCOPE").unwrap_or_else(|_| {
                    "vardefulla-datamangder:read vardefulla-datamangder:ping".to_string()
                }),
                user_agent: std::env::var("NPCT_USER_AGENT")
                    .unwrap_or_else(|_| "Nordic-Private-Credit-Tracker/1.0".to_string()),
                request_timeout: Duration::from_secs(
                    std::env::var("NPCT_REQUEST_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(15),
                ),
            },
        }
    }
}

/// Load the newline-delimited identifier file.
pub fn load_corporate_ids(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let ids: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect();
    info!(count = ids.len(), "loaded organisation ids");
    Ok(ids)
}

#[derive(Debug, Deserialize)]
struct ReferenceCsvRow {
    #[serde(rename = "CorporateID_Clean")]
    corporate_id: String,
    #[serde(rename = "Category", default)]
    category: Option<String>,
}

/// Spreadsheet exports sometimes render the identifier column as a float
/// ("5560001234.0"); recover the integer form.
fn reference_id(cell: &str) -> Option<String> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return Some(trimmed.to_string());
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.fract() == 0.0 && *v >= 0.0)
        .map(|v| format!("{v:.0}"))
}

/// Load the delimited reference dataset (UTF-8, optional byte-order mark).
/// Rows whose identifier cell cannot be recovered are skipped with a warning.
pub fn load_reference_companies(path: &Path) -> Result<Vec<ReferenceCompany>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let content = bytes
        .strip_prefix(b"\xef\xbb\xbf")
        .unwrap_or(bytes.as_slice());

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content);

    let mut companies = Vec::new();
    for (index, result) in reader.deserialize::<ReferenceCsvRow>().enumerate() {
        let row = result.with_context(|| format!("parsing {} row {}", path.display(), index + 2))?;
        let Some(corporate_id) = reference_id(&row.corporate_id) else {
            warn!(row = index + 2, "skipping reference row with unusable identifier");
            continue;
        };
        companies.push(ReferenceCompany {
            corporate_id,
            category: row.category.filter(|v| !v.is_empty()),
        });
    }
    info!(count = companies.len(), "loaded reference companies");
    Ok(companies)
}

/// Partition `ids` into at most `worker_count` contiguous chunks of
/// near-equal size; the final chunk absorbs the remainder.
pub fn partition_ids(ids: &[String], worker_count: usize) -> Vec<Vec<String>> {
    if ids.is_empty() {
        return Vec::new();
    }
    let workers = worker_count.clamp(1, ids.len());
    let base = ids.len() / workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for index in 0..workers {
        let end = if index == workers - 1 {
            ids.len()
        } else {
            start + base
        };
        chunks.push(ids[start..end].to_vec());
        start = end;
    }
    chunks
}

/// Concurrent batch extraction over a fixed worker pool.
///
/// Each worker owns one lookup client and walks its chunk sequentially with a
/// fixed inter-request delay; chunk results are collected in completion
/// order, so no ordering is guaranteed on the aggregate.
pub struct Extractor {
    registry: RegistryConfig,
    tokens: Arc<TokenManager>,
    worker_count: usize,
    request_delay: Duration,
}

impl Extractor {
    pub fn new(
        registry: RegistryConfig,
        worker_count: usize,
        request_delay: Duration,
    ) -> Result<Self> {
        let tokens = Arc::new(TokenManager::new(registry.clone())?);
        Ok(Self {
            registry,
            tokens,
            worker_count,
            request_delay,
        })
    }

    /// Fetch and parse every identifier. Per-identifier failures surface as
    /// status-tagged records; a failed token exchange aborts the whole run.
    pub async fn extract(&self, ids: &[String]) -> Result<Vec<CompanyRecord>> {
        let total = ids.len();
        info!(total, workers = self.worker_count, "extracting registry records");

        let chunks = partition_ids(ids, self.worker_count);
        let chunk_count = chunks.len();
        let mut pool = JoinSet::new();
        for chunk in chunks {
            let client = RegistryClient::new(&self.registry, Arc::clone(&self.tokens))?;
            let delay = self.request_delay;
            pool.spawn(async move {
                let mut records = Vec::with_capacity(chunk.len());
                for org_number in &chunk {
                    let outcome = client.fetch(org_number).await?;
                    records.push(parse_outcome(outcome, org_number));
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, AuthError>(records)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut completed = 0usize;
        while let Some(joined) = pool.join_next().await {
            let batch = match joined {
                Ok(Ok(batch)) => batch,
                Ok(Err(err)) => {
                    pool.abort_all();
                    return Err(err).context("credential exchange failed, aborting batch");
                }
                Err(err) => {
                    pool.abort_all();
                    return Err(anyhow!("extraction worker panicked: {err}"));
                }
            };
            results.extend(batch);
            completed += 1;
            let succeeded = results
                .iter()
                .filter(|record| record.api_status.is_success())
                .count();
            info!(
                processed = results.len(),
                total,
                succeeded,
                chunk = completed,
                chunks = chunk_count,
                "chunk complete"
            );
        }
        Ok(results)
    }
}

/// Left join from the reference universe onto the fetched records by
/// normalized identifier.
///
/// Reference-only rows are kept with empty enrichment; fetched records with
/// no reference row are dropped — the reference dataset defines the canonical
/// entity universe.
pub fn reconcile(
    fetched: Vec<CompanyRecord>,
    reference: &[ReferenceCompany],
) -> Vec<ReconciledCompany> {
    let mut by_id: HashMap<String, CompanyRecord> = HashMap::with_capacity(fetched.len());
    for record in fetched {
        let key = normalize_org_number(&record.org_number);
        by_id.entry(key).or_insert(record);
    }

    let mut matched = 0usize;
    let reconciled: Vec<ReconciledCompany> = reference
        .iter()
        .map(|entry| {
            let corporate_id = normalize_org_number(&entry.corporate_id);
            let fetched = by_id.get(&corporate_id).cloned();
            if fetched.is_some() {
                matched += 1;
            }
            ReconciledCompany {
                corporate_id,
                category: entry.category.clone(),
                fetched,
            }
        })
        .collect();

    info!(total = reconciled.len(), matched, "reconciled against reference dataset");
    reconciled
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub fetched: usize,
    pub succeeded: usize,
    pub processed: usize,
    pub duplicates_removed: usize,
    pub execution_seconds: f64,
}

/// Execute the full pipeline once and write the run-outcome handoff document
/// regardless of how the run ended.
pub async fn run_pipeline(config: &SyncConfig) -> Result<RunSummary> {
    let started = Instant::now();
    let run_id = Uuid::new_v4();
    info!(%run_id, "starting etl run");

    match run_inner(config, run_id, started).await {
        Ok(summary) => {
            let outcome = RunOutcome::succeeded(
                Utc::now(),
                summary.processed,
                summary.execution_seconds,
            );
            write_run_outcome(&config.run_report_path, &outcome)?;
            Ok(summary)
        }
        Err(err) => {
            let outcome =
                RunOutcome::failed(Utc::now(), started.elapsed().as_secs_f64(), format!("{err:#}"));
            if let Err(report_err) = write_run_outcome(&config.run_report_path, &outcome) {
                warn!(error = %report_err, "failed to write run outcome document");
            }
            Err(err)
        }
    }
}

async fn run_inner(config: &SyncConfig, run_id: Uuid, started: Instant) -> Result<RunSummary> {
    let pool = npct_storage::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    npct_storage::setup_schema(&pool)
        .await
        .context("creating database schema")?;

    let ids = load_corporate_ids(&config.ids_path)?;
    if ids.is_empty() {
        return Err(anyhow!("no organisation ids found in {}", config.ids_path.display()));
    }
    let reference = load_reference_companies(&config.reference_path)?;

    let extractor = Extractor::new(
        config.registry.clone(),
        config.worker_count,
        config.request_delay,
    )?;
    let fetched = extractor.extract(&ids).await?;
    let fetched_count = fetched.len();
    let succeeded = fetched
        .iter()
        .filter(|record| record.api_status.is_success())
        .count();

    let reconciled = reconcile(fetched, &reference);
    let stats = npct_storage::bulk_upsert_companies(&pool, &reconciled)
        .await
        .context("bulk upsert failed")?;

    let execution_seconds = started.elapsed().as_secs_f64();
    let outcome = RunOutcome::succeeded(Utc::now(), stats.processed, execution_seconds);
    npct_storage::record_run(&pool, &outcome, fetched_count, stats.processed)
        .await
        .context("recording run audit row")?;

    info!(
        %run_id,
        fetched = fetched_count,
        succeeded,
        processed = stats.processed,
        duplicates_removed = stats.duplicates_removed,
        elapsed_secs = format!("{execution_seconds:.1}"),
        "etl run complete"
    );

    Ok(RunSummary {
        run_id,
        fetched: fetched_count,
        succeeded,
        processed: stats.processed,
        duplicates_removed: stats.duplicates_removed,
        execution_seconds,
    })
}

fn write_run_outcome(path: &Path, outcome: &RunOutcome) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(outcome).context("serializing run outcome")?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use npct_core::ApiStatus;
    use std::collections::HashSet;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("55600012{i:02}")).collect()
    }

    #[test]
    fn partition_covers_every_id_exactly_once() {
        for (total, workers) in [(1, 12), (10, 4), (25, 4), (100, 12), (12, 12)] {
            let input = ids(total);
            let chunks = partition_ids(&input, workers);
            assert!(chunks.len() <= workers);

            let flattened: Vec<String> = chunks.iter().flatten().cloned().collect();
            assert_eq!(flattened, input, "chunks must preserve contiguity");
            let unique: HashSet<&String> = flattened.iter().collect();
            assert_eq!(unique.len(), total, "no id may appear twice");
        }
    }

    #[test]
    fn partition_last_chunk_absorbs_remainder() {
        let chunks = partition_ids(&ids(10), 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[3].len(), 4);
    }

    #[test]
    fn partition_of_empty_input_is_empty() {
        assert!(partition_ids(&[], 8).is_empty());
    }

    #[test]
    fn reconcile_uses_reference_as_universe() {
        let mut success = CompanyRecord::empty("556000-1234", ApiStatus::Success);
        success.organisation_name = Some("Nordic Credit AB".to_string());
        let stray = CompanyRecord::empty("9999999999", ApiStatus::Success);

        let reference = vec![
            ReferenceCompany {
                corporate_id: "5560001234".to_string(),
                category: Some("Direct Lending".to_string()),
            },
            ReferenceCompany {
                corporate_id: "5560005678".to_string(),
                category: None,
            },
        ];

        let reconciled = reconcile(vec![success, stray], &reference);
        assert_eq!(reconciled.len(), 2, "reference rows define the row set");

        let first = &reconciled[0];
        assert_eq!(first.corporate_id, "5560001234");
        assert_eq!(
            first.fetched.as_ref().unwrap().organisation_name.as_deref(),
            Some("Nordic Credit AB"),
            "hyphenated fetch id must still join"
        );

        let second = &reconciled[1];
        assert!(second.fetched.is_none(), "reference-only rows keep empty enrichment");

        assert!(
            !reconciled.iter().any(|r| r.corporate_id == "9999999999"),
            "fetched-only records are dropped"
        );
    }

    #[test]
    fn reconcile_keeps_failure_records_for_reference_rows() {
        let failure = CompanyRecord::failed("5560005678", ApiStatus::Error, "HTTP 404: not found");
        let reference = vec![ReferenceCompany {
            corporate_id: "5560005678".to_string(),
            category: None,
        }];
        let reconciled = reconcile(vec![failure], &reference);
        assert_eq!(
            reconciled[0].fetched.as_ref().unwrap().api_status,
            ApiStatus::Error
        );
    }

    #[test]
    fn corporate_id_file_is_trimmed_and_filtered() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "5560001234").unwrap();
        writeln!(file, "  5560005678  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "5560009999").unwrap();

        let ids = load_corporate_ids(file.path()).unwrap();
        assert_eq!(ids, vec!["5560001234", "5560005678", "5560009999"]);
    }

    #[test]
    fn reference_csv_tolerates_bom_and_float_ids() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"\xef\xbb\xbf").unwrap();
        writeln!(file, "CorporateID_Clean,Company,Category").unwrap();
        writeln!(file, "5560001234.0,Nordic Credit AB,Direct Lending").unwrap();
        writeln!(file, "556000-5678,Other AB,").unwrap();
        writeln!(file, ",Broken Row,Direct Lending").unwrap();

        let companies = load_reference_companies(file.path()).unwrap();
        assert_eq!(companies.len(), 2);
        assert_eq!(companies[0].corporate_id, "5560001234");
        assert_eq!(companies[0].category.as_deref(), Some("Direct Lending"));
        assert_eq!(companies[1].corporate_id, "556000-5678");
        assert!(companies[1].category.is_none());
    }

    #[test]
    fn reference_id_recovery() {
        assert_eq!(reference_id("5560001234"), Some("5560001234".to_string()));
        assert_eq!(reference_id("5560001234.0"), Some("5560001234".to_string()));
        assert_eq!(reference_id("556000-1234"), Some("556000-1234".to_string()));
        assert_eq!(reference_id("  "), None);
        assert_eq!(reference_id("n/a"), None);
    }

    #[test]
    fn run_outcome_document_round_trips() {
        let file = NamedTempFile::new().unwrap();
        let outcome = RunOutcome::failed(Utc::now(), 0.4, "credential exchange failed");
        write_run_outcome(file.path(), &outcome).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let parsed: RunOutcome = serde_json::from_str(&text).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("credential exchange failed"));
    }
}
