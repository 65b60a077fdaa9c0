//! Postgres persistence for NPCT: schema bootstrap, bulk upsert, run audit.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use npct_core::{
    clean_text, normalize_org_number, truncate_registration_date, ReconciledCompany, RunOutcome,
};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "npct-storage";

/// Rows per multi-row statement; keeps bind counts well below the Postgres
/// parameter limit.
const UPSERT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub async fn connect(database_url: &str) -> Result<PgPool, StorageError> {
    Ok(PgPool::connect(database_url).await?)
}

const CREATE_COMPANIES: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    corporate_id VARCHAR(20) UNIQUE NOT NULL,
    name TEXT,
    category TEXT,
    api_status VARCHAR(50),
    is_active BOOLEAN,
    is_deregistered BOOLEAN,
    registration_date DATE,
    street_address TEXT,
    city VARCHAR(200),
    postal_code VARCHAR(20),
    country VARCHAR(200),
    sni_code VARCHAR(20),
    sni_description TEXT,
    legal_form_code VARCHAR(20),
    legal_form_description TEXT,
    query_timestamp TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ETL_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS etl_runs (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    run_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    records_processed INTEGER,
    records_inserted INTEGER,
    success BOOLEAN,
    execution_time_seconds DOUBLE PRECISION
)
"#;

/// Read view for the downstream dashboard: successfully fetched rows only,
/// most recently updated first.
const CREATE_DASHBOARD_VIEW: &str = r#"
CREATE OR REPLACE VIEW dashboard_companies AS
SELECT
    corporate_id, name, category, city, postal_code,
    sni_code, sni_description, legal_form_description,
    is_active, registration_date, updated_at
FROM companies
WHERE api_status = 'success'
ORDER BY updated_at DESC
"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_companies_corporate_id ON companies(corporate_id)",
    "CREATE INDEX IF NOT EXISTS idx_companies_category ON companies(category)",
    "CREATE INDEX IF NOT EXISTS idx_companies_city ON companies(city)",
];

/// Create the companies table, audit table, dashboard view, and indexes.
/// Idempotent; destructive resets are an administrative operation outside
/// this crate.
pub async fn setup_schema(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::query(CREATE_COMPANIES).execute(pool).await?;
    sqlx::query(CREATE_ETL_RUNS).execute(pool).await?;
    for statement in CREATE_INDEXES {
        sqlx::query(statement).execute(pool).await?;
    }
    sqlx::query(CREATE_DASHBOARD_VIEW).execute(pool).await?;
    info!("database schema ready");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    pub processed: usize,
    pub duplicates_removed: usize,
}

/// Bind-ready flattening of one reconciled row.
#[derive(Debug, Clone, PartialEq)]
struct CompanyRow {
    corporate_id: String,
    name: Option<String>,
    category: Option<String>,
    api_status: Option<String>,
    is_active: Option<bool>,
    is_deregistered: Option<bool>,
    registration_date: Option<NaiveDate>,
    street_address: Option<String>,
    city: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
    sni_code: Option<String>,
    sni_description: Option<String>,
    legal_form_code: Option<String>,
    legal_form_description: Option<String>,
    query_timestamp: Option<DateTime<Utc>>,
}

impl CompanyRow {
    fn from_reconciled(corporate_id: String, record: &ReconciledCompany) -> Self {
        let fetched = record.fetched.as_ref();
        Self {
            corporate_id,
            name: fetched.and_then(|f| clean_text(f.organisation_name.as_deref())),
            category: clean_text(record.category.as_deref()),
            api_status: fetched.map(|f| f.api_status.as_str().to_string()),
            is_active: fetched.and_then(|f| f.is_active),
            is_deregistered: fetched.and_then(|f| f.is_deregistered),
            registration_date: fetched
                .and_then(|f| f.registration_date.as_deref())
                .and_then(truncate_registration_date),
            street_address: fetched.and_then(|f| clean_text(f.street_address.as_deref())),
            city: fetched.and_then(|f| clean_text(f.city.as_deref())),
            postal_code: fetched.and_then(|f| clean_text(f.postal_code.as_deref())),
            country: fetched.and_then(|f| clean_text(f.country.as_deref())),
            sni_code: fetched.and_then(|f| clean_text(f.sni_code.as_deref())),
            sni_description: fetched.and_then(|f| clean_text(f.sni_description.as_deref())),
            legal_form_code: fetched.and_then(|f| clean_text(f.legal_form_code.as_deref())),
            legal_form_description: fetched
                .and_then(|f| clean_text(f.legal_form_description.as_deref())),
            query_timestamp: fetched.and_then(|f| f.query_timestamp),
        }
    }
}

/// Collapse to one row per normalized corporate id, keeping the first
/// occurrence, and count what was dropped.
fn dedup_rows(records: &[ReconciledCompany]) -> (Vec<CompanyRow>, usize) {
    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let corporate_id = normalize_org_number(&record.corporate_id);
        if seen.insert(corporate_id.clone()) {
            rows.push(CompanyRow::from_reconciled(corporate_id, record));
        }
    }
    let duplicates_removed = records.len() - rows.len();
    (rows, duplicates_removed)
}

/// Last-write-wins on the mutable field set only; creation metadata and the
/// enrichment columns keep their first-inserted values on conflict.
const UPSERT_CONFLICT_CLAUSE: &str = " ON CONFLICT (corporate_id) DO UPDATE SET \
     name = EXCLUDED.name, \
     category = EXCLUDED.category, \
     api_status = EXCLUDED.api_status, \
     is_active = EXCLUDED.is_active, \
     updated_at = NOW()";

/// Insert-or-update all reconciled rows in one transaction.
///
/// On a conflicting corporate id only the mutable fields (name, category,
/// status, active flag) are replaced and `updated_at` is bumped; creation
/// metadata is left untouched. All-or-nothing: any chunk failure rolls the
/// whole write back.
pub async fn bulk_upsert_companies(
    pool: &PgPool,
    records: &[ReconciledCompany],
) -> Result<UpsertStats, StorageError> {
    let (rows, duplicates_removed) = dedup_rows(records);
    if duplicates_removed > 0 {
        info!(duplicates_removed, "removed duplicate corporate ids");
    }

    let mut tx = pool.begin().await?;
    for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO companies (corporate_id, name, category, api_status, is_active, \
             is_deregistered, registration_date, street_address, city, postal_code, country, \
             sni_code, sni_description, legal_form_code, legal_form_description, query_timestamp) ",
        );
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(&row.corporate_id)
                .push_bind(&row.name)
                .push_bind(&row.category)
                .push_bind(&row.api_status)
                .push_bind(row.is_active)
                .push_bind(row.is_deregistered)
                .push_bind(row.registration_date)
                .push_bind(&row.street_address)
                .push_bind(&row.city)
                .push_bind(&row.postal_code)
                .push_bind(&row.country)
                .push_bind(&row.sni_code)
                .push_bind(&row.sni_description)
                .push_bind(&row.legal_form_code)
                .push_bind(&row.legal_form_description)
                .push_bind(row.query_timestamp);
        });
        builder.push(UPSERT_CONFLICT_CLAUSE);
        builder.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    info!(processed = rows.len(), "bulk upsert complete");
    Ok(UpsertStats {
        processed: rows.len(),
        duplicates_removed,
    })
}

/// Record one audit row for a pipeline execution.
pub async fn record_run(
    pool: &PgPool,
    outcome: &RunOutcome,
    records_processed: usize,
    records_inserted: usize,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO etl_runs (run_timestamp, records_processed, records_inserted, success, \
         execution_time_seconds) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(outcome.timestamp)
    .bind(records_processed as i32)
    .bind(records_inserted as i32)
    .bind(outcome.success)
    .bind(outcome.execution_time)
    .execute(pool)
    .await?;
    Ok(())
}
