//! Core domain model and normalization helpers for NPCT.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CRATE_NAME: &str = "npct-core";

/// Status tag attached to every record that passed through fetch + parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    /// Lookup succeeded and the primary entity was extracted.
    Success,
    /// Lookup succeeded but the service returned an empty entity list.
    NoData,
    /// The response shape could not be flattened.
    ParseError,
    /// The service answered with a non-2xx status.
    Error,
    /// The request never completed (timeout, connect failure, bad body).
    Exception,
}

impl ApiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStatus::Success => "success",
            ApiStatus::NoData => "no_data",
            ApiStatus::ParseError => "parse_error",
            ApiStatus::Error => "error",
            ApiStatus::Exception => "exception",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiStatus::Success)
    }
}

/// Flattened organisation attributes extracted from one lookup response.
///
/// Only `org_number` and `api_status` are always present; everything else
/// depends on the status and on which nested blocks the service returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub org_number: String,
    pub api_status: ApiStatus,
    pub error: Option<String>,
    pub organisation_name: Option<String>,
    pub legal_form_code: Option<String>,
    pub legal_form_description: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub sni_code: Option<String>,
    pub sni_description: Option<String>,
    /// Raw date string as returned by the service; truncated to a calendar
    /// date at load time, not here.
    pub registration_date: Option<String>,
    pub is_active: Option<bool>,
    pub is_deregistered: Option<bool>,
    pub query_timestamp: Option<DateTime<Utc>>,
}

impl CompanyRecord {
    pub fn empty(org_number: impl Into<String>, api_status: ApiStatus) -> Self {
        Self {
            org_number: org_number.into(),
            api_status,
            error: None,
            organisation_name: None,
            legal_form_code: None,
            legal_form_description: None,
            street_address: None,
            city: None,
            postal_code: None,
            country: None,
            sni_code: None,
            sni_description: None,
            registration_date: None,
            is_active: None,
            is_deregistered: None,
            query_timestamp: None,
        }
    }

    pub fn failed(
        org_number: impl Into<String>,
        api_status: ApiStatus,
        error: impl Into<String>,
    ) -> Self {
        let mut record = Self::empty(org_number, api_status);
        record.error = Some(error.into());
        record
    }
}

/// One row of the secondary reference dataset. The reference dataset defines
/// the canonical entity universe for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCompany {
    pub corporate_id: String,
    pub category: Option<String>,
}

/// A reference row joined with its fetched registry record, ready for load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledCompany {
    pub corporate_id: String,
    pub category: Option<String>,
    pub fetched: Option<CompanyRecord>,
}

/// One record per pipeline execution, persisted for the downstream
/// analytics step to detect staleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub timestamp: DateTime<Utc>,
    pub processed: usize,
    pub execution_time: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(timestamp: DateTime<Utc>, processed: usize, execution_time: f64) -> Self {
        Self {
            timestamp,
            processed,
            execution_time,
            success: true,
            error: None,
        }
    }

    pub fn failed(
        timestamp: DateTime<Utc>,
        execution_time: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            processed: 0,
            execution_time,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Strip separators and whitespace so formatting differences between the two
/// datasets do not create false join misses.
pub fn normalize_org_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect()
}

/// Affirmative tokens recognized by [`coerce_bool`]. "ja" is the
/// local-language marker used by the registry's activity indicator.
const AFFIRMATIVE_TOKENS: [&str; 5] = ["true", "1", "yes", "ja", "y"];

/// Coerce a boolean-like source value without ever failing.
///
/// Literal booleans pass through; recognized affirmative strings map to
/// true and other non-empty strings to false; null and NaN-like sentinels
/// map to None.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => {
            let token = s.trim().to_ascii_lowercase();
            if token.is_empty() || token == "nan" {
                return None;
            }
            Some(AFFIRMATIVE_TOKENS.contains(&token.as_str()))
        }
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        _ => None,
    }
}

/// Truncate a raw date string to calendar-date granularity. Malformed or
/// short values become None rather than failing the row.
pub fn truncate_registration_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() < 10 {
        return None;
    }
    let head: String = trimmed.chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d").ok()
}

/// Trim a textual value, mapping empty results to None.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn org_number_normalization_strips_separators() {
        assert_eq!(normalize_org_number("5560-001234"), "5560001234");
        assert_eq!(normalize_org_number(" 556000 1234 "), "5560001234");
        assert_eq!(normalize_org_number("5560001234"), "5560001234");
    }

    #[test]
    fn bool_coercion_table() {
        assert_eq!(coerce_bool(&json!("JA")), Some(true));
        assert_eq!(coerce_bool(&json!(true)), Some(true));
        assert_eq!(coerce_bool(&json!("1")), Some(true));
        assert_eq!(coerce_bool(&json!("no")), Some(false));
        assert_eq!(coerce_bool(&Value::Null), None);
    }

    #[test]
    fn bool_coercion_handles_sentinels_and_numbers() {
        assert_eq!(coerce_bool(&json!("")), None);
        assert_eq!(coerce_bool(&json!("NaN")), None);
        assert_eq!(coerce_bool(&json!(0)), Some(false));
        assert_eq!(coerce_bool(&json!(2)), Some(true));
    }

    #[test]
    fn registration_date_truncates_to_calendar_day() {
        assert_eq!(
            truncate_registration_date("2019-03-05T00:00:00"),
            NaiveDate::from_ymd_opt(2019, 3, 5)
        );
        assert_eq!(truncate_registration_date("2019-03-05"), NaiveDate::from_ymd_opt(2019, 3, 5));
        assert_eq!(truncate_registration_date("2019-03"), None);
        assert_eq!(truncate_registration_date("not-a-date"), None);
    }

    #[test]
    fn clean_text_drops_blank_values() {
        assert_eq!(clean_text(Some("  Stockholm ")), Some("Stockholm".to_string()));
        assert_eq!(clean_text(Some("   ")), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn failure_outcome_omits_error_when_absent() {
        let outcome = RunOutcome::succeeded(Utc::now(), 10, 1.5);
        let value = serde_json::to_value(&outcome).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["processed"], 10);

        let outcome = RunOutcome::failed(Utc::now(), 0.2, "boom");
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn api_status_round_trips_as_snake_case() {
        let status: ApiStatus = serde_json::from_str("\"no_data\"").unwrap();
        assert_eq!(status, ApiStatus::NoData);
        assert_eq!(serde_json::to_string(&ApiStatus::ParseError).unwrap(), "\"parse_error\"");
        assert_eq!(ApiStatus::Success.as_str(), "success");
    }
}
