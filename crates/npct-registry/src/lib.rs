//! Organisation-lookup client: OAuth2 token lifecycle and per-identifier
//! registry queries.
//!
//! One [`TokenManager`] is shared across all extraction workers; every worker
//! owns its own [`RegistryClient`] so client state is never mutated from two
//! tasks at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use npct_core::{coerce_bool, ApiStatus, CompanyRecord};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "npct-registry";

/// Seconds subtracted from the issued lifetime; a credential is never handed
/// out this close to its expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

/// Error bodies and transport messages are truncated to this many characters
/// before they land in a record.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Endpoints and credentials for the organisation-lookup service.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub api_url: String,
    pub scope: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

/// Credential exchange failure. Fatal for the whole batch; the manager never
/// retries on its own.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token exchange failed with status {status}: {body}")]
    Exchange { status: u16, body: String },
    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedCredential {
    token: String,
    /// Issued lifetime minus the safety margin; anything past this forces a
    /// refresh.
    expires_at: DateTime<Utc>,
}

impl CachedCredential {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Thread-safe OAuth2 client-credentials cache.
///
/// `bearer()` is callable concurrently from any worker. The refresh path is
/// double-checked: a cheap read-path check first, then a re-check under the
/// write lock, so contending callers trigger at most one exchange request.
#[derive(Debug)]
pub struct TokenManager {
    http: reqwest::Client,
    config: RegistryConfig,
    cache: RwLock<Option<CachedCredential>>,
}

impl TokenManager {
    pub fn new(config: RegistryConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building token client")?;
        Ok(Self {
            http,
            config,
            cache: RwLock::new(None),
        })
    }

    /// Return a bearer token, refreshing through the token endpoint only when
    /// the cached credential is missing or inside the expiry margin.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(credential) = cache.as_ref() {
                if credential.is_fresh() {
                    return Ok(credential.token.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(credential) = cache.as_ref() {
            if credential.is_fresh() {
                return Ok(credential.token.clone());
            }
        }

        let credential = self.exchange().await?;
        let token = credential.token.clone();
        *cache = Some(credential);
        Ok(token)
    }

    async fn exchange(&self) -> Result<CachedCredential, AuthError> {
        info!("requesting access token");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", self.config.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Exchange {
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = (token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0);
        debug!(lifetime_secs = lifetime, "access token obtained");
        Ok(CachedCredential {
            token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}

/// Classified result of one lookup round trip. Consumed immediately by
/// [`parse_outcome`].
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(Value),
    Http { status: u16, body: String },
    Transport(String),
}

/// One pooled lookup client. Owned by a single worker; only the token
/// manager behind it is shared.
#[derive(Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    api_url: String,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig, tokens: Arc<TokenManager>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building lookup client")?;
        Ok(Self {
            http,
            tokens,
            api_url: config.api_url.clone(),
        })
    }

    /// Issue exactly one lookup request for `org_number`.
    ///
    /// Per-identifier failures are folded into the returned outcome and never
    /// retried here; only a failed token exchange escapes as an error.
    pub async fn fetch(&self, org_number: &str) -> Result<FetchOutcome, AuthError> {
        let token = self.tokens.bearer().await?;
        let payload = serde_json::json!({ "identitetsbeteckning": org_number.trim() });

        let response = match self
            .http
            .post(&self.api_url)
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Ok(FetchOutcome::Transport(excerpt(&err.to_string()))),
        };

        let status = response.status();
        if status == StatusCode::OK {
            match response.json::<Value>().await {
                Ok(body) => Ok(FetchOutcome::Success(body)),
                Err(err) => Ok(FetchOutcome::Transport(excerpt(&err.to_string()))),
            }
        } else {
            let body = response.text().await.unwrap_or_default();
            Ok(FetchOutcome::Http {
                status: status.as_u16(),
                body: excerpt(&body),
            })
        }
    }
}

/// Flatten one lookup outcome into a normalized record.
///
/// Absence of any nested field leaves the matching output field unset; this
/// never fails and never panics.
pub fn parse_outcome(outcome: FetchOutcome, org_number: &str) -> CompanyRecord {
    match outcome {
        FetchOutcome::Http { status, body } => CompanyRecord::failed(
            org_number,
            ApiStatus::Error,
            format!("HTTP {status}: {body}"),
        ),
        FetchOutcome::Transport(message) => {
            CompanyRecord::failed(org_number, ApiStatus::Exception, message)
        }
        FetchOutcome::Success(body) => parse_document(&body, org_number),
    }
}

fn parse_document(body: &Value, org_number: &str) -> CompanyRecord {
    let organisations = body.get("organisationer").and_then(Value::as_array);
    let Some(first) = organisations.and_then(|list| list.first()) else {
        return CompanyRecord::failed(
            org_number,
            ApiStatus::NoData,
            "no organisation data returned",
        );
    };

    // The service may return several entities; only the primary one is used.
    let Some(org) = first.as_object() else {
        return CompanyRecord::failed(
            org_number,
            ApiStatus::ParseError,
            "organisation entry is not an object",
        );
    };

    let mut record = CompanyRecord::empty(org_number, ApiStatus::Success);
    record.query_timestamp = Some(Utc::now());
    record.is_deregistered = Some(!matches!(
        org.get("avregistreradOrganisation"),
        None | Some(Value::Null)
    ));

    if let Some(form) = org.get("juridiskForm") {
        record.legal_form_code = string_field(form, "kod");
        record.legal_form_description = string_field(form, "klartext");
    }

    record.organisation_name = org
        .get("organisationsnamn")
        .and_then(|names| names.get("organisationsnamnLista"))
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|entry| entry.get("namn"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Some(address) = org
        .get("postadressOrganisation")
        .and_then(|block| block.get("postadress"))
    {
        record.street_address = string_field(address, "utdelningsadress");
        record.city = string_field(address, "postort");
        record.postal_code = string_field(address, "postnummer");
        record.country = string_field(address, "land");
    }

    // A placeholder blank code can precede the real classification entry.
    if let Some(sni_list) = org
        .get("naringsgrenOrganisation")
        .and_then(|block| block.get("sni"))
        .and_then(Value::as_array)
    {
        let main = sni_list.iter().find(|entry| {
            entry
                .get("kod")
                .and_then(Value::as_str)
                .is_some_and(|code| !code.trim().is_empty())
        });
        if let Some(main) = main {
            record.sni_code = string_field(main, "kod");
            record.sni_description = string_field(main, "klartext");
        }
    }

    record.registration_date = org
        .get("organisationsdatum")
        .and_then(|dates| dates.get("registreringsdatum"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    record.is_active = org
        .get("verksamOrganisation")
        .and_then(|block| block.get("kod"))
        .and_then(coerce_bool);

    record
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_CHARS).collect()
}
