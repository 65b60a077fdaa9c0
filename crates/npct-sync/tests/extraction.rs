//! End-to-end extraction + reconciliation against a mocked registry.

use std::time::Duration;

use npct_core::{ApiStatus, ReferenceCompany};
use npct_registry::RegistryConfig;
use npct_sync::{reconcile, Extractor};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry_config(server: &MockServer) -> RegistryConfig {
    RegistryConfig {
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
        token_url: format!("{}/oauth2/token", server.uri()),
        api_url: format!("{}/organisationer", server.uri()),
        scope: "registry:read".to_string(),
        user_agent: "npct-test/0.1".to_string(),
        request_timeout: Duration::from_secs(5),
    }
}

async fn mount_registry(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-token",
            "expires_in": 3600
        })))
        // All workers share one token manager, so one exchange serves the run.
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/organisationer"))
        .and(body_string_contains("5560001234"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organisationer": [{
                "organisationsnamn": {
                    "organisationsnamnLista": [{ "namn": "Nordic Credit AB" }]
                },
                "postadressOrganisation": {
                    "postadress": { "postort": "Stockholm" }
                },
                "verksamOrganisation": { "kod": "JA" }
            }]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/organisationer"))
        .and(body_string_contains("5560005678"))
        .respond_with(ResponseTemplate::new(404).set_body_string("organisation not found"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn mixed_batch_yields_status_tagged_records() {
    let server = MockServer::start().await;
    mount_registry(&server).await;

    let ids = vec!["5560001234".to_string(), "5560005678".to_string()];
    let extractor =
        Extractor::new(registry_config(&server), 2, Duration::from_millis(1)).unwrap();
    let mut records = extractor.extract(&ids).await.unwrap();
    records.sort_by(|a, b| a.org_number.cmp(&b.org_number));

    assert_eq!(records.len(), 2);

    let success = &records[0];
    assert_eq!(success.api_status, ApiStatus::Success);
    assert_eq!(success.organisation_name.as_deref(), Some("Nordic Credit AB"));
    assert_eq!(success.city.as_deref(), Some("Stockholm"));
    assert_eq!(success.is_active, Some(true));

    let failure = &records[1];
    assert_eq!(failure.api_status, ApiStatus::Error);
    assert!(failure.error.as_deref().unwrap().starts_with("HTTP 404"));
    assert!(failure.organisation_name.is_none());

    // The reference universe keeps both rows; the failed fetch carries no
    // enrichment but its status survives to the load step.
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
    let reconciled = reconcile(records, &reference);
    assert_eq!(reconciled.len(), 2);
    assert_eq!(
        reconciled[0].fetched.as_ref().unwrap().api_status,
        ApiStatus::Success
    );
    assert_eq!(
        reconciled[1].fetched.as_ref().unwrap().api_status,
        ApiStatus::Error
    );
}

#[tokio::test]
async fn failed_token_exchange_aborts_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let ids = vec!["5560001234".to_string(), "5560005678".to_string()];
    let extractor =
        Extractor::new(registry_config(&server), 2, Duration::from_millis(1)).unwrap();
    let err = extractor.extract(&ids).await.unwrap_err();
    assert!(format!("{err:#}").contains("credential exchange failed"));
}
