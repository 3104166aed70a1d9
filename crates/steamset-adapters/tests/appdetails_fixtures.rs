// Every captured appdetails fixture must decode through the public adapter API, and every
// decoded payload must either extract cleanly or report a non-mapping shape.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use steamset_adapters::{
    decode_detail_envelope, extract_fields, CatalogApi, ClientSettings, ExtractError,
    FieldRegistry, RateLimitedClient,
};
use steamset_core::FetchFailureKind;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/appdetails")
}

fn envelope_identifier(body: &[u8]) -> u64 {
    let doc: serde_json::Value = serde_json::from_slice(body).expect("fixture is json");
    doc.as_object()
        .and_then(|o| o.keys().next())
        .and_then(|k| k.parse().ok())
        .expect("fixture envelope keyed by identifier")
}

#[test]
fn every_fixture_decodes_or_classifies() {
    let registry = FieldRegistry::default();
    let grouped = registry.by_source_field();
    let mut decoded = 0;

    for entry in fs::read_dir(fixtures_dir()).expect("fixtures dir") {
        let case = entry.expect("dir entry").path();
        let body = fs::read(case.join("detail.json")).expect("detail.json");
        let identifier = envelope_identifier(&body);

        let Ok(payload) = decode_detail_envelope(identifier, &body) else {
            continue;
        };
        decoded += 1;
        for (field, rules) in &grouped {
            match extract_fields(field, rules, payload.data.get(*field)) {
                Ok(values) => {
                    assert_eq!(values.len(), rules.len());
                    let snapshot = case.join("snapshot.json");
                    assert!(snapshot.exists(), "{} has no snapshot", case.display());
                }
                Err(ExtractError::UnexpectedShape { .. }) => {}
                Err(other) => panic!("{}: {other}", case.display()),
            }
        }
    }
    assert!(decoded >= 2);
}

#[test]
fn client_builds_endpoint_urls_from_configured_bases() {
    let client = RateLimitedClient::new(ClientSettings {
        store_base_url: "http://127.0.0.1:9/".into(),
        api_base_url: "http://127.0.0.1:9".into(),
        min_interval: Duration::from_millis(1),
        ..ClientSettings::default()
    })
    .expect("client");
    assert_eq!(client.detail_url(2050), "http://127.0.0.1:9/api/appdetails?appids=2050");
    assert_eq!(client.listing_url(), "http://127.0.0.1:9/ISteamApps/GetAppList/v2/");
}

#[tokio::test]
async fn failing_detail_calls_stay_paced() {
    let interval = Duration::from_millis(150);
    let client = RateLimitedClient::new(ClientSettings {
        store_base_url: "http://127.0.0.1:9".into(),
        min_interval: interval,
        timeout: Duration::from_secs(2),
        ..ClientSettings::default()
    })
    .expect("client");

    let calls = 3;
    let started = Instant::now();
    for identifier in 0..calls {
        let err = client.fetch_detail(3000 + identifier).await.unwrap_err();
        assert!(
            matches!(err.kind, FetchFailureKind::Network | FetchFailureKind::Http),
            "{err}"
        );
    }
    assert!(started.elapsed() >= interval * (calls as u32 - 1));
}
