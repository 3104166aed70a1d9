//! Upstream catalog API adapter, detail envelope decoding and the requirements-markup extractor.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use steamset_core::{CatalogId, CatalogListing, FetchFailure, FetchFailureKind};
use steamset_storage::{HttpClientConfig, HttpFetcher, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "steamset-adapters";

pub const DEFAULT_STORE_BASE_URL: &str = "https://store.steampowered.com";
pub const DEFAULT_API_BASE_URL: &str = "https://api.steampowered.com";

/// Version tag recorded with every materialized value.
pub const PARSE_METHOD: &str = "li-strong-label/v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure for {identifier}: {detail}")]
pub struct FetchError {
    pub kind: FetchFailureKind,
    pub identifier: CatalogId,
    pub detail: String,
}

impl FetchError {
    pub fn new(kind: FetchFailureKind, identifier: CatalogId, detail: impl Into<String>) -> Self {
        Self {
            kind,
            identifier,
            detail: detail.into(),
        }
    }

    pub fn to_failure(&self) -> FetchFailure {
        FetchFailure {
            kind: self.kind,
            detail: self.detail.clone(),
        }
    }
}

/// A detail document that passed every validation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub identifier: CatalogId,
    pub data: JsonValue,
    pub entity_type: Option<String>,
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Bulk listing of every known identifier.
    async fn list_catalog(&self) -> Result<Vec<CatalogListing>>;

    async fn fetch_detail(&self, identifier: CatalogId) -> Result<Payload, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub store_base_url: String,
    pub api_base_url: String,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            store_base_url: DEFAULT_STORE_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            min_interval: Duration::from_millis(1500),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Paced client for the public catalog endpoints. Listing and detail calls share one pacer.
#[derive(Debug)]
pub struct RateLimitedClient {
    http: HttpFetcher,
    store_base_url: String,
    api_base_url: String,
}

impl RateLimitedClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: settings.timeout,
            user_agent: settings.user_agent.clone(),
            min_interval: settings.min_interval,
        })?;
        Ok(Self {
            http,
            store_base_url: settings.store_base_url.trim_end_matches('/').to_string(),
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn detail_url(&self, identifier: CatalogId) -> String {
        format!("{}/api/appdetails?appids={identifier}", self.store_base_url)
    }

    pub fn listing_url(&self) -> String {
        format!("{}/ISteamApps/GetAppList/v2/", self.api_base_url)
    }
}

fn log_fetch_failure(err: &FetchError) {
    let identifier = err.identifier;
    let detail = &err.detail;
    match err.kind {
        FetchFailureKind::Network => {
            warn!(kind = "network", identifier, %detail, "transport failure")
        }
        FetchFailureKind::Http => {
            warn!(kind = "http", identifier, %detail, "non-success http status")
        }
        FetchFailureKind::Parse => {
            warn!(kind = "parse", identifier, %detail, "malformed detail document")
        }
        FetchFailureKind::Application => {
            debug!(kind = "application", identifier, %detail, "upstream reported no data")
        }
    }
}

fn classify_transport(identifier: CatalogId, err: TransportError) -> FetchError {
    match err {
        TransportError::Network { .. } => {
            FetchError::new(FetchFailureKind::Network, identifier, err.to_string())
        }
        TransportError::HttpStatus { .. } => {
            FetchError::new(FetchFailureKind::Http, identifier, err.to_string())
        }
    }
}

#[async_trait]
impl CatalogApi for RateLimitedClient {
    async fn list_catalog(&self) -> Result<Vec<CatalogListing>> {
        let url = self.listing_url();
        let response = self
            .http
            .get(&url)
            .await
            .with_context(|| format!("fetching catalog listing from {url}"))?;
        let listings = decode_app_list(&response.body)?;
        info!(count = listings.len(), "catalog listing fetched");
        Ok(listings)
    }

    async fn fetch_detail(&self, identifier: CatalogId) -> Result<Payload, FetchError> {
        let url = self.detail_url(identifier);
        let result = match self.http.get(&url).await {
            Ok(response) => decode_detail_envelope(identifier, &response.body),
            Err(err) => Err(classify_transport(identifier, err)),
        };
        if let Err(err) = &result {
            log_fetch_failure(err);
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct AppListDocument {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<AppListItem>,
}

#[derive(Debug, Deserialize)]
struct AppListItem {
    appid: CatalogId,
    #[serde(default)]
    name: String,
}

pub fn decode_app_list(body: &[u8]) -> Result<Vec<CatalogListing>> {
    let doc: AppListDocument =
        serde_json::from_slice(body).context("parsing catalog listing document")?;
    Ok(doc
        .applist
        .apps
        .into_iter()
        .map(|app| CatalogListing {
            identifier: app.appid,
            display_name: app.name,
        })
        .collect())
}

/// Validation layers 3 and 4: the body must be a `{"<id>": {"success": true, "data": {..}}}`
/// envelope keyed by the requested identifier.
pub fn decode_detail_envelope(identifier: CatalogId, body: &[u8]) -> Result<Payload, FetchError> {
    let doc: JsonValue = serde_json::from_slice(body)
        .map_err(|e| FetchError::new(FetchFailureKind::Parse, identifier, e.to_string()))?;
    let Some(envelope) = doc.get(identifier.to_string()) else {
        return Err(FetchError::new(
            FetchFailureKind::Parse,
            identifier,
            "envelope is missing the requested identifier key",
        ));
    };
    let Some(success) = envelope.get("success").and_then(JsonValue::as_bool) else {
        return Err(FetchError::new(
            FetchFailureKind::Parse,
            identifier,
            "envelope has no boolean success flag",
        ));
    };
    if !success {
        return Err(FetchError::new(
            FetchFailureKind::Application,
            identifier,
            "upstream returned success=false",
        ));
    }
    match envelope.get("data") {
        Some(data) if data.is_object() => Ok(Payload {
            identifier,
            entity_type: data.get("type").and_then(JsonValue::as_str).map(str::to_string),
            data: data.clone(),
        }),
        _ => Err(FetchError::new(
            FetchFailureKind::Application,
            identifier,
            "success=true without a data object",
        )),
    }
}

/// Runtime shape of a semi-structured source field. The upstream sends an object for
/// populated requirements and an empty array when there are none.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceShape<'a> {
    Mapping(&'a serde_json::Map<String, JsonValue>),
    List(&'a [JsonValue]),
    Scalar(&'a JsonValue),
    Absent,
}

impl<'a> SourceShape<'a> {
    pub fn classify(value: Option<&'a JsonValue>) -> Self {
        match value {
            None | Some(JsonValue::Null) => SourceShape::Absent,
            Some(JsonValue::Object(map)) => SourceShape::Mapping(map),
            Some(JsonValue::Array(items)) => SourceShape::List(items),
            Some(other) => SourceShape::Scalar(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceShape::Mapping(_) => "mapping",
            SourceShape::List(_) => "list",
            SourceShape::Scalar(_) => "scalar",
            SourceShape::Absent => "absent",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("source field {source_field} has {shape} shape, expected mapping")]
    UnexpectedShape {
        source_field: String,
        shape: &'static str,
    },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledValue {
    pub label: String,
    pub value: String,
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reads every `<li><strong>Label:</strong> value</li>` item in `markup`. Labels lose trailing
/// `:`/`*` markers; the value is the item text with the label text removed once. Items
/// without a `<strong>` are ignored. Malformed markup yields whatever items the parser recovers.
pub fn extract_labeled_values(markup: &str) -> Result<Vec<LabeledValue>, ExtractError> {
    if markup.trim().is_empty() {
        return Ok(Vec::new());
    }
    let item_sel = selector("li")?;
    let label_sel = selector("strong")?;
    let fragment = Html::parse_fragment(markup);

    let mut out = Vec::new();
    for item in fragment.select(&item_sel) {
        let Some(strong) = item.select(&label_sel).next() else {
            continue;
        };
        let label_text = collapse_whitespace(&strong.text().collect::<String>());
        let label = label_text
            .trim_end_matches([':', '*'])
            .trim()
            .to_string();
        if label.is_empty() {
            continue;
        }
        let item_text = collapse_whitespace(&item.text().collect::<String>());
        let value = item_text.replacen(&label_text, "", 1).trim().to_string();
        out.push(LabeledValue { label, value });
    }
    Ok(out)
}

/// One derived column: which section of which source field it comes from, and which labels
/// name it in the markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub column: String,
    pub source_field: String,
    pub section: String,
    pub labels: Vec<String>,
}

impl FieldRule {
    pub fn raw_source_path(&self) -> String {
        format!("{}.{}", self.source_field, self.section)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRegistry {
    #[serde(default = "default_parse_method")]
    pub parse_method: String,
    pub rules: Vec<FieldRule>,
}

fn default_parse_method() -> String {
    PARSE_METHOD.to_string()
}

impl Default for FieldRegistry {
    fn default() -> Self {
        let targets: [(&str, &[&str]); 5] = [
            ("os", &["OS"]),
            ("processor", &["Processor"]),
            ("ram", &["Memory", "RAM"]),
            ("graphics", &["Graphics", "Video Card"]),
            ("storage", &["Storage", "Hard Drive", "Hard Disk Space"]),
        ];
        let sections = [("min", "minimum"), ("rec", "recommended")];

        let mut rules = Vec::new();
        for (suffix, section) in sections {
            for (name, labels) in targets {
                rules.push(FieldRule {
                    column: format!("mat_{name}_{suffix}"),
                    source_field: "pc_requirements".to_string(),
                    section: section.to_string(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                });
            }
        }
        Self {
            parse_method: default_parse_method(),
            rules,
        }
    }
}

impl FieldRegistry {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.column.as_str()) {
                anyhow::bail!("duplicate materialized column {}", rule.column);
            }
            if rule.labels.is_empty() {
                anyhow::bail!("rule {} has no labels", rule.column);
            }
        }
        Ok(())
    }

    /// Rules grouped by the source field they read, in a stable order.
    pub fn by_source_field(&self) -> BTreeMap<&str, Vec<&FieldRule>> {
        let mut grouped: BTreeMap<&str, Vec<&FieldRule>> = BTreeMap::new();
        for rule in &self.rules {
            grouped.entry(rule.source_field.as_str()).or_default().push(rule);
        }
        grouped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedValue {
    pub column: String,
    pub raw_source_path: String,
    pub value: Option<String>,
}

/// Applies `rules` (all reading `source_field`) to one raw source value. Only a mapping is
/// parsed; every other shape is reported as `UnexpectedShape`. Missing sections, missing
/// labels and empty values all come back as `None`. When several items match a rule, the
/// last one wins.
pub fn extract_fields(
    source_field: &str,
    rules: &[&FieldRule],
    source: Option<&JsonValue>,
) -> Result<Vec<ExtractedValue>, ExtractError> {
    let map = match SourceShape::classify(source) {
        SourceShape::Mapping(map) => map,
        other => {
            return Err(ExtractError::UnexpectedShape {
                source_field: source_field.to_string(),
                shape: other.name(),
            })
        }
    };

    let mut parsed_sections: BTreeMap<&str, Vec<LabeledValue>> = BTreeMap::new();
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        if !parsed_sections.contains_key(rule.section.as_str()) {
            let markup = map
                .get(&rule.section)
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            parsed_sections.insert(rule.section.as_str(), extract_labeled_values(markup)?);
        }
        let items = parsed_sections
            .get(rule.section.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let value = items
            .iter()
            .rev()
            .find(|item| rule.labels.iter().any(|label| label == &item.label))
            .map(|item| item.value.clone())
            .filter(|v| !v.is_empty());
        out.push(ExtractedValue {
            column: rule.column.clone(),
            raw_source_path: rule.raw_source_path(),
            value,
        });
    }
    Ok(out)
}
