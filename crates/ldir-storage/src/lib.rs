//! Listing store clients (Supabase REST + in-memory) and website reachability checks.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ldir_core::{FieldValue, Listing, ListingUpdate, TargetField};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldir-storage";

/// Which rows of a table still need reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Rows where at least one of the columns is empty.
    AnyNull(Vec<TargetField>),
    /// Every row, unconditionally.
    All,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding {table} rows: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("listing {id} not found in {table}")]
    NotFound { table: String, id: Uuid },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn fetch_page(
        &self,
        table: &str,
        filter: &RecordFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Listing>, StoreError>;

    /// Partial update of the staged columns only.
    async fn update_fields(
        &self,
        table: &str,
        id: Uuid,
        update: &ListingUpdate,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[derive(Clone)]
pub struct SupabaseConfig {
    pub base_url: String,
    pub service_role_key: String,
    pub http: HttpClientConfig,
}

/// PostgREST client for the listing tables.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> anyhow::Result<Self> {
        let client = build_client(&config.http)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key,
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Query string for one page of rows matching `filter`.
    pub fn page_query(filter: &RecordFilter, offset: usize, limit: usize) -> Vec<(String, String)> {
        let mut params = vec![
            ("select".to_string(), "*".to_string()),
            ("order".to_string(), "id.asc".to_string()),
            ("offset".to_string(), offset.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let RecordFilter::AnyNull(fields) = filter {
            if !fields.is_empty() {
                let clauses = fields
                    .iter()
                    .flat_map(|f| {
                        let null = format!("{}.is.null", f.column());
                        let blank = f.is_text().then(|| format!("{}.eq.", f.column()));
                        std::iter::once(null).chain(blank)
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                params.push(("or".to_string(), format!("({clauses})")));
            }
        }
        params
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }
}

async fn status_error(resp: reqwest::Response) -> StoreError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    StoreError::HttpStatus { status, url, body }
}

#[async_trait]
impl ListingStore for SupabaseStore {
    async fn fetch_page(
        &self,
        table: &str,
        filter: &RecordFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Listing>, StoreError> {
        let url = self.table_url(table);
        let resp = self
            .authorized(self.client.get(&url))
            .query(&Self::page_query(filter, offset, limit))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let body = resp.bytes().await?;
        let rows: Vec<Listing> = serde_json::from_slice(&body).map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })?;
        debug!(table, offset, rows = rows.len(), "fetched listing page");
        Ok(rows)
    }

    async fn update_fields(
        &self,
        table: &str,
        id: Uuid,
        update: &ListingUpdate,
    ) -> Result<(), StoreError> {
        let url = self.table_url(table);
        let resp = self
            .authorized(self.client.patch(&url))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&update.to_json())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }
}

/// In-process store used for rehearsals from fixture files and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Listing>>,
    failing_ids: HashSet<Uuid>,
    update_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: &str, rows: Vec<Listing>) -> Self {
        let mut state = MemoryState::default();
        state.tables.insert(table.to_string(), rows);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Load a fixture file shaped `{ "<table>": [<listing row>, ...], ... }`.
    pub async fn load_fixture_file(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let tables: BTreeMap<String, Vec<Listing>> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut state = self.state.lock().await;
        let mut count = 0;
        for (table, rows) in tables {
            count += rows.len();
            state.tables.entry(table).or_default().extend(rows);
        }
        Ok(count)
    }

    pub async fn insert(&self, table: &str, listing: Listing) {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default().push(listing);
    }

    /// Make every later update for `id` fail.
    pub async fn fail_updates_for(&self, id: Uuid) {
        self.state.lock().await.failing_ids.insert(id);
    }

    pub async fn snapshot(&self, table: &str) -> Vec<Listing> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update_calls(&self) -> usize {
        self.state.lock().await.update_calls
    }
}

/// Same rows the PostgREST `or` clause selects: null, or an empty string in a text column.
fn is_unset(listing: &Listing, field: TargetField) -> bool {
    match listing.current(field) {
        None => true,
        Some(FieldValue::Text(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn matches_filter(listing: &Listing, filter: &RecordFilter) -> bool {
    match filter {
        RecordFilter::All => true,
        RecordFilter::AnyNull(fields) => fields.iter().any(|f| is_unset(listing, *f)),
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn fetch_page(
        &self,
        table: &str,
        filter: &RecordFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        let rows = state.tables.get(table).map(Vec::as_slice).unwrap_or_default();
        Ok(rows
            .iter()
            .filter(|l| matches_filter(l, filter))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_fields(
        &self,
        table: &str,
        id: Uuid,
        update: &ListingUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.update_calls += 1;
        if state.failing_ids.contains(&id) {
            return Err(StoreError::Message(format!("update rejected for {id}")));
        }
        let listing = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|l| l.id == id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        listing.apply(update);
        Ok(())
    }
}

#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

pub fn is_reachable_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

/// `HEAD` first, then `GET` when the server rejects or fails the `HEAD`.
#[derive(Debug)]
pub struct LinkChecker {
    client: reqwest::Client,
}

impl LinkChecker {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
        })
    }
}

#[async_trait]
impl LinkProbe for LinkChecker {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(resp) if is_reachable_status(resp.status()) => return true,
            Ok(resp) => debug!(url, status = resp.status().as_u16(), "HEAD not accepted; retrying with GET"),
            Err(err) => debug!(url, error = %err, "HEAD failed; retrying with GET"),
        }
        match self.client.get(url).send().await {
            Ok(resp) => is_reachable_status(resp.status()),
            Err(err) => {
                debug!(url, error = %err, "GET failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(name: &str) -> Listing {
        Listing::new(Uuid::new_v4(), name)
    }

    #[test]
    fn page_query_builds_or_of_null_columns() {
        let filter = RecordFilter::AnyNull(vec![TargetField::Email, TargetField::PriceLevel]);
        let params = SupabaseStore::page_query(&filter, 1000, 1000);
        assert!(params.contains(&(
            "or".to_string(),
            "(email.is.null,email.eq.,price_level.is.null)".to_string()
        )));
        assert!(params.contains(&("offset".to_string(), "1000".to_string())));
        assert!(params.contains(&("limit".to_string(), "1000".to_string())));
    }

    #[test]
    fn full_scan_has_no_or_clause() {
        let params = SupabaseStore::page_query(&RecordFilter::All, 0, 50);
        assert!(params.iter().all(|(k, _)| k != "or"));
    }

    #[test]
    fn table_url_trims_trailing_slash() {
        let store = SupabaseStore::new(SupabaseConfig {
            base_url: "https://abc.supabase.co/".to_string(),
            service_role_key: "key".to_string(),
            http: HttpClientConfig::default(),
        })
        .expect("client");
        assert_eq!(store.table_url("restaurants"), "https://abc.supabase.co/rest/v1/restaurants");
    }

    #[test]
    fn redirects_count_as_reachable() {
        assert!(is_reachable_status(StatusCode::OK));
        assert!(is_reachable_status(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_reachable_status(StatusCode::NOT_FOUND));
        assert!(!is_reachable_status(StatusCode::METHOD_NOT_ALLOWED));
    }

    #[tokio::test]
    async fn memory_store_filters_and_paginates() {
        let mut done = listing("Done");
        done.email = Some("hi@cafe.com".to_string());
        let store = MemoryStore::with_table(
            "restaurants",
            vec![listing("A"), done, listing("B"), listing("C")],
        );
        let filter = RecordFilter::AnyNull(vec![TargetField::Email]);

        let first = store.fetch_page("restaurants", &filter, 0, 2).await.unwrap();
        let second = store.fetch_page("restaurants", &filter, 2, 2).await.unwrap();
        assert_eq!(first.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), ["A", "B"]);
        assert_eq!(second.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), ["C"]);

        let all = store.fetch_page("restaurants", &RecordFilter::All, 0, 10).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn memory_store_applies_partial_updates_and_injected_failures() {
        let ok = listing("Ok");
        let bad = listing("Bad");
        let (ok_id, bad_id) = (ok.id, bad.id);
        let store = MemoryStore::with_table("hotels", vec![ok, bad]);
        store.fail_updates_for(bad_id).await;

        let mut update = ListingUpdate::new();
        update.stage(TargetField::PriceLevel, FieldValue::Integer(4));
        store.update_fields("hotels", ok_id, &update).await.unwrap();
        let err = store.update_fields("hotels", bad_id, &update).await.unwrap_err();
        assert!(err.to_string().contains("update rejected"));

        let rows = store.snapshot("hotels").await;
        assert_eq!(rows[0].price_level, Some(4));
        assert_eq!(rows[1].price_level, None);
        assert_eq!(store.update_calls().await, 2);
    }

    #[tokio::test]
    async fn memory_store_selects_the_same_blank_rows_as_the_server() {
        let mut blank = listing("Blank");
        blank.email = Some(String::new());
        let mut empty_hours = listing("Empty hours");
        empty_hours.email = Some("hi@cafe.com".to_string());
        empty_hours.hours = Some(serde_json::json!({}));
        let mut filled = listing("Filled");
        filled.email = Some("owner@cafe.com".to_string());
        let store = MemoryStore::with_table("malls", vec![blank, empty_hours, filled]);

        let filter = RecordFilter::AnyNull(vec![TargetField::Email, TargetField::Hours]);
        let rows = store.fetch_page("malls", &filter, 0, 10).await.unwrap();
        let names: Vec<_> = rows.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["Blank", "Filled"]);

        let params = SupabaseStore::page_query(&filter, 0, 10);
        assert!(params.contains(&("or".to_string(), "(email.is.null,email.eq.,hours.is.null)".to_string())));
    }

    #[tokio::test]
    async fn memory_store_reports_missing_rows() {
        let store = MemoryStore::new();
        let err = store
            .update_fields("malls", Uuid::nil(), &ListingUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fixture_file_loads_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.json");
        let fixture = serde_json::json!({
            "malls": [{"id": Uuid::new_v4(), "name": "City Centre"}],
            "schools": [
                {"id": Uuid::new_v4(), "name": "North School", "email": "office@north.edu"},
                {"id": Uuid::new_v4(), "name": "South School", "apify_output": {"phone": "555 0100"}}
            ]
        });
        tokio::fs::write(&path, fixture.to_string()).await.unwrap();

        let store = MemoryStore::new();
        assert_eq!(store.load_fixture_file(&path).await.unwrap(), 3);
        assert_eq!(store.snapshot("malls").await.len(), 1);
        let schools = store.snapshot("schools").await;
        assert_eq!(schools[0].email.as_deref(), Some("office@north.edu"));
        assert!(schools[1].apify_output.is_some());

        assert!(store.load_fixture_file(dir.path().join("missing.json")).await.is_err());
    }
}
