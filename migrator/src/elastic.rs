use crate::model::{BulkFailure, Document, IndexTemplate, WriteOutcome};
use async_trait::async_trait;
use elasticsearch::auth::Credentials;
use elasticsearch::http::response::{Exception, Response};
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::http::Url;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesExistsParts, IndicesGetMappingParts, IndicesGetSettingsParts,
};
use elasticsearch::{
    BulkOperation, BulkParts, ClearScrollParts, CountParts, Elasticsearch, ScrollParts,
    SearchParts,
};
use migrator_core::config::ClusterConfig;
use migrator_core::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Settings the cluster generates on creation and refuses on index creation.
const READ_ONLY_SETTINGS: [&str; 4] = ["creation_date", "provided_name", "uuid", "version"];

/// The scroll, bulk and index-admin calls a transfer makes on a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ElasticApi: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn count(&self, index: &str, body: &Value) -> Result<u64>;

    async fn open_scroll(&self, index: &str, body: &Value, keepalive: &str) -> Result<ScrollPage>;

    async fn continue_scroll(&self, index: &str, scroll_id: &str, keepalive: &str) -> Result<ScrollPage>;

    /// Clearing a scroll that already expired is not an error
    async fn clear_scroll(&self, scroll_id: &str) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Settings and mappings of `index`, ready to create a copy of it
    async fn index_template(&self, index: &str) -> Result<IndexTemplate>;

    async fn create_index(&self, index: &str, template: &IndexTemplate) -> Result<()>;

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<WriteOutcome>;
}

/// One `Elasticsearch` client per configured host, used in rotation.
pub struct ElasticClient {
    clients: Vec<Elasticsearch>,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    #[serde(rename = "_shards")]
    shards: Option<ShardStats>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ShardStats {
    total: u64,
    successful: u64,
    #[serde(default)]
    skipped: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

impl ElasticClient {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let hosts = config
            .host_list()
            .iter()
            .map(|host| parse_host(host))
            .collect::<Result<Vec<_>>>()?;

        if hosts.is_empty() {
            return Err(Error::Config("no elasticsearch hosts configured".to_string()));
        }

        let clients = hosts
            .iter()
            .map(|url| connect(url, config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            clients,
            hosts,
            next_host: AtomicUsize::new(0),
        })
    }

    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    fn client(&self) -> &Elasticsearch {
        let i = self.next_host.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }
}

fn connect(url: &Url, config: &ClusterConfig) -> Result<Elasticsearch> {
    let pool = SingleNodeConnectionPool::new(url.clone());
    let mut builder = TransportBuilder::new(pool)
        .timeout(Duration::from_secs(config.request_timeout_secs));

    if let Some(username) = &config.username {
        builder = builder.auth(Credentials::Basic(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        ));
    }

    let transport = builder
        .build()
        .map_err(|e| Error::Config(format!("cannot connect to '{}': {}", url, e)))?;

    Ok(Elasticsearch::new(transport))
}

#[async_trait]
impl ElasticApi for ElasticClient {
    async fn ping(&self) -> Result<()> {
        let response = self.client().info().send().await?;
        let info = check(response).await?.json::<Value>().await?;

        let cluster = info.get("cluster_name").and_then(|v| v.as_str()).unwrap_or("unknown");
        let version = info
            .pointer("/version/number")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        debug!(cluster, version, "Connected to elasticsearch");
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn count(&self, index: &str, body: &Value) -> Result<u64> {
        let response = self
            .client()
            .count(CountParts::Index(&[index]))
            .body(body)
            .send()
            .await?;
        let response = check(response).await?.json::<CountResponse>().await?;
        Ok(response.count)
    }

    #[instrument(skip(self, body))]
    async fn open_scroll(&self, index: &str, body: &Value, keepalive: &str) -> Result<ScrollPage> {
        let response = self
            .client()
            .search(SearchParts::Index(&[index]))
            .scroll(keepalive)
            .body(body)
            .send()
            .await?;
        parse_scroll_page(index, check(response).await?.json::<Value>().await?)
    }

    #[instrument(skip(self, scroll_id))]
    async fn continue_scroll(&self, index: &str, scroll_id: &str, keepalive: &str) -> Result<ScrollPage> {
        let response = self
            .client()
            .scroll(ScrollParts::None)
            .body(json!({ "scroll": keepalive, "scroll_id": scroll_id }))
            .send()
            .await?;
        parse_scroll_page(index, check(response).await?.json::<Value>().await?)
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let response = self
            .client()
            .clear_scroll(ClearScrollParts::None)
            .body(json!({ "scroll_id": [scroll_id] }))
            .send()
            .await?;

        // An expired scroll answers 404
        or_absent(check(response).await.map(|_| ()), ())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .client()
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;

        or_absent(check(response).await.map(|_| true), false)
    }

    #[instrument(skip(self))]
    async fn index_template(&self, index: &str) -> Result<IndexTemplate> {
        let response = self
            .client()
            .indices()
            .get_settings(IndicesGetSettingsParts::Index(&[index]))
            .send()
            .await?;
        let settings = check(response).await?.json::<Value>().await?;

        let response = self
            .client()
            .indices()
            .get_mapping(IndicesGetMappingParts::Index(&[index]))
            .send()
            .await?;
        let mappings = check(response).await?.json::<Value>().await?;

        let mut settings = first_index_entry(index, &settings, "settings")?;
        strip_read_only_settings(&mut settings);

        Ok(IndexTemplate {
            settings,
            mappings: first_index_entry(index, &mappings, "mappings")?,
        })
    }

    #[instrument(skip(self, template))]
    async fn create_index(&self, index: &str, template: &IndexTemplate) -> Result<()> {
        let response = self
            .client()
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(json!({
                "settings": template.settings,
                "mappings": template.mappings,
            }))
            .send()
            .await?;
        let response = check(response).await?.json::<Value>().await?;

        if response.get("acknowledged").and_then(|v| v.as_bool()) != Some(true) {
            warn!(index, "Index creation was not acknowledged");
        }

        Ok(())
    }

    #[instrument(skip(self, documents), fields(count = documents.len()))]
    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<WriteOutcome> {
        if documents.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let response = self
            .client()
            .bulk(BulkParts::Index(index))
            .body(bulk_operations(documents))
            .send()
            .await?;

        parse_bulk_response(check(response).await?.json::<Value>().await?)
    }
}

fn parse_host(host: &str) -> Result<Url> {
    let url = Url::parse(host)
        .map_err(|e| Error::Config(format!("invalid elasticsearch host '{}': {}", host, e)))?;

    if url.cannot_be_a_base() {
        return Err(Error::Config(format!(
            "invalid elasticsearch host '{}': not a base URL",
            host
        )));
    }

    Ok(url)
}

/// Pass 2xx responses through, turn anything else into `Error::Elastic`.
async fn check(response: Response) -> Result<Response> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }

    // HEAD answers and proxies may not carry an exception body
    let exception = response.exception().await.ok().flatten();
    Err(status_error(status.as_u16(), exception.as_ref()))
}

pub fn status_error(status: u16, exception: Option<&Exception>) -> Error {
    Error::Elastic {
        status,
        reason: exception
            .map(exception_reason)
            .unwrap_or_else(|| "empty response body".to_string()),
    }
}

/// The most specific reason an exception carries.
pub fn exception_reason(exception: &Exception) -> String {
    let error = exception.error();
    error
        .root_cause()
        .first()
        .and_then(|cause| cause.reason())
        .or_else(|| error.reason())
        .unwrap_or("unspecified root cause or reason")
        .to_string()
}

/// Map a 404 to `absent`.
fn or_absent<T>(result: Result<T>, absent: T) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(absent),
        other => other,
    }
}

fn bulk_operations(documents: &[Document]) -> Vec<BulkOperation<Value>> {
    documents
        .iter()
        .map(|doc| BulkOperation::index(doc.source.clone()).id(doc.id.as_str()).into())
        .collect()
}

fn item_reason(error: &Value) -> String {
    match (
        error.get("type").and_then(Value::as_str),
        error.get("reason").and_then(Value::as_str),
    ) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (None, Some(reason)) => reason.to_string(),
        (Some(kind), None) => kind.to_string(),
        (None, None) => error.to_string(),
    }
}

fn parse_scroll_page(index: &str, body: Value) -> Result<ScrollPage> {
    let response: ScrollResponse = serde_json::from_value(body)?;

    if let Some(shards) = &response.shards {
        if shards.successful + shards.skipped < shards.total {
            let first = shards
                .failures
                .first()
                .and_then(|f| f.pointer("/reason/reason"))
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            return Err(Error::Scan {
                index: index.to_string(),
                details: format!(
                    "{} of {} shards failed: {}",
                    shards.total - shards.successful - shards.skipped,
                    shards.total,
                    first
                ),
            });
        }
    }

    Ok(ScrollPage {
        scroll_id: response.scroll_id,
        documents: response.hits.hits,
    })
}

fn parse_bulk_response(body: Value) -> Result<WriteOutcome> {
    let response: BulkResponse = serde_json::from_value(body)?;

    if !response.errors {
        return Ok(WriteOutcome {
            written: response.items.len(),
            failures: Vec::new(),
        });
    }

    let mut outcome = WriteOutcome::default();
    // Each item is keyed by its action name
    for item in response.items.into_iter().flat_map(HashMap::into_values) {
        match item.error {
            None if (200..300).contains(&item.status) => outcome.written += 1,
            error => outcome.failures.push(BulkFailure {
                id: item.id,
                status: item.status,
                reason: error
                    .as_ref()
                    .map(item_reason)
                    .unwrap_or_else(|| format!("status {}", item.status)),
            }),
        }
    }

    Ok(outcome)
}

fn first_index_entry(index: &str, body: &Value, field: &str) -> Result<Value> {
    // Keyed by concrete index name, which differs from `index` for aliases
    body.as_object()
        .and_then(|indices| indices.values().next())
        .and_then(|entry| entry.get(field))
        .cloned()
        .ok_or_else(|| {
            Error::Validation(format!("no {} returned for index '{}'", field, index))
        })
}

fn strip_read_only_settings(settings: &mut Value) {
    if let Some(index) = settings.get_mut("index").and_then(Value::as_object_mut) {
        for key in READ_ONLY_SETTINGS {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use elasticsearch::http::request::Body;
    use pretty_assertions::assert_eq;

    fn cluster(hosts: &str) -> ClusterConfig {
        ClusterConfig {
            hosts: hosts.to_string(),
            ..ClusterConfig::default()
        }
    }

    fn exception(body: Value) -> Exception {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn rejects_unparseable_host() {
        assert!(matches!(
            ElasticClient::new(&cluster("not a url")),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ElasticClient::new(&cluster("mailto:ops@example.com")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn builds_one_client_per_host() {
        let client = ElasticClient::new(&ClusterConfig {
            username: Some("elastic".to_string()),
            password: Some("changeme".to_string()),
            ..cluster("http://es1:9200, http://es2:9200/")
        })
        .unwrap();

        let hosts: Vec<&str> = client.hosts().iter().map(Url::as_str).collect();
        assert_eq!(hosts, vec!["http://es1:9200/", "http://es2:9200/"]);
        assert_eq!(client.clients.len(), 2);
    }

    #[test]
    fn error_status_keeps_root_cause_reason() {
        let not_found = exception(json!({
            "error": {
                "root_cause": [{"type": "index_not_found_exception", "reason": "no such index [books]"}],
                "type": "index_not_found_exception",
                "reason": "no such index [books] (outer)"
            },
            "status": 404
        }));

        let err = status_error(404, Some(&not_found));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "elasticsearch returned 404: no such index [books]");
    }

    #[test]
    fn error_status_falls_back_to_outer_reason() {
        let outer = exception(json!({
            "error": {"type": "illegal_argument_exception", "reason": "outer only"},
            "status": 400
        }));
        assert_eq!(exception_reason(&outer), "outer only");

        let bare = exception(json!({"error": {"type": "x"}, "status": 500}));
        assert_eq!(exception_reason(&bare), "unspecified root cause or reason");

        assert!(matches!(
            status_error(401, None),
            Error::Elastic { status: 401, reason } if reason == "empty response body"
        ));
    }

    #[test]
    fn not_found_means_absent() {
        assert!(matches!(or_absent(Err(status_error(404, None)), false), Ok(false)));
        assert!(matches!(or_absent(Ok(true), false), Ok(true)));
        assert!(matches!(or_absent(Err(status_error(404, None)), ()), Ok(())));
        assert!(matches!(
            or_absent(Err(status_error(500, None)), ()),
            Err(Error::Elastic { status: 500, .. })
        ));
    }

    #[test]
    fn parses_scroll_page_in_hit_order() {
        let body = json!({
            "_scroll_id": "c2Nyb2xs",
            "_shards": {"total": 2, "successful": 2, "skipped": 0, "failed": 0},
            "hits": {
                "total": {"value": 2, "relation": "eq"},
                "hits": [
                    {"_index": "books", "_id": "1", "_score": null, "_source": {"text": "a"}},
                    {"_index": "books", "_id": "2", "_score": null, "_source": {"text": "b"}}
                ]
            }
        });

        let page = parse_scroll_page("books", body).unwrap();
        assert_eq!(page.scroll_id.as_deref(), Some("c2Nyb2xs"));
        assert_eq!(
            page.documents,
            vec![
                Document::new("1", json!({"text": "a"})),
                Document::new("2", json!({"text": "b"})),
            ]
        );
    }

    #[test]
    fn shard_failures_fail_the_scan() {
        let body = json!({
            "_scroll_id": "c2Nyb2xs",
            "_shards": {
                "total": 3, "successful": 1, "skipped": 1, "failed": 1,
                "failures": [{"shard": 2, "reason": {"type": "x", "reason": "shard went away"}}]
            },
            "hits": {"hits": []}
        });

        match parse_scroll_page("books", body) {
            Err(Error::Scan { index, details }) => {
                assert_eq!(index, "books");
                assert_eq!(details, "1 of 3 shards failed: shard went away");
            }
            other => panic!("expected scan error, got {:?}", other),
        }
    }

    #[test]
    fn bulk_operations_keep_ids_and_sources() {
        let docs = vec![
            Document::new("1", json!({"id": 1, "text": "a"})),
            Document::new("x/2", json!({"nested": {"k": [1, 2]}})),
        ];

        let mut buf = BytesMut::new();
        for op in bulk_operations(&docs) {
            op.write(&mut buf).unwrap();
        }
        let body = String::from_utf8(buf.to_vec()).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["index"]["_id"], json!("1"));
        assert_eq!(lines[1], json!({"id": 1, "text": "a"}));
        assert_eq!(lines[2]["index"]["_id"], json!("x/2"));
        assert_eq!(lines[3], json!({"nested": {"k": [1, 2]}}));
    }

    #[test]
    fn bulk_response_without_errors_counts_items() {
        let body = json!({
            "took": 3,
            "errors": false,
            "items": [
                {"index": {"_id": "1", "status": 201, "result": "created"}},
                {"index": {"_id": "2", "status": 200, "result": "updated"}}
            ]
        });
        assert_eq!(
            parse_bulk_response(body).unwrap(),
            WriteOutcome {
                written: 2,
                failures: vec![]
            }
        );
    }

    #[test]
    fn bulk_response_reports_failed_items() {
        let body = json!({
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201, "result": "created"}},
                {"index": {
                    "_id": "2",
                    "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field [n]"}
                }}
            ]
        });

        let outcome = parse_bulk_response(body).unwrap();
        assert_eq!(outcome.written, 1);
        assert_eq!(
            outcome.failures,
            vec![BulkFailure {
                id: Some("2".to_string()),
                status: 400,
                reason: "mapper_parsing_exception: failed to parse field [n]".to_string(),
            }]
        );
    }

    #[test]
    fn template_drops_read_only_settings() {
        let mut settings = first_index_entry(
            "books",
            &json!({
                "books-v2": {"settings": {"index": {
                    "number_of_shards": "1",
                    "creation_date": "1700000000000",
                    "provided_name": "books-v2",
                    "uuid": "abc",
                    "version": {"created": "8110099"}
                }}}
            }),
            "settings",
        )
        .unwrap();
        strip_read_only_settings(&mut settings);

        assert_eq!(settings, json!({"index": {"number_of_shards": "1"}}));
    }

    #[test]
    fn template_requires_index_entry() {
        assert!(matches!(
            first_index_entry("books", &json!({}), "mappings"),
            Err(Error::Validation(_))
        ));
    }
}
