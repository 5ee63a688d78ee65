//! Client side of the Trefle plant database and the pagination adapter
//! built on top of it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Plant as returned by the provider, before it is cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantRecord {
    pub id: i32,
    pub slug: String,
    pub scientific_name: String,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Links {
    #[serde(rename = "self", default)]
    pub current: Option<String>,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
}

/// `{ data: [...], links: {...} }` as sent back by list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchEnvelope {
    pub data: Vec<PlantRecord>,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Deserialize)]
struct DetailEnvelope {
    data: PlantRecord,
}

/// Multi-field query for the `/species` endpoint.
///
/// `filter[field]=a,b` matches any of the values, `range[field]=min,max`
/// bounds a numeric field; either bound may be left open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedFilter {
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub ranges: BTreeMap<String, Bounds>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

impl AdvancedFilter {
    pub fn filter<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(field.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn range(mut self, field: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        self.ranges.insert(field.into(), Bounds { min, max });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.values().all(Vec::is_empty)
            && self.ranges.values().all(|b| b.min.is_none() && b.max.is_none())
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let filters = self
            .filters
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(field, values)| (format!("filter[{field}]"), values.join(",")));
        let ranges = self
            .ranges
            .iter()
            .filter(|(_, b)| b.min.is_some() || b.max.is_some())
            .map(|(field, b)| {
                let bound = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
                (format!("range[{field}]"), format!("{},{}", bound(b.min), bound(b.max)))
            });
        filters.chain(ranges).collect()
    }
}

/// Opaque continuation handed back to callers between pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

#[async_trait]
pub trait PlantProvider: Send + Sync {
    /// `GET /species/search?q=term`
    async fn search(&self, term: &str) -> Result<SearchEnvelope>;

    /// `GET /species` with filter and range parameters.
    async fn filter(&self, filter: &AdvancedFilter) -> Result<SearchEnvelope>;

    /// Follows a pagination link previously returned in `links`.
    async fn follow(&self, cursor: &Cursor) -> Result<SearchEnvelope>;

    /// `GET /species/{slug}`
    async fn species(&self, slug: &str) -> Result<PlantRecord>;
}

/// Trefle over HTTPS. The API token is appended to every request.
#[derive(Debug, Clone)]
pub struct TrefleClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl TrefleClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid provider url {base_url:?}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(TrefleClient {
            http,
            base,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::ExternalService(format!("bad endpoint {path:?}: {e}")))
    }

    /// Pagination links are relative to the provider host. Anything that
    /// resolves to another origin is refused so the token never leaves it.
    fn resolve_cursor(&self, cursor: &Cursor) -> Result<Url> {
        let url = self
            .base
            .join(cursor.0.trim())
            .map_err(|_| Error::invalid("cursor", "not a valid page cursor"))?;
        if url.origin() != self.base.origin() {
            return Err(Error::invalid("cursor", "page cursor points elsewhere"));
        }
        Ok(url)
    }

    async fn get<T>(&self, url: Url, query: &[(String, String)]) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        tracing::debug!(path = url.path(), "provider request");
        let response = self
            .http
            .get(url)
            .query(query)
            .query(&[("token", self.token.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "provider answered with an error");
            return Err(Error::ExternalService(format!("provider returned {status}")));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PlantProvider for TrefleClient {
    async fn search(&self, term: &str) -> Result<SearchEnvelope> {
        let url = self.endpoint("species/search")?;
        self.get(url, &[("q".to_owned(), term.to_owned())]).await
    }

    async fn filter(&self, filter: &AdvancedFilter) -> Result<SearchEnvelope> {
        let url = self.endpoint("species")?;
        self.get(url, &filter.query_pairs()).await
    }

    async fn follow(&self, cursor: &Cursor) -> Result<SearchEnvelope> {
        let url = self.resolve_cursor(cursor)?;
        self.get(url, &[]).await
    }

    async fn species(&self, slug: &str) -> Result<PlantRecord> {
        let slug = slug.trim();
        if slug.is_empty() || slug.contains(['/', '?', '#']) {
            return Err(Error::invalid("slug", "not a plant slug"));
        }
        let url = self.endpoint(&format!("species/{slug}"))?;
        let envelope: DetailEnvelope = self.get(url, &[]).await?;
        Ok(envelope.data)
    }
}

/// Where a page request starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    Query(String),
    Filter(AdvancedFilter),
    Cursor(Cursor),
}

/// What comes after a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "cursor", rename_all = "snake_case")]
pub enum NextPage {
    Cursor(Cursor),
    EndOfResults,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub records: Vec<PlantRecord>,
    pub next: NextPage,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next == NextPage::EndOfResults
    }
}

impl From<SearchEnvelope> for Page {
    /// Only a `next` link continues; `last` is never used as a fallback.
    fn from(envelope: SearchEnvelope) -> Self {
        let Links { current, next, .. } = envelope.links;
        let next = match next {
            Some(next) if !next.trim().is_empty() && Some(&next) != current.as_ref() => {
                NextPage::Cursor(Cursor(next))
            }
            _ => NextPage::EndOfResults,
        };
        Page {
            records: envelope.data,
            next,
        }
    }
}

/// Pull one page of results.
pub async fn fetch_page(provider: &dyn PlantProvider, request: PageRequest) -> Result<Page> {
    let envelope = match &request {
        PageRequest::Query(term) => {
            let term = term.trim();
            if term.is_empty() {
                return Err(Error::invalid("q", "enter something to search for"));
            }
            provider.search(term).await?
        }
        PageRequest::Filter(filter) => {
            if filter.is_empty() {
                return Err(Error::invalid("filter", "choose at least one criterion"));
            }
            provider.filter(filter).await?
        }
        PageRequest::Cursor(cursor) => provider.follow(cursor).await?,
    };
    let page = Page::from(envelope);
    tracing::debug!(records = page.records.len(), last = page.is_last(), "fetched page");
    Ok(page)
}



#[cfg(test)]
mod client_tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use serde_json::json;
    use warp::http::Response;
    use warp::Filter;

    use super::*;

    type Query = HashMap<String, String>;

    fn respond(status: u16, body: impl Into<String>) -> Response<String> {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    fn has_token(query: &Query) -> bool {
        query.get("token").map(String::as_str) == Some("secret")
    }

    fn record_json(id: i32, slug: &str) -> serde_json::Value {
        json!({
            "id": id,
            "slug": slug,
            "scientific_name": slug.replace('-', " "),
            "image_url": null,
        })
    }

    /// Trefle look-alike on an ephemeral port. Every route answers 401 unless
    /// the `token` parameter is present.
    async fn stub_trefle() -> SocketAddr {
        let search = warp::path!("api" / "v1" / "species" / "search")
            .and(warp::query::<Query>())
            .map(|query: Query| {
                if !has_token(&query) {
                    return respond(401, r#"{"error": true}"#);
                }
                let term = query.get("q").cloned().unwrap_or_default();
                let link = |n: u32| format!("/api/v1/species/search?page={n}&q={term}");
                let body = match query.get("page").map(String::as_str) {
                    None | Some("1") => json!({
                        "data": [record_json(1, "rosa-canina")],
                        "links": { "self": link(1), "first": link(1), "next": link(2), "last": link(2) },
                    }),
                    _ => json!({
                        "data": [record_json(2, "rosa-gallica")],
                        "links": { "self": link(2), "first": link(1), "last": link(2) },
                    }),
                };
                respond(200, body.to_string())
            });

        let filtered = warp::path!("api" / "v1" / "species")
            .and(warp::query::<Query>())
            .map(|query: Query| {
                let expected = has_token(&query)
                    && query.get("filter[flower_color]").map(String::as_str) == Some("red,yellow")
                    && query.get("range[maximum_height_cm]").map(String::as_str) == Some("5,20");
                if !expected {
                    return respond(400, r#"{"error": true}"#);
                }
                respond(200, json!({ "data": [record_json(3, "rosa-rugosa")] }).to_string())
            });

        let detail = warp::path!("api" / "v1" / "species" / String)
            .and(warp::query::<Query>())
            .then(|slug: String, query: Query| async move {
                if !has_token(&query) {
                    return respond(401, r#"{"error": true}"#);
                }
                match slug.as_str() {
                    "missing" => respond(404, r#"{"error": true, "message": "Not found"}"#),
                    "garbled" => respond(200, r#"{"data": {"id": "#),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        respond(200, json!({ "data": record_json(9, "slow") }).to_string())
                    }
                    _ => respond(200, json!({ "data": record_json(4, &slug) }).to_string()),
                }
            });

        let (addr, server) =
            warp::serve(search.or(filtered).or(detail)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn client(addr: SocketAddr, token: &str, timeout: Duration) -> TrefleClient {
        TrefleClient::new(&format!("http://{addr}/api/v1"), token, timeout).unwrap()
    }

    #[tokio::test]
    async fn follows_cursors_with_the_token_attached() {
        let addr = stub_trefle().await;
        let trefle = client(addr, "secret", Duration::from_secs(5));

        let first = fetch_page(&trefle, PageRequest::Query("rosa".into()))
            .await
            .unwrap();
        assert_eq!(first.records[0].slug, "rosa-canina");
        let NextPage::Cursor(cursor) = first.next else {
            panic!("expected a next page");
        };

        let second = fetch_page(&trefle, PageRequest::Cursor(cursor)).await.unwrap();
        assert_eq!(second.records[0].slug, "rosa-gallica");
        assert!(second.is_last());
    }

    #[tokio::test]
    async fn advanced_filter_reaches_the_server_encoded() {
        let addr = stub_trefle().await;
        let trefle = client(addr, "secret", Duration::from_secs(5));
        let filter = AdvancedFilter::default()
            .filter("flower_color", ["red", "yellow"])
            .range("maximum_height_cm", Some(5), Some(20));

        let page = fetch_page(&trefle, PageRequest::Filter(filter)).await.unwrap();
        assert_eq!(page.records[0].slug, "rosa-rugosa");
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn species_detail_is_unwrapped() {
        let addr = stub_trefle().await;
        let trefle = client(addr, "secret", Duration::from_secs(5));
        let record = trefle.species("mentha-spicata").await.unwrap();
        assert_eq!(record.id, 4);
        assert_eq!(record.scientific_name, "mentha spicata");
    }

    #[tokio::test]
    async fn error_statuses_are_external_service_failures() {
        let addr = stub_trefle().await;

        let trefle = client(addr, "secret", Duration::from_secs(5));
        let err = trefle.species("missing").await.unwrap_err();
        assert!(matches!(&err, Error::ExternalService(msg) if msg.contains("404")), "got {err:?}");

        let anonymous = client(addr, "wrong", Duration::from_secs(5));
        let err = fetch_page(&anonymous, PageRequest::Query("rosa".into()))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::ExternalService(msg) if msg.contains("401")), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_body_is_an_external_service_failure() {
        let addr = stub_trefle().await;
        let trefle = client(addr, "secret", Duration::from_secs(5));
        let err = trefle.species("garbled").await.unwrap_err();
        assert!(matches!(err, Error::ExternalService(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let addr = stub_trefle().await;
        let trefle = client(addr, "secret", Duration::from_millis(200));
        let err = trefle.species("slow").await.unwrap_err();
        assert!(matches!(err, Error::ExternalService(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_external_service_failure() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let trefle = client(addr, "secret", Duration::from_secs(5));
        let err = fetch_page(&trefle, PageRequest::Query("rosa".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalService(_)), "got {err:?}");
    }
}
