// Paging over one REST resource.
//
// Payload lives under the body's first top-level key: an object is one
// document, a list contributes each item. Continuation follows `next_page`,
// otherwise `meta.after_cursor` while `meta.has_more` is true.
mod error;

use std::fmt;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use url::{form_urlencoded, Url};

use crate::config::HttpConfig;

pub use self::error::FetchError;

const PAGE_AFTER_PARAM: &str = "page[after]";
const PAGE_SIZE_PARAM: &str = "page[size]";

/// API credentials for one tenant.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub subdomain: String,
    pub api_user_email: String,
    pub api_key: String,
}

impl Credentials {
    pub fn new(
        subdomain: impl Into<String>,
        api_user_email: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            subdomain: subdomain.into(),
            api_user_email: api_user_email.into(),
            api_key: api_key.into(),
        }
    }

    /// `Basic base64("<email>/token:<api_key>")`
    pub fn basic_auth_value(&self) -> String {
        let raw = format!("{}/token:{}", self.api_user_email, self.api_key);
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
        format!("Basic {encoded}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("subdomain", &self.subdomain)
            .field("api_user_email", &self.api_user_email)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Outcome of paginating one concrete path. Any failure discards the pages
/// fetched before it.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub records: Vec<Value>,
    pub error: Option<FetchError>,
    pub pages: usize,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Paginator {
    client: reqwest::Client,
    base_url: String,
    per_page: usize,
    max_pages: Option<usize>,
    deadline: Option<Duration>,
}

impl Paginator {
    pub fn new(
        base_url: impl Into<String>,
        credentials: &Credentials,
        http: &HttpConfig,
    ) -> Result<Self, FetchError> {
        let mut auth = HeaderValue::from_str(&credentials.basic_auth_value())
            .map_err(|e| FetchError::InvalidUrl(format!("invalid credentials header: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(http.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            per_page: http.per_page,
            max_pages: http.max_pages,
            deadline: http.endpoint_deadline(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch every page reachable from `path`.
    pub async fn fetch_all(&self, path: &str) -> FetchResult {
        let outcome = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.try_fetch_all(path))
                .await
                .unwrap_or(Err(FetchError::Deadline(deadline))),
            None => self.try_fetch_all(path).await,
        };

        match outcome {
            Ok((records, pages)) => FetchResult {
                records,
                error: None,
                pages,
            },
            Err(e) => {
                log::error!("Request error for {path}: {e}");
                FetchResult {
                    records: Vec::new(),
                    error: Some(e),
                    pages: 0,
                }
            }
        }
    }

    async fn try_fetch_all(&self, path: &str) -> Result<(Vec<Value>, usize), FetchError> {
        let origin = self.resolve_url(path)?;
        let mut records = Vec::new();
        let mut url = origin.clone();
        let mut pages = 0usize;

        loop {
            if let Some(max) = self.max_pages {
                if pages >= max {
                    return Err(FetchError::PageLimit(max));
                }
            }

            pages += 1;
            log::info!("{pages}. {url}");
            let body = self.get_page(&url).await?;
            extract_records(&body, url.as_str(), &mut records)?;

            match next_page_url(&body, &origin, url.as_str(), self.per_page)? {
                Some(next) => url = next,
                None => break,
            }
        }

        log::debug!("Fetched {} records in {pages} pages from {path}", records.len());
        Ok((records, pages))
    }

    fn resolve_url(&self, path: &str) -> Result<Url, FetchError> {
        let full = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };
        Url::parse(&full).map_err(|e| FetchError::InvalidUrl(format!("{full}: {e}")))
    }

    async fn get_page(&self, url: &Url) -> Result<Value, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Append the payload under the body's first top-level key.
pub fn extract_records(body: &Value, url: &str, out: &mut Vec<Value>) -> Result<(), FetchError> {
    let map = body
        .as_object()
        .ok_or_else(|| FetchError::UnexpectedShape(url.to_string()))?;

    match map.iter().next() {
        Some((_, Value::Object(single))) => out.push(Value::Object(single.clone())),
        Some((_, Value::Array(items))) => out.extend(items.iter().cloned()),
        Some((key, other)) => {
            log::debug!("First key '{key}' of {url} holds a scalar ({other}), nothing to keep")
        }
        None => {}
    }
    Ok(())
}

/// Where to go after `body`, if anywhere.
pub fn next_page_url(
    body: &Value,
    origin: &Url,
    current: &str,
    per_page: usize,
) -> Result<Option<Url>, FetchError> {
    if let Some(next) = body.get("next_page").and_then(Value::as_str) {
        if !next.is_empty() {
            let url = origin
                .join(next)
                .map_err(|e| FetchError::InvalidUrl(format!("{next}: {e}")))?;
            return Ok(Some(url));
        }
    }

    let meta = body.get("meta");
    let has_more = meta
        .and_then(|m| m.get("has_more"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !has_more {
        return Ok(None);
    }

    let cursor = meta
        .and_then(|m| m.get("after_cursor"))
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::MissingCursor(current.to_string()))?;
    Ok(Some(cursor_url(origin, cursor, per_page)))
}

// Keys go out literally as `page[after]` and `page[size]`; only values are encoded.
fn cursor_url(origin: &Url, cursor: &str, per_page: usize) -> Url {
    let mut retained = form_urlencoded::Serializer::new(String::new());
    for (k, v) in origin.query_pairs() {
        if k != PAGE_AFTER_PARAM && k != PAGE_SIZE_PARAM {
            retained.append_pair(&k, &v);
        }
    }
    let mut query = retained.finish();
    if !query.is_empty() {
        query.push('&');
    }
    let cursor: String = form_urlencoded::byte_serialize(cursor.as_bytes()).collect();
    query.push_str(&format!("{PAGE_AFTER_PARAM}={cursor}&{PAGE_SIZE_PARAM}={per_page}"));

    let mut url = origin.clone();
    url.set_query(Some(&query));
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> Credentials {
        Credentials::new("acme", "agent@acme.test", "secret")
    }

    fn paginator(server: &MockServer, http: HttpConfig) -> Paginator {
        Paginator::new(server.uri(), &creds(), &http).unwrap()
    }

    #[test]
    fn basic_auth_uses_token_convention() {
        let expected = base64::engine::general_purpose::STANDARD.encode("agent@acme.test/token:secret");
        assert_eq!(creds().basic_auth_value(), format!("Basic {expected}"));
        assert!(!format!("{:?}", creds()).contains("secret"));
    }

    #[test]
    fn single_object_is_one_document() {
        let mut out = Vec::new();
        extract_records(&json!({"account": {"a": 1}}), "u", &mut out).unwrap();
        assert_eq!(out, vec![json!({"a": 1})]);

        let mut out = Vec::new();
        extract_records(&json!({"users": [{"id": 1}, {"id": 2}], "count": 2}), "u", &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);

        assert!(matches!(
            extract_records(&json!([1, 2]), "u", &mut out),
            Err(FetchError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn cursor_url_replaces_page_params() {
        let origin = Url::parse("https://acme.test/api/v2/tickets.json?sort=id&page[size]=5").unwrap();
        let next = cursor_url(&origin, "abc", 100);
        let pairs: Vec<(String, String)> = next
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("sort".to_string(), "id".to_string()),
                ("page[after]".to_string(), "abc".to_string()),
                ("page[size]".to_string(), "100".to_string()),
            ]
        );
        assert_eq!(next.path(), "/api/v2/tickets.json");
    }

    #[test]
    fn cursor_keys_are_sent_unescaped() {
        let origin = Url::parse("https://acme.test/api/v2/tickets.json").unwrap();
        let next = cursor_url(&origin, "ab+c=", 100);
        assert_eq!(next.query(), Some("page[after]=ab%2Bc%3D&page[size]=100"));
    }

    #[test]
    fn has_more_without_cursor_is_an_error() {
        let origin = Url::parse("https://acme.test/x").unwrap();
        let body = json!({"items": [], "meta": {"has_more": true}});
        assert!(matches!(
            next_page_url(&body, &origin, "https://acme.test/x", 100),
            Err(FetchError::MissingCursor(_))
        ));

        let done = json!({"items": [], "next_page": null, "meta": {"has_more": false}});
        assert!(next_page_url(&done, &origin, "https://acme.test/x", 100)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn follows_next_page_until_absent() {
        let server = MockServer::start().await;
        let page2 = format!("{}/api/v2/users.json?page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/api/v2/users.json"))
            .and(query_param_is_missing("page"))
            .and(header("Authorization", creds().basic_auth_value().as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{"id": 1}, {"id": 2}],
                "next_page": page2,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/users.json"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{"id": 3}],
                "next_page": null,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = paginator(&server, HttpConfig::default())
            .fetch_all("/api/v2/users.json")
            .await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.pages, 2);
        assert_eq!(
            result.records,
            vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]
        );
    }

    #[tokio::test]
    async fn follows_cursor_until_has_more_false() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets.json"))
            .and(query_param_is_missing("page[after]"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [{"id": 10}],
                "meta": {"has_more": true, "after_cursor": "c1"},
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/tickets.json"))
            .and(query_param("page[after]", "c1"))
            .and(query_param("page[size]", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [{"id": 11}],
                "meta": {"has_more": false, "after_cursor": "c2"},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpConfig {
            per_page: 50,
            ..HttpConfig::default()
        };
        let result = paginator(&server, http).fetch_all("/api/v2/tickets.json").await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.pages, 2);
        assert_eq!(result.records, vec![json!({"id": 10}), json!({"id": 11})]);
    }

    #[tokio::test]
    async fn failure_discards_earlier_pages() {
        let server = MockServer::start().await;
        let page2 = format!("{}/broken", server.uri());

        Mock::given(method("GET"))
            .and(path("/api/v2/groups.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "groups": [{"id": 1}],
                "next_page": page2,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = paginator(&server, HttpConfig::default())
            .fetch_all("/api/v2/groups.json")
            .await;
        assert!(result.records.is_empty());
        match result.error {
            Some(FetchError::Status { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn page_ceiling_stops_runaway_pagination() {
        let server = MockServer::start().await;
        let again = format!("{}/loop", server.uri());

        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 1}],
                "next_page": again,
            })))
            .expect(3)
            .mount(&server)
            .await;

        let http = HttpConfig {
            max_pages: Some(3),
            ..HttpConfig::default()
        };
        let result = paginator(&server, http).fetch_all("/loop").await;
        assert!(matches!(result.error, Some(FetchError::PageLimit(3))));
        assert!(result.records.is_empty());
    }
}
