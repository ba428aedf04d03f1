//! CouchDB HTTP client.

use std::path::Path;
use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{BulkResult, DocumentStore, FetchRow, StoreConnector, StoreRow};
use crate::config::SyncConfig;
use crate::document::DESIGN_PREFIX;
use crate::error::{Result, SyncError};
use crate::fs::BoxFuture;

/// Username/password pair exchanged for a session cookie.
#[derive(Clone)]
pub struct Credentials {
    /// CouchDB user name
    pub username: String,
    /// CouchDB password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connects to a CouchDB database, optionally through a cookie session.
#[derive(Debug, Clone)]
pub struct CouchConnector {
    db_url: Url,
    credentials: Option<Credentials>,
}

impl CouchConnector {
    /// Connector for the database at `url` (e.g. `http://localhost:5984/app`).
    pub fn new(url: &str) -> Result<Self> {
        let trimmed = url.trim_end_matches('/');
        let db_url = Url::parse(trimmed).map_err(|source| SyncError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Ok(Self {
            db_url,
            credentials: None,
        })
    }

    /// Authenticate with a session cookie before use.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Connector built from the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let connector = Self::new(&config.url)?;
        Ok(match (&config.username, &config.password) {
            (Some(username), Some(password)) => connector.with_credentials(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => connector,
        })
    }

    fn connection_error(&self, message: impl Into<String>) -> SyncError {
        SyncError::Connection {
            url: self.db_url.to_string(),
            message: message.into(),
        }
    }

    /// Exchange credentials for an `AuthSession` cookie.
    async fn open_session(&self, http: &Client, credentials: &Credentials) -> Result<String> {
        let session_url = self
            .db_url
            .join("_session")
            .map_err(|e| self.connection_error(e.to_string()))?;

        let resp = http
            .post(session_url)
            .json(&json!({
                "name": credentials.username,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(self.connection_error(format!(
                "authentication as '{}' failed: {}",
                credentials.username,
                resp.status()
            )));
        }

        resp.headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(String::from)
            .ok_or_else(|| self.connection_error("session response carried no cookie"))
    }

    async fn connect_client(&self) -> Result<CouchClient> {
        let http = Client::builder()
            .build()
            .map_err(|e| self.connection_error(e.to_string()))?;

        let cookie = match &self.credentials {
            Some(credentials) => Some(self.open_session(&http, credentials).await?),
            None => None,
        };

        let client = CouchClient {
            http,
            db: self.db_url.as_str().trim_end_matches('/').to_string(),
            cookie,
        };

        // Fail here rather than halfway through the run.
        let resp = client
            .request(Method::GET, &client.db)
            .send()
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(self.connection_error(format!("database answered {}", resp.status())));
        }

        log::info!("[store] Connected to {}", client.db);
        Ok(client)
    }
}

impl StoreConnector for CouchConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn DocumentStore>>> {
        Box::pin(async move {
            let client = self.connect_client().await?;
            Ok(Arc::new(client) as Arc<dyn DocumentStore>)
        })
    }
}

/// An authenticated handle to one CouchDB database.
#[derive(Debug, Clone)]
pub struct CouchClient {
    http: Client,
    db: String,
    cookie: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    doc: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    rev: String,
}

#[derive(Debug, Default, Deserialize)]
struct CouchErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

impl CouchClient {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.cookie {
            Some(cookie) => builder.header(COOKIE, cookie.as_str()),
            None => builder,
        }
    }

    /// URL of a document. Design ids keep their literal `_design/` slash.
    fn doc_url(&self, id: &str) -> String {
        match id.strip_prefix(DESIGN_PREFIX) {
            Some(name) => format!("{}/{}{}", self.db, DESIGN_PREFIX, urlencoding::encode(name)),
            None => format!("{}/{}", self.db, urlencoding::encode(id)),
        }
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body: CouchErrorBody = resp.json().await.unwrap_or_default();
        Err(SyncError::StoreUnavailable(format!(
            "{} {}: {} {}",
            status, url, body.error, body.reason
        )))
    }
}

impl DocumentStore for CouchClient {
    fn name(&self) -> &str {
        &self.db
    }

    fn all_docs_in_range<'a>(
        &'a self,
        start: &'a str,
        end: &'a str,
    ) -> BoxFuture<'a, Result<Vec<StoreRow>>> {
        Box::pin(async move {
            let url = format!("{}/_all_docs", self.db);
            let resp = self
                .request(Method::GET, &url)
                .query(&[
                    ("include_docs", "true".to_string()),
                    ("startkey", serde_json::to_string(start)?),
                    ("endkey", serde_json::to_string(end)?),
                    ("inclusive_end", "false".to_string()),
                ])
                .send()
                .await?;
            let body: AllDocsResponse = Self::check(resp).await?.json().await?;

            Ok(body
                .rows
                .into_iter()
                .filter_map(|row| match (row.id, row.doc) {
                    (Some(id), Some(doc)) if !doc.is_null() => Some(StoreRow { id, doc }),
                    _ => None,
                })
                .collect())
        })
    }

    fn fetch<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<Vec<FetchRow>>> {
        Box::pin(async move {
            let url = format!("{}/_all_docs", self.db);
            let resp = self
                .request(Method::POST, &url)
                .query(&[("include_docs", "true")])
                .json(&json!({ "keys": keys }))
                .send()
                .await?;
            let body: AllDocsResponse = Self::check(resp).await?.json().await?;

            let mut rows: Vec<FetchRow> = body
                .rows
                .into_iter()
                .map(|row| match (row.error, row.doc) {
                    (None, Some(doc)) if !doc.is_null() => FetchRow::Found(doc),
                    _ => FetchRow::NotFound,
                })
                .collect();
            // One row per requested key, in request order.
            rows.resize(keys.len(), FetchRow::NotFound);
            Ok(rows)
        })
    }

    fn insert<'a>(&'a self, id: &'a str, doc: &'a Value) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let resp = self
                .request(Method::PUT, &self.doc_url(id))
                .json(doc)
                .send()
                .await?;
            let body: InsertResponse = Self::check(resp).await?.json().await?;
            Ok(body.rev)
        })
    }

    fn bulk_docs<'a>(&'a self, payload: &'a Path) -> BoxFuture<'a, Result<Vec<BulkResult>>> {
        Box::pin(async move {
            let file = tokio::fs::File::open(payload)
                .await
                .map_err(|source| SyncError::FileRead {
                    path: payload.to_path_buf(),
                    source,
                })?;

            let url = format!("{}/_bulk_docs", self.db);
            let resp = self
                .request(Method::POST, &url)
                .header(CONTENT_TYPE, "application/json")
                .body(reqwest::Body::from(file))
                .send()
                .await
                .map_err(|e| SyncError::BulkUpdate(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let body: CouchErrorBody = resp.json().await.unwrap_or_default();
                return Err(SyncError::BulkUpdate(format!(
                    "{}: {} {}",
                    status, body.error, body.reason
                )));
            }
            resp.json()
                .await
                .map_err(|e| SyncError::BulkUpdate(e.to_string()))
        })
    }

    fn query_view<'a>(
        &'a self,
        design: &'a str,
        view: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let url = format!(
                "{}/{}{}/_view/{}",
                self.db,
                DESIGN_PREFIX,
                urlencoding::encode(design),
                urlencoding::encode(view)
            );
            let resp = self
                .request(Method::GET, &url)
                .query(&[("limit", limit)])
                .send()
                .await?;
            Self::check(resp).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str) -> CouchClient {
        CouchClient {
            http: Client::new(),
            db: url.to_string(),
            cookie: None,
        }
    }

    #[test]
    fn test_doc_url_encoding() {
        let c = client("http://localhost:5984/app");
        assert_eq!(c.doc_url("user/42"), "http://localhost:5984/app/user%2F42");
        assert_eq!(
            c.doc_url("_design/my app"),
            "http://localhost:5984/app/_design/my%20app"
        );
    }

    #[test]
    fn test_connector_trims_trailing_slash() {
        let connector = CouchConnector::new("http://localhost:5984/app/").unwrap();
        assert_eq!(connector.db_url.as_str(), "http://localhost:5984/app");
        assert_eq!(
            connector.db_url.join("_session").unwrap().as_str(),
            "http://localhost:5984/_session"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            CouchConnector::new("not a url"),
            Err(SyncError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_bulk_result_shapes() {
        let rows: Vec<BulkResult> = serde_json::from_str(
            r#"[{"ok":true,"id":"a","rev":"1-x"},{"id":"b","error":"conflict","reason":"Document update conflict."}]"#,
        )
        .unwrap();
        assert!(rows[0].is_ok());
        assert!(!rows[1].is_ok());
        assert_eq!(rows[1].error.as_deref(), Some("conflict"));
    }

    const COOKIE_VALUE: &str = "AuthSession=c2Vzc2lvbg";

    fn db_url(server: &mockito::Server) -> String {
        format!("{}/app", server.url())
    }

    #[tokio::test]
    async fn test_session_cookie_is_sent_on_every_request() {
        let mut server = mockito::Server::new_async().await;
        let session = server
            .mock("POST", "/_session")
            .match_body(Matcher::Json(json!({"name": "admin", "password": "secret"})))
            .with_status(200)
            .with_header("set-cookie", &format!("{}; Version=1; Path=/; HttpOnly", COOKIE_VALUE))
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;
        let db = server
            .mock("GET", "/app")
            .match_header("cookie", COOKIE_VALUE)
            .with_status(200)
            .with_body(r#"{"db_name":"app"}"#)
            .create_async()
            .await;
        let view = server
            .mock("GET", "/app/_design/app/_view/by_name")
            .match_query(Matcher::UrlEncoded("limit".into(), "1".into()))
            .match_header("cookie", COOKIE_VALUE)
            .with_status(200)
            .with_body(r#"{"total_rows":0,"offset":0,"rows":[]}"#)
            .create_async()
            .await;

        let store = CouchConnector::new(&db_url(&server))
            .unwrap()
            .with_credentials(Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            })
            .connect()
            .await
            .unwrap();
        store.query_view("app", "by_name", 1).await.unwrap();

        session.assert_async().await;
        db.assert_async().await;
        view.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_login_is_a_connection_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/_session")
            .with_status(401)
            .with_body(r#"{"error":"unauthorized","reason":"Name or password is incorrect."}"#)
            .create_async()
            .await;

        let result = CouchConnector::new(&db_url(&server))
            .unwrap()
            .with_credentials(Credentials {
                username: "admin".to_string(),
                password: "wrong".to_string(),
            })
            .connect()
            .await;

        assert!(matches!(result, Err(SyncError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_missing_database_fails_connect() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/app")
            .with_status(404)
            .with_body(r#"{"error":"not_found","reason":"Database does not exist."}"#)
            .create_async()
            .await;

        let result = CouchConnector::new(&db_url(&server)).unwrap().connect().await;

        assert!(matches!(result, Err(SyncError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_keyed_fetch_pads_and_hides_missing_rows() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/app/_all_docs")
            .match_query(Matcher::UrlEncoded("include_docs".into(), "true".into()))
            .match_body(Matcher::Json(json!({"keys": ["a", "b", "c", "d"]})))
            .with_status(200)
            .with_body(
                r#"{"total_rows":2,"rows":[
                    {"id":"a","key":"a","value":{"rev":"1-x"},"doc":{"_id":"a","_rev":"1-x","n":1}},
                    {"key":"b","error":"not_found"},
                    {"id":"c","key":"c","value":{"rev":"2-y","deleted":true},"doc":null}
                ]}"#,
            )
            .create_async()
            .await;

        let keys: Vec<String> = ["a", "b", "c", "d"].iter().map(|k| k.to_string()).collect();
        let rows = client(&db_url(&server)).fetch(&keys).await.unwrap();

        assert_eq!(
            rows,
            vec![
                FetchRow::Found(json!({"_id": "a", "_rev": "1-x", "n": 1})),
                FetchRow::NotFound,
                FetchRow::NotFound,
                FetchRow::NotFound,
            ]
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_range_read_skips_deleted_rows() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/app/_all_docs")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("include_docs".into(), "true".into()),
                Matcher::UrlEncoded("startkey".into(), r#""_design/""#.into()),
                Matcher::UrlEncoded("endkey".into(), r#""_design0""#.into()),
                Matcher::UrlEncoded("inclusive_end".into(), "false".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"rows":[
                    {"id":"_design/app","key":"_design/app","value":{"rev":"3-z"},"doc":{"_id":"_design/app","_rev":"3-z"}},
                    {"id":"_design/old","key":"_design/old","value":{"rev":"2-q","deleted":true},"doc":null}
                ]}"#,
            )
            .create_async()
            .await;

        let rows = client(&db_url(&server))
            .all_docs_in_range("_design/", "_design0")
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "_design/app");
    }

    #[tokio::test]
    async fn test_non_success_status_maps_to_store_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/app/_design/app/_view/broken")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(r#"{"error":"compilation_error","reason":"Expression does not eval to a function."}"#)
            .create_async()
            .await;

        let err = client(&db_url(&server))
            .query_view("app", "broken", 1)
            .await
            .unwrap_err();

        assert!(
            matches!(&err, SyncError::StoreUnavailable(m) if m.contains("500") && m.contains("compilation_error")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_bulk_docs_streams_payload_file() {
        let mut server = mockito::Server::new_async().await;
        let payload = r#"{"docs":[{"_id":"a","n":1},{"_id":"b","_rev":"1-x","n":2}]}"#;
        let mock = server
            .mock("POST", "/app/_bulk_docs")
            .match_header("content-type", "application/json")
            .match_body(Matcher::JsonString(payload.to_string()))
            .with_status(201)
            .with_body(
                r#"[{"ok":true,"id":"a","rev":"1-a"},{"id":"b","error":"conflict","reason":"Document update conflict."}]"#,
            )
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch-0.json");
        std::fs::write(&path, payload).unwrap();

        let results = client(&db_url(&server)).bulk_docs(&path).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rev.as_deref(), Some("1-a"));
        assert_eq!(results[1].error.as_deref(), Some("conflict"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bulk_docs_failure_is_a_bulk_update_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/app/_bulk_docs")
            .with_status(413)
            .with_body(r#"{"error":"too_large","reason":"the request entity is too large"}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch-0.json");
        std::fs::write(&path, r#"{"docs":[]}"#).unwrap();

        let err = client(&db_url(&server)).bulk_docs(&path).await.unwrap_err();

        assert!(
            matches!(&err, SyncError::BulkUpdate(m) if m.contains("413") && m.contains("too_large")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_missing_payload_file_is_a_read_error() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let err = client(&db_url(&server))
            .bulk_docs(&dir.path().join("gone.json"))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::FileRead { .. }));
    }
}
