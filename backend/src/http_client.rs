//! HTTP client for one backend node.
//!
//! The client is stateless: liveness and buffering live on [`Backend`].
//! Write responses collapse into a four-valued [`WriteOutcome`] because the
//! write path only ever needs one decision: deliverable now, never
//! deliverable (drop), or retry later through the overflow queue.
//!
//! [`Backend`]: crate::Backend

use bytes::Bytes;
use data_types::BackendConfig;
use reqwest::{header::CONTENT_ENCODING, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from the query-shaped client surface. The write path never
/// returns these; it classifies into [`WriteOutcome`] instead.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to backend failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unable to decode query result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Classification of a write attempt.
///
/// `BadRequest` and `NotFound` are terminal: retrying can only duplicate
/// data or loop forever, so the batch must be dropped. `Transient` covers
/// network errors, timeouts and every other status; those batches go to the
/// overflow queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    BadRequest,
    NotFound,
    Transient,
}

impl WriteOutcome {
    /// True when the batch must be dropped rather than retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BadRequest | Self::NotFound)
    }
}

/// One series of an InfluxQL JSON result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResults {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(cfg: &BackendConfig, write_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(write_timeout).build()?;
        Ok(Self {
            url: cfg.url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a gzip-compressed line-protocol batch.
    pub async fn write_compressed(&self, db: &str, rp: &str, payload: Vec<u8>) -> WriteOutcome {
        let mut req = self
            .client
            .post(format!("{}/write", self.url))
            .query(&[("db", db)]);
        if !rp.is_empty() {
            req = req.query(&[("rp", rp)]);
        }
        req = self
            .with_auth(req)
            .header(CONTENT_ENCODING, "gzip")
            .body(payload);

        match req.send().await {
            Ok(resp) => match resp.status() {
                StatusCode::NO_CONTENT => WriteOutcome::Accepted,
                StatusCode::BAD_REQUEST => WriteOutcome::BadRequest,
                StatusCode::NOT_FOUND => WriteOutcome::NotFound,
                status => {
                    debug!(url = %self.url, %status, "write classified transient");
                    WriteOutcome::Transient
                }
            },
            Err(e) => {
                debug!(url = %self.url, error = %e, "write request failed");
                WriteOutcome::Transient
            }
        }
    }

    /// Liveness probe for the active flag.
    pub async fn ping(&self) -> bool {
        match self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Forward a query verbatim, returning the backend's status and body.
    pub async fn query_raw(
        &self,
        q: &str,
        db: &str,
        epoch: &str,
        pretty: bool,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let mut params = vec![("q", q.to_string())];
        if !db.is_empty() {
            params.push(("db", db.to_string()));
        }
        if !epoch.is_empty() {
            params.push(("epoch", epoch.to_string()));
        }
        if pretty {
            params.push(("pretty", "true".to_string()));
        }
        let req = self
            .with_auth(self.client.post(format!("{}/query", self.url)))
            .form(&params);
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Ok((status, body))
    }

    pub async fn show_databases(&self) -> Result<Vec<String>, ClientError> {
        Ok(first_column(self.query_json("show databases", "").await?))
    }

    pub async fn show_measurements(&self, db: &str) -> Result<Vec<String>, ClientError> {
        Ok(first_column(self.query_json("show measurements", db).await?))
    }

    pub async fn show_tag_keys(&self, db: &str, meas: &str) -> Result<Vec<String>, ClientError> {
        let q = format!("show tag keys from \"{meas}\"");
        Ok(first_column(self.query_json(&q, db).await?))
    }

    /// Field keys with their types (`float`, `integer`, `string`, `boolean`).
    pub async fn show_field_keys(
        &self,
        db: &str,
        meas: &str,
    ) -> Result<Vec<(String, String)>, ClientError> {
        let q = format!("show field keys from \"{meas}\"");
        let mut fields = Vec::new();
        for series in self.query_json(&q, db).await? {
            for row in series.values {
                if let (Some(key), Some(typ)) = (
                    row.first().and_then(|v| v.as_str()),
                    row.get(1).and_then(|v| v.as_str()),
                ) {
                    fields.push((key.to_string(), typ.to_string()));
                }
            }
        }
        Ok(fields)
    }

    /// Run a SELECT and return its first series, if any. Timestamps come
    /// back as nanosecond integers.
    pub async fn fetch_series(&self, db: &str, q: &str) -> Result<Option<Series>, ClientError> {
        Ok(self.query_json(q, db).await?.into_iter().next())
    }

    pub async fn drop_measurement(&self, db: &str, meas: &str) -> Result<(), ClientError> {
        let q = format!("drop measurement \"{meas}\"");
        self.query_json(&q, db).await.map(|_| ())
    }

    async fn query_json(&self, q: &str, db: &str) -> Result<Vec<Series>, ClientError> {
        let (status, body) = self.query_raw(q, db, "ns", false).await?;
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let results: QueryResults = serde_json::from_slice(&body)?;
        let mut series = Vec::new();
        for statement in results.results {
            if let Some(error) = statement.error {
                return Err(ClientError::Http {
                    status: status.as_u16(),
                    body: error,
                });
            }
            series.extend(statement.series);
        }
        Ok(series)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() && self.password.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }
}

fn first_column(series: Vec<Series>) -> Vec<String> {
    series
        .into_iter()
        .flat_map(|s| s.values)
        .filter_map(|row| row.into_iter().next())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(url: &str) -> HttpClient {
        HttpClient::new(
            &BackendConfig {
                name: "b0".to_string(),
                url: url.to_string(),
                username: String::new(),
                password: String::new(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_statuses_classify() {
        let mut server = mockito::Server::new_async().await;
        let client = client_for(&server.url());

        for (status, want) in [
            (204, WriteOutcome::Accepted),
            (400, WriteOutcome::BadRequest),
            (404, WriteOutcome::NotFound),
            (500, WriteOutcome::Transient),
            (503, WriteOutcome::Transient),
        ] {
            let mock = server
                .mock("POST", "/write")
                .match_query(mockito::Matcher::UrlEncoded("db".into(), "db1".into()))
                .with_status(status)
                .create_async()
                .await;

            let got = client.write_compressed("db1", "", b"x".to_vec()).await;
            assert_eq!(got, want, "status {status}");
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        // Nothing listens here.
        let client = client_for("http://127.0.0.1:1");
        let got = client.write_compressed("db1", "", b"x".to_vec()).await;
        assert_eq!(got, WriteOutcome::Transient);
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn show_measurements_parses_series() {
        let mut server = mockito::Server::new_async().await;
        let client = client_for(&server.url());

        let body = r#"{"results":[{"statement_id":0,"series":[{"name":"measurements","columns":["name"],"values":[["cpu"],["mem"]]}]}]}"#;
        let _mock = server
            .mock("POST", "/query")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let got = client.show_measurements("db1").await.unwrap();
        assert_eq!(got, vec!["cpu".to_string(), "mem".to_string()]);
    }

    #[tokio::test]
    async fn statement_error_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let client = client_for(&server.url());

        let body = r#"{"results":[{"statement_id":0,"error":"database not found"}]}"#;
        let _mock = server
            .mock("POST", "/query")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let err = client.show_measurements("nope").await.unwrap_err();
        assert!(matches!(err, ClientError::Http { .. }));
    }
}
