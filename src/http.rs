//! The proxy's HTTP surface: write and query endpoints, the admin surface,
//! and the data-movement operator endpoints.

use crate::config::FileConfig;
use backend::HttpClient;
use base64::Engine;
use data_types::{shard_key, BackendConfig};
use flate2::read::GzDecoder;
use hyper::{
    header::{CONTENT_ENCODING, CONTENT_TYPE},
    Body, Method, Request, Response, StatusCode,
};
use line_protocol::Precision;
use parking_lot::RwLock;
use proxy::Proxy;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, io::Read, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use transfer::{SourceNode, Transfer, DEFAULT_BATCH, DEFAULT_LIMIT, DEFAULT_WORKER};

/// Value of the X-Influxdb-Version header on every response.
pub const VERSION: &str = concat!("fluxgate-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
enum ApiError {
    #[error("method not allow")]
    MethodNotAllowed,

    #[error("authentication failed")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError::BadRequest(msg.into())
}

#[derive(Debug)]
pub struct HttpService {
    proxy: Arc<Proxy>,
    transfer: Arc<Transfer>,
    config: RwLock<Arc<FileConfig>>,
    config_path: PathBuf,
}

impl HttpService {
    pub fn new(
        proxy: Arc<Proxy>,
        transfer: Arc<Transfer>,
        config: Arc<FileConfig>,
        config_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            transfer,
            config: RwLock::new(config),
            config_path,
        })
    }

    /// Route one request; every response carries the version header.
    pub async fn route(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match (method, path.as_str()) {
            (_, "/ping") => Ok(respond_empty(StatusCode::NO_CONTENT)),
            (Method::POST, "/write") => self.guarded(req, Self::handle_write).await,
            (Method::GET | Method::POST, "/query") => self.guarded(req, Self::handle_query).await,
            (Method::GET, "/health") => self.guarded(req, Self::handle_health).await,
            (Method::GET, "/replica") => self.guarded(req, Self::handle_replica).await,
            (Method::GET | Method::POST, "/reload") => {
                self.guarded(req, Self::handle_reload).await
            }
            (Method::POST, "/rebalance") => self.guarded(req, Self::handle_rebalance).await,
            (Method::POST, "/recovery") => self.guarded(req, Self::handle_recovery).await,
            (Method::POST, "/resync") => self.guarded(req, Self::handle_resync).await,
            (Method::POST, "/cleanup") => self.guarded(req, Self::handle_cleanup).await,
            (Method::GET | Method::POST, "/transfer/state") => {
                self.guarded(req, Self::handle_transfer_state).await
            }
            (Method::GET, "/transfer/stats") => {
                self.guarded(req, Self::handle_transfer_stats).await
            }
            (
                _,
                "/write" | "/query" | "/health" | "/replica" | "/reload" | "/rebalance"
                | "/recovery" | "/resync" | "/cleanup" | "/transfer/state" | "/transfer/stats",
            ) => Err(ApiError::MethodNotAllowed),
            _ => Err(ApiError::NotFound),
        };

        match result {
            Ok(response) => response,
            Err(e) => respond_error(e.status(), &e.to_string()),
        }
    }

    async fn guarded<F, Fut>(
        self: Arc<Self>,
        req: Request<Body>,
        f: F,
    ) -> Result<Response<Body>, ApiError>
    where
        F: FnOnce(Arc<Self>, Request<Body>) -> Fut,
        Fut: std::future::Future<Output = Result<Response<Body>, ApiError>>,
    {
        if !self.check_auth(&req) {
            return Err(ApiError::Unauthorized);
        }
        f(self, req).await
    }

    /// Basic auth or `u`/`p` query parameters, compared against the
    /// configured credentials.
    fn check_auth(&self, req: &Request<Body>) -> bool {
        let cfg = Arc::clone(&*self.config.read());
        if cfg.username.is_empty() && cfg.password.is_empty() {
            return true;
        }

        let params = uri_params(req);
        if params.get("u").map(String::as_str) == Some(cfg.username.as_str())
            && params.get("p").map(String::as_str) == Some(cfg.password.as_str())
        {
            return true;
        }

        if let Some((user, pass)) = basic_credentials(req) {
            if user == cfg.username && pass == cfg.password {
                return true;
            }
        }
        false
    }

    async fn handle_write(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = uri_params(&req);

        let precision_param = params.get("precision").map(String::as_str).unwrap_or("");
        let precision = Precision::parse(precision_param).map_err(|_| {
            bad_request(format!(
                "invalid precision {precision_param:?} (use n, ns, u, ms, s, m or h)"
            ))
        })?;

        let db = params
            .get("db")
            .filter(|db| !db.is_empty())
            .cloned()
            .ok_or_else(|| bad_request("database not found"))?;
        if self.proxy.is_forbidden_db(&db) {
            return Err(bad_request(format!("database forbidden: {db}")));
        }
        let rp = params.get("rp").cloned().unwrap_or_default();

        let gzipped = req
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            == Some("gzip");
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| bad_request(e.to_string()))?;
        let payload = if gzipped {
            let mut decoded = Vec::new();
            GzDecoder::new(&body[..])
                .read_to_end(&mut decoded)
                .map_err(|_| bad_request("unable to decode gzip body"))?;
            decoded
        } else {
            body.to_vec()
        };

        self.proxy.write(&payload, &db, &rp, precision).await;
        if self.config.read().write_tracing {
            debug!(%db, %rp, ?precision, bytes = payload.len(), "write accepted");
        }
        Ok(respond_empty(StatusCode::NO_CONTENT))
    }

    async fn handle_query(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = all_params(req).await?;
        let q = params
            .get("q")
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| bad_request("empty query"))?;
        let db = params.get("db").cloned().unwrap_or_default();
        let epoch = params.get("epoch").cloned().unwrap_or_default();
        let pretty = params.get("pretty").map(String::as_str) == Some("true");

        match self.proxy.query(&q, &db, &epoch, pretty).await {
            Ok((status, body)) => {
                if self.config.read().query_tracing {
                    debug!(%db, %q, status, "query forwarded");
                }
                Ok(Response::builder()
                    .status(status)
                    .header("X-Influxdb-Version", VERSION)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap_or_else(|_| respond_empty(StatusCode::INTERNAL_SERVER_ERROR)))
            }
            Err(e) => {
                warn!(%db, %q, error = %e, "query error");
                Err(bad_request(e.to_string()))
            }
        }
    }

    async fn handle_health(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = uri_params(&req);
        let stats = params.get("stats").map(String::as_str) == Some("true");
        let pretty = params.get("pretty").map(String::as_str) == Some("true");
        let health = self.proxy.health(stats).await;
        Ok(respond_json(StatusCode::OK, &health, pretty))
    }

    async fn handle_replica(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = uri_params(&req);
        let (db, meas) = match (params.get("db"), params.get("meas")) {
            (Some(db), Some(meas)) if !db.is_empty() && !meas.is_empty() => (db, meas),
            _ => return Err(bad_request("invalid db or meas")),
        };

        let key = shard_key(db, meas);
        let replicas: Vec<Value> = self
            .proxy
            .circles()
            .iter()
            .filter_map(|circle| {
                circle.get_backend(&key).map(|be| {
                    json!({
                        "backend": { "name": be.name(), "url": be.url() },
                        "circle": { "id": circle.id(), "name": circle.name() },
                    })
                })
            })
            .collect();
        let pretty = params.get("pretty").map(String::as_str) == Some("true");
        Ok(respond_json(StatusCode::OK, &Value::Array(replicas), pretty))
    }

    async fn handle_reload(
        self: Arc<Self>,
        _req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let old = Arc::clone(&*self.config.read());
        let mut new = FileConfig::from_path(&self.config_path)
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        if new == *old {
            return Err(ApiError::Internal("config not changed".to_string()));
        }
        new.keep_runtime(&old);
        if new == *old {
            return Err(ApiError::Internal(
                "config changed, but ignored: listen_addr, idle_timeout, tls_cert, tls_key"
                    .to_string(),
            ));
        }

        info!("config reloading");
        self.proxy
            .reload(&new.proxy)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        self.transfer.reload(self.proxy.circles());
        *self.config.write() = Arc::new(new);
        info!("config reloaded");
        Ok(respond_text(StatusCode::OK, "config reloaded"))
    }

    async fn handle_rebalance(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = uri_params(&req);
        let circle_id = self.circle_id_param(&params, "circle_id")?;
        let operation = params.get("operation").cloned().unwrap_or_default();
        if operation != "add" && operation != "rm" {
            return Err(bad_request("invalid operation"));
        }

        let mut sources = Vec::new();
        if operation == "rm" {
            #[derive(Debug, Deserialize)]
            struct RmBody {
                backends: Vec<BackendConfig>,
            }
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(|e| bad_request(e.to_string()))?;
            let rm: RmBody = serde_json::from_slice(&body)
                .map_err(|_| bad_request("invalid backends from body"))?;
            let write_timeout = Duration::from_secs(self.config.read().proxy.write_timeout);
            for cfg in rm.backends {
                let client = HttpClient::new(&cfg, write_timeout)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                sources.push(SourceNode {
                    name: cfg.name,
                    url: cfg.url,
                    client: Arc::new(client),
                });
            }
        }
        let circle = self
            .proxy
            .circle(circle_id)
            .ok_or_else(|| bad_request("invalid circle_id"))?;
        sources.extend(circle.backends().iter().map(SourceNode::from));

        self.check_operator_admission(Some(circle_id))?;
        self.apply_operator_params(&params)?;
        let dbs = list_param(&params, "dbs");

        let transfer = Arc::clone(&self.transfer);
        tokio::spawn(async move {
            if let Err(e) = transfer.rebalance(circle_id, sources, dbs).await {
                error!(circle_id, error = %e, "rebalance failed");
            }
        });
        Ok(respond_text(StatusCode::ACCEPTED, "accepted"))
    }

    async fn handle_recovery(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = all_params(req).await?;
        let from_circle_id = self.circle_id_param(&params, "from_circle_id")?;
        let to_circle_id = self.circle_id_param(&params, "to_circle_id")?;
        if from_circle_id == to_circle_id {
            return Err(bad_request("from_circle_id and to_circle_id cannot be same"));
        }

        self.check_operator_admission(Some(from_circle_id))?;
        self.check_operator_admission(Some(to_circle_id))?;
        self.apply_operator_params(&params)?;
        let backend_urls = list_param(&params, "backend_urls");
        let dbs = list_param(&params, "dbs");

        let transfer = Arc::clone(&self.transfer);
        tokio::spawn(async move {
            if let Err(e) = transfer
                .recovery(from_circle_id, to_circle_id, backend_urls, dbs)
                .await
            {
                error!(from_circle_id, to_circle_id, error = %e, "recovery failed");
            }
        });
        Ok(respond_text(StatusCode::ACCEPTED, "accepted"))
    }

    async fn handle_resync(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = all_params(req).await?;
        let tick = match params.get("tick").map(String::as_str).unwrap_or("") {
            "" => 0,
            text => text
                .parse::<u64>()
                .map_err(|_| bad_request("invalid tick, require non-negative integer"))?,
        };

        self.check_operator_admission(None)?;
        self.apply_operator_params(&params)?;
        let dbs = list_param(&params, "dbs");

        let transfer = Arc::clone(&self.transfer);
        tokio::spawn(async move {
            if let Err(e) = transfer.resync(dbs, tick).await {
                error!(error = %e, "resync failed");
            }
        });
        Ok(respond_text(StatusCode::ACCEPTED, "accepted"))
    }

    async fn handle_cleanup(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = all_params(req).await?;
        let circle_id = self.circle_id_param(&params, "circle_id")?;

        self.check_operator_admission(Some(circle_id))?;
        self.apply_operator_params(&params)?;

        let transfer = Arc::clone(&self.transfer);
        tokio::spawn(async move {
            if let Err(e) = transfer.cleanup(circle_id).await {
                error!(circle_id, error = %e, "cleanup failed");
            }
        });
        Ok(respond_text(StatusCode::ACCEPTED, "accepted"))
    }

    async fn handle_transfer_state(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        if req.method() == Method::GET {
            return Ok(respond_json(StatusCode::OK, &self.transfer.state_doc(), false));
        }

        let params = all_params(req).await?;
        let mut state = serde_json::Map::new();

        if let Some(text) = params.get("resyncing") {
            let resyncing = text
                .parse::<bool>()
                .map_err(|_| bad_request("illegal resyncing"))?;
            self.transfer.set_resyncing(resyncing);
            state.insert("resyncing".to_string(), json!(resyncing));
        }
        if params.contains_key("circle_id") || params.contains_key("transferring") {
            let circle_id = self.circle_id_param(&params, "circle_id")?;
            let transferring = params
                .get("transferring")
                .and_then(|t| t.parse::<bool>().ok())
                .ok_or_else(|| bad_request("illegal transferring"))?;
            let cs = self
                .transfer
                .circle_state(circle_id)
                .ok_or_else(|| bad_request("invalid circle_id"))?;
            cs.set_transferring(transferring);
            state.insert(
                "circle".to_string(),
                json!({
                    "id": cs.circle_id,
                    "name": cs.name,
                    "transferring": cs.transferring(),
                }),
            );
        }
        if state.is_empty() {
            return Err(bad_request("missing query parameter"));
        }
        Ok(respond_json(StatusCode::OK, &Value::Object(state), false))
    }

    async fn handle_transfer_stats(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApiError> {
        let params = uri_params(&req);
        let circle_id = self.circle_id_param(&params, "circle_id")?;
        match params.get("type").map(String::as_str) {
            Some("rebalance" | "recovery" | "resync" | "cleanup") => {}
            _ => return Err(bad_request("invalid stats type")),
        }
        let cs = self
            .transfer
            .circle_state(circle_id)
            .ok_or_else(|| bad_request("invalid circle_id"))?;
        Ok(respond_json(StatusCode::OK, &cs.stats_snapshot(), false))
    }

    /// Pre-admission check with the operator-facing error messages; the
    /// operator re-checks atomically when it starts.
    fn check_operator_admission(&self, circle_id: Option<usize>) -> Result<(), ApiError> {
        if let Some(id) = circle_id {
            if let Some(cs) = self.transfer.circle_state(id) {
                if cs.transferring() {
                    return Err(bad_request(format!("circle {id} is transferring")));
                }
            }
        } else if self
            .transfer
            .circle_states()
            .iter()
            .any(|cs| cs.transferring())
        {
            return Err(bad_request("a circle is transferring"));
        }
        if self.transfer.resyncing() {
            return Err(bad_request("proxy is resyncing"));
        }
        Ok(())
    }

    /// `worker`, `batch`, `limit` and `ha_addrs`, with defaults.
    fn apply_operator_params(&self, params: &HashMap<String, String>) -> Result<(), ApiError> {
        let worker = positive_param(params, "worker", DEFAULT_WORKER)
            .map_err(|_| bad_request("invalid worker, require positive integer"))?;
        let batch = positive_param(params, "batch", DEFAULT_BATCH)
            .map_err(|_| bad_request("invalid batch, require positive integer"))?;
        let limit = match params.get("limit").map(String::as_str).unwrap_or("") {
            "" => DEFAULT_LIMIT,
            text => text
                .parse::<u64>()
                .map_err(|_| bad_request("invalid limit, require non-negative integer"))?,
        };
        self.transfer.set_params(worker, batch, limit);

        let ha_addrs = list_param(params, "ha_addrs");
        match ha_addrs.len() {
            0 => self.transfer.set_ha_addrs(Vec::new()),
            1 => {
                return Err(bad_request(
                    "invalid ha_addrs, require at least two addresses as <host:port>, comma-separated",
                ))
            }
            _ => {
                for addr in &ha_addrs {
                    if !valid_host_port(addr) {
                        return Err(bad_request(
                            "invalid ha_addrs, require at least two addresses as <host:port>, comma-separated",
                        ));
                    }
                }
                self.transfer.set_ha_addrs(ha_addrs);
            }
        }
        Ok(())
    }

    fn circle_id_param(
        &self,
        params: &HashMap<String, String>,
        key: &str,
    ) -> Result<usize, ApiError> {
        let id = params
            .get(key)
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| bad_request(format!("invalid {key}")))?;
        if id >= self.proxy.circles().len() {
            return Err(bad_request(format!("invalid {key}")));
        }
        Ok(id)
    }
}

fn positive_param(
    params: &HashMap<String, String>,
    key: &str,
    default: usize,
) -> Result<usize, ()> {
    match params.get(key).map(String::as_str).unwrap_or("") {
        "" => Ok(default),
        text => match text.parse::<usize>() {
            Ok(v) if v > 0 => Ok(v),
            _ => Err(()),
        },
    }
}

/// Comma-separated multi-value form field.
fn list_param(params: &HashMap<String, String>, key: &str) -> Vec<String> {
    params
        .get(key)
        .map(|text| {
            text.trim_matches(|c: char| c == ',' || c.is_whitespace())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn valid_host_port(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        && port.parse::<u16>().is_ok()
}

fn uri_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// URI query parameters merged with an urlencoded form body; query
/// parameters win on conflict.
async fn all_params(req: Request<Body>) -> Result<HashMap<String, String>, ApiError> {
    let mut params = uri_params(&req);
    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if is_form {
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| bad_request(e.to_string()))?;
        for (k, v) in url::form_urlencoded::parse(&body).into_owned() {
            params.entry(k).or_insert(v);
        }
    }
    Ok(params)
}

fn basic_credentials(req: &Request<Body>) -> Option<(String, String)> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn respond_empty(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
        .body(Body::empty())
        .expect("static response")
}

fn respond_text(status: StatusCode, text: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
        .body(Body::from(format!("{text}\n")))
        .expect("static response")
}

fn respond_json(status: StatusCode, value: &Value, pretty: bool) -> Response<Body> {
    let body = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response")
}

fn respond_error(status: StatusCode, message: &str) -> Response<Body> {
    // Header values may not carry control characters.
    let header_text: String = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    Response::builder()
        .status(status)
        .header("X-Influxdb-Version", VERSION)
        .header("X-Influxdb-Error", header_text)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "error": message }).to_string()))
        .unwrap_or_else(|_| respond_empty(status))
}
