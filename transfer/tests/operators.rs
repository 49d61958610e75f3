//! Operator tests against a scripted in-process InfluxDB stand-in:
//! rebalance streams misplaced measurements to the new ring owner and
//! deletes them from the source, cleanup is idempotent, and the admission
//! flags are mutually exclusive.

use data_types::{BackendConfig, CircleConfig, ProxyConfig};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use proxy::Proxy;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    convert::Infallible,
    io::Read,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use transfer::{SourceNode, Transfer, TransferError};

/// A minimal InfluxDB 1.x stand-in: answers SHOW/SELECT/DROP over /query
/// from an in-memory measurement table and records deliveries to /write.
#[derive(Debug, Default)]
struct FakeInflux {
    /// db -> measurement -> rows of (time, host, value).
    data: Mutex<HashMap<String, HashMap<String, Vec<(i64, String, f64)>>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    drops: Mutex<Vec<(String, String)>>,
}

impl FakeInflux {
    fn seed(&self, db: &str, meas: &str, rows: Vec<(i64, String, f64)>) {
        self.data
            .lock()
            .unwrap()
            .entry(db.to_string())
            .or_default()
            .insert(meas.to_string(), rows);
    }

    fn write_lines(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .flat_map(|body| {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(&body[..])
                    .read_to_end(&mut out)
                    .unwrap();
                String::from_utf8(out)
                    .unwrap()
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn dropped(&self) -> Vec<(String, String)> {
        self.drops.lock().unwrap().clone()
    }

    fn measurements(&self, db: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .get(db)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn handle_query(&self, q: &str, db: &str) -> Value {
        let lower = q.to_ascii_lowercase();
        if lower.starts_with("show databases") {
            let names: Vec<Value> = self
                .data
                .lock()
                .unwrap()
                .keys()
                .map(|db| json!([db]))
                .collect();
            return series_doc("databases", vec!["name"], names);
        }
        if lower.starts_with("show measurements") {
            let values: Vec<Value> = self.measurements(db).into_iter().map(|m| json!([m])).collect();
            return series_doc("measurements", vec!["name"], values);
        }
        if lower.starts_with("show tag keys") {
            return series_doc(quoted(q).as_str(), vec!["tagKey"], vec![json!(["host"])]);
        }
        if lower.starts_with("show field keys") {
            return series_doc(
                quoted(q).as_str(),
                vec!["fieldKey", "fieldType"],
                vec![json!(["v", "float"])],
            );
        }
        if lower.starts_with("drop measurement") {
            let meas = quoted(q);
            if let Some(measurements) = self.data.lock().unwrap().get_mut(db) {
                measurements.remove(&meas);
            }
            self.drops.lock().unwrap().push((db.to_string(), meas));
            return json!({ "results": [{ "statement_id": 0 }] });
        }
        if lower.starts_with("select") {
            let meas = quoted(q);
            let limit = number_after(&lower, "limit").unwrap_or(usize::MAX);
            let offset = number_after(&lower, "offset").unwrap_or(0);
            let rows = self
                .data
                .lock()
                .unwrap()
                .get(db)
                .and_then(|m| m.get(&meas))
                .cloned()
                .unwrap_or_default();
            let page: Vec<Value> = rows
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|(t, host, v)| json!([t, host, v]))
                .collect();
            if page.is_empty() {
                return json!({ "results": [{ "statement_id": 0 }] });
            }
            return series_doc(&meas, vec!["time", "host", "v"], page);
        }
        json!({ "results": [{ "statement_id": 0, "error": "unhandled query" }] })
    }
}

fn series_doc(name: &str, columns: Vec<&str>, values: Vec<Value>) -> Value {
    json!({
        "results": [{
            "statement_id": 0,
            "series": [{ "name": name, "columns": columns, "values": values }],
        }]
    })
}

/// First double-quoted token of a statement.
fn quoted(q: &str) -> String {
    q.split('"').nth(1).unwrap_or_default().to_string()
}

fn number_after(q: &str, keyword: &str) -> Option<usize> {
    let mut tokens = q.split_whitespace();
    while let Some(t) = tokens.next() {
        if t == keyword {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

/// Decode an application/x-www-form-urlencoded body.
fn form_fields(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn start_fake(fake: Arc<FakeInflux>) -> SocketAddr {
    let make = make_service_fn(move |_| {
        let fake = Arc::clone(&fake);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&fake), req)))
        }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

async fn handle(
    fake: Arc<FakeInflux>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/ping" => Ok(Response::builder().status(204).body(Body::empty()).unwrap()),
        "/write" => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap().to_vec();
            fake.writes.lock().unwrap().push(body);
            Ok(Response::builder().status(204).body(Body::empty()).unwrap())
        }
        "/query" => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            let fields = form_fields(std::str::from_utf8(&body).unwrap_or_default());
            let q = fields.get("q").cloned().unwrap_or_default();
            let db = fields.get("db").cloned().unwrap_or_default();
            let doc = fake.handle_query(&q, &db);
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(Body::from(doc.to_string()))
                .unwrap())
        }
        _ => Ok(Response::builder().status(404).body(Body::empty()).unwrap()),
    }
}

fn proxy_config(data_dir: &std::path::Path, backends: Vec<BackendConfig>) -> ProxyConfig {
    ProxyConfig {
        circles: vec![CircleConfig {
            name: "c0".to_string(),
            backends,
        }],
        dbs: vec![],
        data_dir: data_dir.to_string_lossy().into_owned(),
        flush_size: 1,
        flush_time: 3600,
        check_interval: 3600,
        rewrite_interval: 3600,
        conn_pool_size: 4,
        write_timeout: 5,
    }
}

fn backend_config(name: &str, addr: SocketAddr) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        url: format!("http://{addr}"),
        username: String::new(),
        password: String::new(),
    }
}

#[tokio::test]
async fn rebalance_moves_only_reassigned_measurements() {
    let dir = tempfile::tempdir().unwrap();

    let mut fakes: HashMap<String, Arc<FakeInflux>> = HashMap::new();
    let mut backend_cfgs = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let fake = Arc::new(FakeInflux::default());
        let addr = start_fake(Arc::clone(&fake)).await;
        let cfg = backend_config(name, addr);
        fakes.insert(cfg.url.clone(), fake);
        backend_cfgs.push(cfg);
    }

    // The pre-expansion topology: a, b, c.
    let three = proxy_config(dir.path(), backend_cfgs[..3].to_vec());
    let proxy_three = Proxy::open(&three).await.unwrap();
    let circle_three = proxy_three.circle(0).unwrap();

    // Seed every measurement on its ring owner in the three-node layout.
    for i in 0..30 {
        let meas = format!("m{i}");
        let owner = circle_three
            .get_backend(&data_types::shard_key("db1", &meas))
            .unwrap()
            .url()
            .to_string();
        fakes[&owner].seed(
            "db1",
            &meas,
            vec![(1_000, "h1".to_string(), 1.0), (2_000, "h2".to_string(), 2.0)],
        );
    }
    proxy_three.close().await;

    // Expand to four nodes and rebalance.
    let four = proxy_config(dir.path(), backend_cfgs.clone());
    let proxy_four = Proxy::open(&four).await.unwrap();
    let circle_four = proxy_four.circle(0).unwrap();
    let tx = Transfer::new(proxy_four.circles());
    tx.set_params(2, 10, 0);

    let sources: Vec<SourceNode> = circle_four.backends().iter().map(SourceNode::from).collect();
    tx.rebalance(0, sources, vec!["db1".to_string()])
        .await
        .unwrap();

    let d_url = backend_cfgs[3].url.clone();
    let mut moved = 0;
    for i in 0..30 {
        let meas = format!("m{i}");
        let key = data_types::shard_key("db1", &meas);
        let old_owner = circle_three.get_backend(&key).unwrap().url().to_string();
        let new_owner = circle_four.get_backend(&key).unwrap().url().to_string();

        if new_owner == old_owner {
            // Untouched: still on its holder, never dropped, never copied.
            assert!(fakes[&old_owner].measurements("db1").contains(&meas));
            assert!(!fakes[&old_owner]
                .dropped()
                .contains(&("db1".to_string(), meas.clone())));
        } else {
            // Only the new node gains measurements in an expansion.
            assert_eq!(new_owner, d_url, "{meas} moved sideways");
            moved += 1;
            assert!(
                !fakes[&old_owner].measurements("db1").contains(&meas),
                "{meas} not deleted from {old_owner}"
            );
            let lines = fakes[&new_owner].write_lines();
            assert!(
                lines.iter().any(|l| l.starts_with(&format!("{meas},host=h1 "))),
                "{meas} rows not delivered to {new_owner}"
            );
        }
    }
    assert!(moved > 0, "expansion moved nothing");

    // Transfer stats recorded the moves.
    let stats = tx.circle_state(0).unwrap().stats_snapshot();
    let total_transferred: u64 = stats
        .as_object()
        .unwrap()
        .values()
        .map(|v| v["transferred"].as_u64().unwrap_or(0))
        .sum();
    assert_eq!(total_transferred, moved);

    proxy_four.close().await;
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();

    let mut fakes: HashMap<String, Arc<FakeInflux>> = HashMap::new();
    let mut backend_cfgs = Vec::new();
    for name in ["a", "b"] {
        let fake = Arc::new(FakeInflux::default());
        let addr = start_fake(Arc::clone(&fake)).await;
        let cfg = backend_config(name, addr);
        fakes.insert(cfg.url.clone(), fake);
        backend_cfgs.push(cfg);
    }

    let cfg = proxy_config(dir.path(), backend_cfgs.clone());
    let proxy = Proxy::open(&cfg).await.unwrap();
    let circle = proxy.circle(0).unwrap();

    // Put every measurement on backend a, regardless of ring placement.
    let a_url = backend_cfgs[0].url.clone();
    let mut misplaced = 0;
    for i in 0..20 {
        let meas = format!("m{i}");
        fakes[&a_url].seed("db1", &meas, vec![(1_000, "h1".to_string(), 1.0)]);
        if circle
            .get_backend(&data_types::shard_key("db1", &meas))
            .unwrap()
            .url()
            != a_url
        {
            misplaced += 1;
        }
    }
    assert!(misplaced > 0, "hash layout left nothing misplaced");

    let tx = Transfer::new(proxy.circles());
    tx.cleanup(0).await.unwrap();
    assert_eq!(fakes[&a_url].dropped().len(), misplaced);
    assert_eq!(
        fakes[&a_url].measurements("db1").len(),
        20 - misplaced,
        "only misplaced measurements removed"
    );

    // A second pass finds nothing left to remove.
    tx.cleanup(0).await.unwrap();
    assert_eq!(fakes[&a_url].dropped().len(), misplaced);

    proxy.close().await;
}

#[tokio::test]
async fn operator_slots_are_mutually_exclusive() {
    let dir = tempfile::tempdir().unwrap();

    // Backends never contacted; dead addresses are fine.
    let dead = |name: &str| BackendConfig {
        name: name.to_string(),
        url: "http://127.0.0.1:1".to_string(),
        username: String::new(),
        password: String::new(),
    };
    let cfg = ProxyConfig {
        circles: vec![
            CircleConfig {
                name: "c0".to_string(),
                backends: vec![dead("a")],
            },
            CircleConfig {
                name: "c1".to_string(),
                backends: vec![dead("b")],
            },
        ],
        dbs: vec![],
        data_dir: dir.path().to_string_lossy().into_owned(),
        flush_size: 1,
        flush_time: 3600,
        check_interval: 3600,
        rewrite_interval: 3600,
        conn_pool_size: 1,
        write_timeout: 1,
    };
    let proxy = Proxy::open(&cfg).await.unwrap();
    let tx = Transfer::new(proxy.circles());

    assert!(tx.begin_circle_op(0).is_ok());
    assert!(matches!(
        tx.begin_circle_op(0),
        Err(TransferError::CircleBusy(0))
    ));
    // Another circle is unaffected.
    assert!(tx.begin_circle_op(1).is_ok());
    // Resync is refused while any circle transfers.
    assert!(matches!(
        tx.begin_resync(),
        Err(TransferError::CircleBusy(_))
    ));

    tx.end_circle_op(0);
    tx.end_circle_op(1);

    assert!(tx.begin_resync().is_ok());
    // Circle operators are refused while resyncing.
    assert!(matches!(
        tx.begin_circle_op(0),
        Err(TransferError::Resyncing)
    ));
    assert!(matches!(tx.begin_resync(), Err(TransferError::Resyncing)));

    tx.end_resync();
    assert!(tx.begin_circle_op(0).is_ok());
    tx.end_circle_op(0);

    assert!(matches!(
        tx.begin_circle_op(9),
        Err(TransferError::InvalidCircle(9))
    ));

    proxy.close().await;
}
