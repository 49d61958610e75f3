//! Write fan-out across replica groups and reload accounting.

use data_types::{BackendConfig, CircleConfig, ProxyConfig};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server,
};
use line_protocol::Precision;
use proxy::Proxy;
use std::{
    collections::HashMap,
    convert::Infallible,
    io::Read,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Debug, Default)]
struct CaptureServer {
    writes: Mutex<Vec<Vec<u8>>>,
}

impl CaptureServer {
    fn lines(&self) -> Vec<String> {
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
}

async fn start_capture() -> (SocketAddr, Arc<CaptureServer>) {
    let capture = Arc::new(CaptureServer::default());
    let inner = Arc::clone(&capture);
    let make = make_service_fn(move |_| {
        let capture = Arc::clone(&inner);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&capture), req)))
        }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    (addr, capture)
}

async fn handle(
    capture: Arc<CaptureServer>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::POST && req.uri().path() == "/write" {
        let body = hyper::body::to_bytes(req.into_body()).await.unwrap().to_vec();
        capture.writes.lock().unwrap().push(body);
    }
    Ok(Response::builder().status(204).body(Body::empty()).unwrap())
}

fn proxy_config(data_dir: &std::path::Path, circles: Vec<CircleConfig>) -> ProxyConfig {
    ProxyConfig {
        circles,
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

async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn write_fans_out_to_the_owner_in_every_circle() {
    let dir = tempfile::tempdir().unwrap();
    let mut captures = HashMap::new();
    let mut circles = Vec::new();
    for (circle_name, names) in [("c0", ["a", "b"]), ("c1", ["c", "d"])] {
        let mut backends = Vec::new();
        for name in names {
            let (addr, capture) = start_capture().await;
            let cfg = backend_config(name, addr);
            captures.insert(cfg.url.clone(), capture);
            backends.push(cfg);
        }
        circles.push(CircleConfig {
            name: circle_name.to_string(),
            backends,
        });
    }

    let proxy = Proxy::open(&proxy_config(dir.path(), circles)).await.unwrap();

    proxy
        .write(b"cpu,host=h1 v=1 1000000000\n", "db1", "", Precision::Nanoseconds)
        .await;

    let total = {
        let captures = captures.clone();
        move || {
            captures
                .values()
                .map(|c| c.lines().len())
                .sum::<usize>()
        }
    };
    eventually(|| total() == 2, "one delivery per circle").await;

    // Exactly the ring owner of each circle received the line.
    let owners: Vec<String> = proxy
        .get_backends("db1,cpu")
        .iter()
        .map(|b| b.url().to_string())
        .collect();
    assert_eq!(owners.len(), 2);
    for (url, capture) in &captures {
        let lines = capture.lines();
        if owners.contains(url) {
            assert_eq!(lines, vec!["cpu,host=h1 v=1 1000000000".to_string()]);
        } else {
            assert!(lines.is_empty(), "{url} should not have been written");
        }
    }

    proxy.close().await;
}

#[tokio::test]
async fn reload_under_writes_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (addr_a, capture_a) = start_capture().await;
    let (addr_b, capture_b) = start_capture().await;

    let one = proxy_config(
        dir.path(),
        vec![CircleConfig {
            name: "c0".to_string(),
            backends: vec![backend_config("a", addr_a)],
        }],
    );
    let two = proxy_config(
        dir.path(),
        vec![CircleConfig {
            name: "c0".to_string(),
            backends: vec![backend_config("a", addr_a), backend_config("b", addr_b)],
        }],
    );

    let proxy = Proxy::open(&one).await.unwrap();

    for i in 0..100 {
        let line = format!("cpu,host=h{i} v={i} {}\n", 1_000_000_000 + i);
        proxy.write(line.as_bytes(), "db1", "", Precision::Nanoseconds).await;
    }
    proxy.reload(&two).await.unwrap();
    for i in 100..200 {
        let line = format!("cpu,host=h{i} v={i} {}\n", 1_000_000_000 + i);
        proxy.write(line.as_bytes(), "db1", "", Precision::Nanoseconds).await;
    }
    proxy.close().await;

    // Both generations drain; every accepted line lands exactly once.
    eventually(
        || capture_a.lines().len() + capture_b.lines().len() == 200,
        "all lines delivered across old and new topology",
    )
    .await;

    let mut all: Vec<String> = capture_a.lines();
    all.extend(capture_b.lines());
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 200, "no duplicates and no loss");
}
