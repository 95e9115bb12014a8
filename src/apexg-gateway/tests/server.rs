use apexg_core::{CachePolicy, Endpoint, HttpMethod, RateLimitPolicy, Service};
use apexg_gateway::{Dispatcher, DispatcherOptions, Gateway, HttpBackend, ServerSettings};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;

/// Upstream that echoes the path it was asked for.
async fn upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let hits = hits.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let body = format!(r#"{{"path":"{}"}}"#, req.uri().path());
                        let mut resp = Response::new(Full::new(Bytes::from(body)));
                        resp.headers_mut().insert("content-type", "application/json".parse().unwrap());
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await;
            });
        }
    });
    addr
}

async fn gateway(upstream: SocketAddr) -> SocketAddr {
    let dispatcher = Dispatcher::new(Arc::new(HttpBackend::new().unwrap()), DispatcherOptions::default());
    dispatcher.register_service(Service::new("user_service", &format!("http://{}", upstream)));
    let mut ep = Endpoint::new(HttpMethod::GET, "/api/user/:id", "user_service");
    ep.target_path = "/users/:id".into();
    ep.rate_limit = RateLimitPolicy::fixed(3, 60);
    ep.caching = CachePolicy { enabled: true, ttl_secs: 300 };
    dispatcher.register_endpoint(ep).await;

    let gw = Arc::new(Gateway::new(Arc::new(dispatcher), ServerSettings::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gw.serve_listener(listener));
    addr
}

#[tokio::test]
async fn proxies_over_loopback() {
    let hits = Arc::new(AtomicUsize::new(0));
    let up = upstream(hits.clone()).await;
    let gw = gateway(up).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/api/user/7", gw);

    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-cache"], "MISS");
    assert_eq!(first.headers()["via"], "ApexG");
    assert!(first.headers().contains_key("x-request-id"));
    assert!(first.headers().contains_key("x-latency"));
    assert_eq!(first.headers()["x-ratelimit-limit"], "3");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "2");
    let body: serde_json::Value = first.json().await.unwrap();
    assert_eq!(body["path"], "/users/7");

    let second = client.get(&url).send().await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    client.get(&url).send().await.unwrap();
    let limited = client.get(&url).send().await.unwrap();
    assert_eq!(limited.status(), 429);
    assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");
    assert!(limited.headers().contains_key("x-ratelimit-reset"));
    let body: serde_json::Value = limited.json().await.unwrap();
    assert_eq!(body["error"], "rate limit exceeded");
    assert!(body["requestId"].is_string());

    let missing = client.get(format!("http://{}/nope", gw)).send().await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn admin_routes() {
    let up = upstream(Arc::new(AtomicUsize::new(0))).await;
    let gw = gateway(up).await;
    let client = reqwest::Client::new();
    client.get(format!("http://{}/api/user/1", gw)).send().await.unwrap();

    let stats: serde_json::Value = client
        .get(format!("http://{}/_gateway/stats?range=15m", gw))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["totalRequests"], 1);
    assert_eq!(stats["successCount"], 1);

    let health: serde_json::Value = client
        .get(format!("http://{}/_gateway/health", gw))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["overall"], "healthy");
    assert_eq!(health["services"]["user_service"]["breakerState"], "closed");

    let endpoints: serde_json::Value = client
        .get(format!("http://{}/_gateway/endpoints", gw))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(endpoints[0]["path"], "/api/user/:id");

    let unknown = client.get(format!("http://{}/_gateway/nope", gw)).send().await.unwrap();
    assert_eq!(unknown.status(), 404);
}
