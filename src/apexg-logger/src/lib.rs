use apexg_core::{MetricsSink, RequestLog};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub async fn send(client: &Client, endpoint: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
    client
        .post(endpoint)
        .json(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Forwards request logs to an HTTP collector from a background task.
///
/// `record` never waits on the network: logs go through a bounded queue
/// and are dropped (and counted) when the queue is full.
pub struct HttpLogSink {
    tx: mpsc::Sender<RequestLog>,
    dropped: AtomicU64,
}

impl HttpLogSink {
    /// Spawns the forwarding task. The task ends once the sink is dropped
    /// and the queue is drained.
    pub fn spawn(collector_url: &str, queue: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(queue.max(1));
        let url = collector_url.to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        let handle = tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                let payload = match serde_json::to_value(&log) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "request log not serializable");
                        continue;
                    }
                };
                match send(&client, &url, &payload).await {
                    Ok(()) => debug!(request_id = %log.request_id, "log sent"),
                    Err(e) => warn!(error = %e, collector = %url, "failed to ship request log"),
                }
            }
        });
        (Self { tx, dropped: AtomicU64::new(0) }, handle)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsSink for HttpLogSink {
    fn record(&self, log: &RequestLog) {
        if self.tx.try_send(log.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    fn log(id: &str) -> RequestLog {
        RequestLog {
            request_id: id.to_string(),
            timestamp: chrono::Utc::now(),
            endpoint_id: "ep_001".into(),
            method: "GET".into(),
            path: "/api/user/profile".into(),
            status: 200,
            duration_ms: 12,
            caller_id: "127.0.0.1".into(),
            service_id: Some("user_service".into()),
        }
    }

    /// One-connection collector that forwards every posted body.
    async fn collector() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let tx = tx.clone();
                        async move {
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            tx.send(serde_json::from_slice(&body).unwrap()).unwrap();
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                        }
                    });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await;
                });
            }
        });
        (format!("http://{}/logs", addr), rx)
    }

    #[tokio::test]
    async fn ships_logs_as_json() {
        let (url, mut rx) = collector().await;
        let (sink, handle) = HttpLogSink::spawn(&url, 16);
        sink.record(&log("req-1"));
        sink.record(&log("req-2"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first["requestId"], "req-1");
        assert_eq!(second["requestId"], "req-2");
        assert_eq!(first["endpointId"], "ep_001");
        assert_eq!(first["durationMs"], 12);

        drop(sink);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        // nothing listens here, the worker is slow to fail
        let (sink, _handle) = HttpLogSink::spawn("http://127.0.0.1:9/logs", 1);
        for i in 0..10 {
            sink.record(&log(&format!("req-{}", i)));
        }
        assert!(sink.dropped() >= 8);
    }
}
