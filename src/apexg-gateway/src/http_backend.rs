use apexg_core::{Backend, BackendFailure, BackendRequest, BackendResponse, ECONNREFUSED, ECONNRESET};
use async_trait::async_trait;
use std::time::Duration;

/// reqwest transport for backend calls and health probes.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(err: &reqwest::Error, timeout: Duration) -> BackendFailure {
    if err.is_timeout() {
        BackendFailure::timeout(timeout)
    } else if err.is_connect() {
        BackendFailure::new(ECONNREFUSED, err.to_string())
    } else {
        BackendFailure::new(ECONNRESET, err.to_string())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, req: BackendRequest) -> Result<BackendResponse, BackendFailure> {
        let timeout = req.timeout;
        let resp = self
            .client
            .request(req.method, &req.url)
            .headers(req.headers)
            .body(req.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&e, timeout))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| classify(&e, timeout))?;
        Ok(BackendResponse { status, headers, body })
    }
}
