#![allow(dead_code)]

use apexg_core::{Backend, BackendFailure, BackendRequest, BackendResponse};
use apexg_gateway::{Dispatcher, DispatcherOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted backend answer.
#[derive(Clone)]
pub enum Step {
    Reply(u16, &'static str),
    Fail(&'static str),
    /// Answers 200 after the delay.
    Slow(Duration),
    Panic,
}

/// Backend double: replays a script, then repeats the fallback step.
pub struct FakeBackend {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    calls: AtomicUsize,
    seen: Mutex<Vec<BackendRequest>>,
}

impl FakeBackend {
    pub fn new(fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Step::Reply(200, r#"{"ok":true}"#))
    }

    pub fn then(&self, step: Step) -> &Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock() = step;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn send(&self, req: BackendRequest) -> Result<BackendResponse, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(req);
        let step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.lock().clone());
        match step {
            Step::Reply(status, body) => Ok(BackendResponse::new(status, body)),
            Step::Fail(code) => Err(BackendFailure::new(code, "scripted failure")),
            Step::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(BackendResponse::new(200, "slow"))
            }
            Step::Panic => panic!("backend blew up"),
        }
    }
}

pub fn dispatcher(backend: Arc<FakeBackend>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(backend, DispatcherOptions::default()))
}
