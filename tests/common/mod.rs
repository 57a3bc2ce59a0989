#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use roster_sync::db::{self, Pool};
use roster_sync::gateway::{
    GatewayError, Page, PageRequest, PushOutcome, PushRequest, RemoteGateway,
};
use roster_sync::session::Session;
use roster_sync::sync::{SyncEngine, SyncLocks, SyncPhase};

pub const DB: &str = "ward-7";

/// Scripted gateway: hands out queued responses in order and records every
/// request. An exhausted page queue yields an empty final page; an exhausted
/// push queue acknowledges every change.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    pages: Arc<Mutex<VecDeque<Result<Page, GatewayError>>>>,
    pushes: Arc<Mutex<VecDeque<Result<PushOutcome, GatewayError>>>>,
    fetch_calls: Arc<Mutex<Vec<PageRequest>>>,
    push_calls: Arc<Mutex<Vec<PushRequest>>>,
    locks: Option<SyncLocks>,
    phases: Arc<Mutex<Vec<SyncPhase>>>,
}

impl RecordingGateway {
    pub fn with_pages(pages: Vec<Result<Page, GatewayError>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(VecDeque::from(pages))),
            ..Default::default()
        }
    }

    pub fn with_pushes(pushes: Vec<Result<PushOutcome, GatewayError>>) -> Self {
        Self {
            pushes: Arc::new(Mutex::new(VecDeque::from(pushes))),
            ..Default::default()
        }
    }

    /// Record the database's sync phase as seen from inside each fetch.
    pub fn watching(mut self, locks: SyncLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub async fn phases_seen(&self) -> Vec<SyncPhase> {
        self.phases.lock().await.clone()
    }

    pub async fn script_pages(&self, pages: Vec<Result<Page, GatewayError>>) {
        self.pages.lock().await.extend(pages);
    }

    pub async fn fetch_calls(&self) -> Vec<PageRequest> {
        self.fetch_calls.lock().await.clone()
    }

    pub async fn push_calls(&self) -> Vec<PushRequest> {
        self.push_calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RemoteGateway for RecordingGateway {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, GatewayError> {
        self.fetch_calls.lock().await.push(request.clone());
        if let Some(locks) = &self.locks {
            self.phases.lock().await.push(locks.phase(&request.database_id));
        }
        self.pages
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Page::default()))
    }

    async fn push_changes(&self, request: &PushRequest) -> Result<PushOutcome, GatewayError> {
        self.push_calls.lock().await.push(request.clone());
        let scripted = self.pushes.lock().await.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PushOutcome {
                accepted_ids: request.changes.iter().map(|c| c.id.clone()).collect(),
                rejected: vec![],
            })
        })
    }
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .unwrap()
        .with_timezone(&Utc)
}

pub fn row(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("row must be a JSON object")
}

pub fn page(items: Vec<Value>, has_more: bool, server_time: Option<&str>) -> Page {
    Page {
        items: items.into_iter().map(row).collect(),
        has_more,
        server_time: server_time.map(ts),
    }
}

pub fn server_error() -> GatewayError {
    GatewayError::Status {
        status: 503,
        body: "unavailable".into(),
    }
}

pub async fn engine(gateway: &RecordingGateway) -> (Pool, SyncEngine) {
    let pool = db::open_in_memory().await.unwrap();
    let engine = SyncEngine::new(pool.clone(), Arc::new(gateway.clone()), Session::new(DB))
        .with_page_size(2);
    (pool, engine)
}
