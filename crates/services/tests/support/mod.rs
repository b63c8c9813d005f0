#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use course_core::model::{
    MediaKind, MediaLocator, Module, ModuleId, ProgressRecord, ProgressUpdate, UserId,
};
use course_core::time::fixed_clock;
use services::playback::{SimulatedConnector, SimulatedPlayer};
use services::{TrackingConfig, WatchSessionService};
use storage::repository::{
    CatalogRepository, CompletionWrite, InMemoryRepository, ProgressRepository, StorageError,
};

/// Wraps the in-memory store, counting writes and injecting failures.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryRepository,
    upserts: AtomicUsize,
    completions: AtomicUsize,
    failing_completions: AtomicUsize,
    completion_delay: Duration,
}

impl CountingStore {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    pub fn fail_next_completions(&self, count: usize) {
        self.failing_completions.store(count, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressRepository for CountingStore {
    async fn get_progress(
        &self,
        user: UserId,
        module: ModuleId,
    ) -> Result<Option<ProgressRecord>, StorageError> {
        self.inner.get_progress(user, module).await
    }

    async fn list_progress(&self, user: UserId) -> Result<Vec<ProgressRecord>, StorageError> {
        self.inner.list_progress(user).await
    }

    async fn upsert_progress(
        &self,
        user: UserId,
        module: ModuleId,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressRecord, StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_progress(user, module, update, now).await
    }

    async fn complete_and_unlock(
        &self,
        user: UserId,
        module: ModuleId,
        last_position: f64,
        next: Option<ModuleId>,
        now: DateTime<Utc>,
    ) -> Result<CompletionWrite, StorageError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if !self.completion_delay.is_zero() {
            tokio::time::sleep(self.completion_delay).await;
        }
        let failing = self.failing_completions.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_completions.store(failing - 1, Ordering::SeqCst);
            return Err(StorageError::Connection("store unavailable".into()));
        }
        self.inner
            .complete_and_unlock(user, module, last_position, next, now)
            .await
    }
}

pub fn native_module(id: u64, sequence: u32) -> Module {
    Module::new(
        ModuleId::new(id),
        sequence,
        format!("Native {id}"),
        MediaLocator::from_file(format!("media/{id}.mp4")).unwrap(),
        MediaKind::NativeStream,
    )
    .unwrap()
}

pub fn embedded_module(id: u64, sequence: u32) -> Module {
    Module::with_inferred_kind(
        ModuleId::new(id),
        sequence,
        format!("Embedded {id}"),
        MediaLocator::from_url("https://youtu.be/dQw4w9WgXcQ").unwrap(),
    )
    .unwrap()
}

pub struct Fixture {
    pub repo: InMemoryRepository,
    pub store: Arc<CountingStore>,
    pub service: WatchSessionService,
    pub user: UserId,
}

pub async fn fixture(modules: &[Module]) -> Fixture {
    fixture_with(modules, CountingStore::new(InMemoryRepository::new()), TrackingConfig::default())
        .await
}

pub async fn fixture_with(
    modules: &[Module],
    store: CountingStore,
    config: TrackingConfig,
) -> Fixture {
    let repo = store.inner.clone();
    for module in modules {
        repo.upsert_module(module).await.unwrap();
    }
    let store = Arc::new(store);
    let service = WatchSessionService::new(
        Arc::new(repo.clone()),
        store.clone(),
        fixed_clock(),
        config,
    );
    Fixture {
        repo,
        store,
        service,
        user: UserId::random(),
    }
}

/// A playing player frozen in place: tests move it with `seek`.
pub fn frozen_player(duration: f64) -> (Arc<SimulatedPlayer>, SimulatedConnector) {
    let player = SimulatedPlayer::playing(duration, 0.0);
    let connector = SimulatedConnector::new(player.clone(), Duration::from_millis(1_500));
    (player, connector)
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
