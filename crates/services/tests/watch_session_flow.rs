mod support;

use std::sync::Arc;
use std::time::Duration;

use course_core::model::{
    MediaLocator, Module, ModuleId, Percent, ProgressUpdate, UnlockState,
};
use course_core::time::fixed_now;
use services::playback::{
    BackendConnector, MediaBackend, NativePlayer, PlayerState, SimulatedConnector,
    SimulatedPlayer,
};
use services::{BackendError, FlushOutcome, GateError, SessionError, TrackingConfig};
use storage::repository::{InMemoryRepository, ProgressRepository};

use support::{
    CountingStore, advance, embedded_module, fixture, fixture_with, frozen_player, native_module,
};

const A: ModuleId = ModuleId::new(1);
const B: ModuleId = ModuleId::new(2);

fn pct(value: u8) -> Percent {
    Percent::new(value).unwrap()
}

#[tokio::test(start_paused = true)]
async fn entry_module_completion_unlocks_the_next_module() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    let (player, connector) = frozen_player(100.0);
    let gate = fx.service.gate();

    assert!(gate.is_unlocked(fx.user, A).await.unwrap());
    assert!(!gate.is_unlocked(fx.user, B).await.unwrap());
    assert!(matches!(
        fx.service.attach(fx.user, B, &connector).await,
        Err(SessionError::Locked(id)) if id == B
    ));

    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();
    advance(500).await;
    assert_eq!(handle.snapshot().display, Percent::ZERO);
    assert!(player.seeks().is_empty());

    player.seek(96.0).unwrap();
    advance(1_000).await;

    let snapshot = handle.snapshot();
    assert!(snapshot.completed);
    assert_eq!(snapshot.display, pct(96));
    assert_eq!(snapshot.watermark, Percent::FULL);

    let next = fx.repo.get_progress(fx.user, B).await.unwrap().unwrap();
    assert_eq!(next.percent_complete(), Percent::ZERO);
    assert!(!next.completed());
    assert_eq!(next.unlock_state(), UnlockState::Unlocked);
    assert!(gate.is_unlocked(fx.user, B).await.unwrap());

    let report = handle.detach().await.unwrap();
    assert!(report.completed);
    assert_eq!(report.unlocked, Some(B));
    assert_eq!(fx.store.completions(), 1);

    let done = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert!(done.completed());
    assert_eq!(done.percent_complete(), Percent::FULL);
    assert_eq!(fx.service.coordinator().tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn threshold_crossing_and_end_event_10ms_apart_unlock_once() {
    let store = CountingStore::new(InMemoryRepository::new())
        .with_completion_delay(Duration::from_millis(50));
    let fx = fixture_with(
        &[native_module(1, 1), native_module(2, 2)],
        store,
        TrackingConfig::default(),
    )
    .await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(97.0).unwrap();
    // the sampling tick at 1s crosses the threshold, the end event follows
    advance(510).await;
    player.finish();
    advance(200).await;

    let report = handle.detach().await.unwrap();
    assert!(report.completed);
    assert_eq!(report.unlocked, Some(B));
    assert_eq!(fx.store.completions(), 1);

    let records = fx.repo.list_progress(fx.user).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records.iter().filter(|r| r.module_id() == B).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn natural_end_of_native_media_completes_the_module() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    let player = SimulatedPlayer::playing(10.0, 1.0);
    let connector = SimulatedConnector::new(player.clone(), Duration::from_secs(1));
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(12_000).await;
    assert_eq!(player.state(), PlayerState::Ended);
    let snapshot = handle.snapshot();
    assert!(snapshot.completed);
    assert_eq!(snapshot.display, Percent::FULL);

    let report = handle.detach().await.unwrap();
    assert_eq!(report.unlocked, Some(B));
    let record = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert!(record.completed());
    assert!((record.last_position() - 10.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn resume_seeks_native_player_before_first_sample() {
    let fx = fixture(&[native_module(1, 1)]).await;
    fx.repo
        .upsert_progress(fx.user, A, &ProgressUpdate::progress(pct(30), 30.0), fixed_now())
        .await
        .unwrap();
    let (player, connector) = frozen_player(100.0);

    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();
    assert_eq!(player.seeks(), vec![30.0]);

    let mut progress = handle.progress();
    progress.changed().await.unwrap();
    let first = *progress.borrow();
    assert!((first.position - 30.0).abs() < 1e-6);
    assert_eq!(first.display, pct(30));

    handle.detach().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn resume_seeks_embed_before_first_state_request() {
    let fx = fixture(&[embedded_module(1, 1)]).await;
    fx.repo
        .upsert_progress(fx.user, A, &ProgressUpdate::progress(pct(45), 45.0), fixed_now())
        .await
        .unwrap();
    let (player, connector) = frozen_player(100.0);

    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();
    advance(1_100).await;

    assert_eq!(player.seeks(), vec![45.0]);
    let snapshot = handle.snapshot();
    assert!((snapshot.position - 45.0).abs() < 1e-6);
    assert_eq!(snapshot.display, pct(45));
    assert_eq!(snapshot.state, PlayerState::Playing);

    handle.detach().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn periodic_flush_respects_the_epsilon() {
    let fx = fixture(&[native_module(1, 1)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(2.0).unwrap();
    advance(5_000).await;
    assert_eq!(fx.store.upserts(), 0, "2s of movement stays under the epsilon");

    player.seek(6.0).unwrap();
    advance(5_000).await;
    assert_eq!(fx.store.upserts(), 1);

    advance(5_000).await;
    assert_eq!(fx.store.upserts(), 1, "no movement, no write");

    let report = handle.detach().await.unwrap();
    assert_eq!(report.final_flush, FlushOutcome::Clean);
    assert_eq!(report.writes, 1);
    assert_eq!(fx.store.upserts(), 1);
}

#[tokio::test(start_paused = true)]
async fn detach_issues_exactly_one_final_write() {
    let fx = fixture(&[native_module(1, 1)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(2.0).unwrap();
    advance(1_000).await;
    assert_eq!(fx.store.upserts(), 0);

    let report = handle.detach().await.unwrap();
    assert_eq!(report.final_flush, FlushOutcome::Written);
    assert_eq!(fx.store.upserts(), 1);

    let record = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert_eq!(record.percent_complete(), pct(2));
    assert!((record.last_position() - 2.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_still_flushes() {
    let fx = fixture(&[native_module(1, 1)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(2.0).unwrap();
    advance(1_000).await;
    drop(handle);
    advance(10).await;

    assert_eq!(fx.store.upserts(), 1);
}

#[tokio::test(start_paused = true)]
async fn pausing_flushes_early() {
    let fx = fixture(&[native_module(1, 1)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(10.0).unwrap();
    advance(1_000).await;
    player.pause();
    advance(10).await;

    assert_eq!(fx.store.upserts(), 1);
    assert_eq!(handle.snapshot().state, PlayerState::Paused);

    // sampling is suspended: moving the paused player changes nothing
    player.seek(50.0).unwrap();
    advance(6_000).await;
    assert!((handle.snapshot().position - 10.0).abs() < 1e-6);

    let report = handle.detach().await.unwrap();
    assert_eq!(report.final_flush, FlushOutcome::Clean);
}

#[tokio::test(start_paused = true)]
async fn rewinding_below_stored_percent_keeps_it() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    fx.repo
        .upsert_progress(fx.user, A, &ProgressUpdate::progress(pct(40), 40.0), fixed_now())
        .await
        .unwrap();
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(30.0).unwrap();
    advance(6_000).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.display, pct(30));
    assert_eq!(snapshot.watermark, pct(40));
    handle.detach().await.unwrap();

    let record = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert_eq!(record.percent_complete(), pct(40));
    assert!(!record.completed());
    assert!((record.last_position() - 30.0).abs() < 1e-6);
    assert!(fx.repo.get_progress(fx.user, B).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn completion_survives_a_rewind() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(96.0).unwrap();
    advance(1_000).await;
    player.seek(10.0).unwrap();
    advance(5_000).await;
    handle.detach().await.unwrap();

    let record = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert!(record.completed());
    assert_eq!(record.percent_complete(), Percent::FULL);
    assert!((record.last_position() - 10.0).abs() < 1e-6);
    assert_eq!(fx.repo.list_progress(fx.user).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_completion_takes_the_end_path() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(30.0).unwrap();
    advance(1_000).await;
    handle.mark_complete().await.unwrap();
    advance(10).await;

    let snapshot = handle.snapshot();
    assert!(snapshot.completed);
    assert_eq!(snapshot.display, Percent::FULL);
    let report = handle.detach().await.unwrap();
    assert_eq!(report.unlocked, Some(B));
}

#[tokio::test(start_paused = true)]
async fn unanswered_embed_requests_time_out_silently() {
    let fx = fixture(&[embedded_module(1, 1)]).await;
    let (player, connector) = frozen_player(100.0);
    player.seek(20.0).unwrap();
    connector.drop_replies(true);

    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();
    advance(6_000).await;
    assert!(handle.snapshot().position.abs() < 1e-6);
    assert!(!handle.is_finished());
    assert_eq!(fx.store.upserts(), 0);

    connector.drop_replies(false);
    advance(2_000).await;
    assert!((handle.snapshot().position - 20.0).abs() < 1e-6);

    let report = handle.detach().await.unwrap();
    assert_eq!(report.final_flush, FlushOutcome::Written);
}

#[tokio::test(start_paused = true)]
async fn failed_completion_is_retried_by_the_next_sample() {
    let fx = fixture(&[native_module(1, 1), native_module(2, 2)]).await;
    fx.store.fail_next_completions(3);
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(96.0).unwrap();
    advance(2_500).await;

    assert!(handle.snapshot().completed);
    assert_eq!(fx.store.completions(), 4);
    let report = handle.detach().await.unwrap();
    assert_eq!(report.unlocked, Some(B));
    assert_eq!(fx.repo.list_progress(fx.user).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn two_sessions_on_one_module_unlock_once() {
    let store = CountingStore::new(InMemoryRepository::new())
        .with_completion_delay(Duration::from_millis(50));
    let fx = fixture_with(
        &[native_module(1, 1), native_module(2, 2)],
        store,
        TrackingConfig::default(),
    )
    .await;
    let (first_player, first) = frozen_player(100.0);
    let (second_player, second) = frozen_player(100.0);
    let tab_a = fx.service.attach(fx.user, A, &first).await.unwrap();
    let tab_b = fx.service.attach(fx.user, A, &second).await.unwrap();

    advance(500).await;
    first_player.seek(97.0).unwrap();
    second_player.seek(98.0).unwrap();
    advance(3_000).await;

    assert!(tab_a.snapshot().completed);
    assert!(tab_b.snapshot().completed);
    tab_a.detach().await.unwrap();
    assert_eq!(fx.service.coordinator().tracked(), 1);
    tab_b.detach().await.unwrap();
    assert_eq!(fx.service.coordinator().tracked(), 0);

    assert_eq!(fx.store.completions(), 1);
    assert_eq!(fx.repo.list_progress(fx.user).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_completion_keeps_sampling_and_detach_stays_bounded() {
    let store = CountingStore::new(InMemoryRepository::new())
        .with_completion_delay(Duration::from_secs(5));
    let config = TrackingConfig {
        write_timeout_ms: 10_000,
        ..TrackingConfig::default()
    };
    let fx = fixture_with(&[native_module(1, 1), native_module(2, 2)], store, config).await;
    let (player, connector) = frozen_player(100.0);
    let handle = fx.service.attach(fx.user, A, &connector).await.unwrap();

    advance(500).await;
    player.seek(96.0).unwrap();
    advance(1_000).await;
    assert_eq!(fx.store.completions(), 1);

    player.seek(97.0).unwrap();
    advance(2_000).await;
    let snapshot = handle.snapshot();
    assert!((snapshot.position - 97.0).abs() < 1e-6);
    assert_eq!(snapshot.display, pct(97));
    assert!(!snapshot.completed);

    let started = tokio::time::Instant::now();
    let report = handle.detach().await.unwrap();
    assert!(started.elapsed() <= fx.service.config().final_flush_timeout());
    assert_eq!(report.final_flush, FlushOutcome::Written);
    assert!(!report.completed);
    assert_eq!(report.unlocked, None);

    // the write finishes on its own after the session is gone
    advance(3_000).await;
    let stored = fx.repo.get_progress(fx.user, A).await.unwrap().unwrap();
    assert!(stored.completed());
    let next = fx.repo.get_progress(fx.user, B).await.unwrap().unwrap();
    assert_eq!(next.unlock_state(), UnlockState::Unlocked);
    assert_eq!(fx.store.completions(), 1);
    assert_eq!(fx.service.coordinator().tracked(), 0);
}

struct NativeOnly(Arc<SimulatedPlayer>);

impl BackendConnector for NativeOnly {
    fn connect(&self, _module: &Module) -> Result<Box<dyn MediaBackend>, BackendError> {
        Ok(Box::new(self.0.native_backend()))
    }
}

#[tokio::test]
async fn attach_rejects_mismatched_or_unplayable_media() {
    let unplayable = Module::with_inferred_kind(
        ModuleId::new(3),
        3,
        "Channel page",
        MediaLocator::from_url("https://www.youtube.com/channel/UC123").unwrap(),
    )
    .unwrap();
    let fx = fixture(&[embedded_module(1, 1), native_module(2, 2), unplayable]).await;
    let player = SimulatedPlayer::playing(60.0, 0.0);

    let err = fx
        .service
        .attach(fx.user, A, &NativeOnly(player.clone()))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Backend(BackendError::KindMismatch { .. })
    ));

    fx.repo
        .upsert_progress(
            fx.user,
            ModuleId::new(3),
            &ProgressUpdate::progress(Percent::ZERO, 0.0),
            fixed_now(),
        )
        .await
        .unwrap();
    let connector = SimulatedConnector::new(player, Duration::from_secs(1));
    let err = fx
        .service
        .attach(fx.user, ModuleId::new(3), &connector)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Backend(BackendError::UnsupportedLocator(_))
    ));

    let err = fx
        .service
        .attach(fx.user, ModuleId::new(9), &connector)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Gate(GateError::UnknownModule(_))
    ));
}
