use std::sync::Arc;

use course_core::model::{
    MediaKind, MediaLocator, Module, ModuleId, Percent, ProgressUpdate, UnlockState, UserId,
};
use course_core::time::fixed_now;
use storage::repository::{CatalogRepository, ProgressRepository};
use storage::sqlite::SqliteRepository;

async fn connect(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

async fn connect_file(name: &str) -> SqliteRepository {
    let path = std::env::temp_dir().join(format!("{name}_{}.sqlite3", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

async fn seed_catalog(repo: &SqliteRepository) {
    let intro = Module::new(
        ModuleId::new(1),
        1,
        "Intro",
        MediaLocator::from_file("media/intro.mp4").unwrap(),
        MediaKind::NativeStream,
    )
    .unwrap();
    let embed = Module::with_inferred_kind(
        ModuleId::new(2),
        2,
        "Field work",
        MediaLocator::from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap(),
    )
    .unwrap();
    repo.upsert_module(&embed).await.unwrap();
    repo.upsert_module(&intro).await.unwrap();
}

#[tokio::test]
async fn sqlite_catalog_round_trips_in_sequence_order() {
    let repo = connect("memdb_catalog").await;
    seed_catalog(&repo).await;
    // migrations are re-runnable
    repo.migrate().await.unwrap();

    let modules = repo.list_modules().await.unwrap();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].title(), "Intro");
    assert!(modules[0].media_locator().as_path().is_some());
    assert_eq!(modules[1].media_kind(), MediaKind::EmbeddedThirdParty);
    assert_eq!(
        modules[1].media_locator().embed_video_id().as_deref(),
        Some("dQw4w9WgXcQ")
    );
}

#[tokio::test]
async fn sqlite_upsert_never_regresses_percent_or_completion() {
    let repo = connect("memdb_upsert").await;
    seed_catalog(&repo).await;
    let user = UserId::random();
    let module = ModuleId::new(1);
    let now = fixed_now();
    let pct = |v| Percent::new(v).unwrap();

    assert!(repo.get_progress(user, module).await.unwrap().is_none());

    repo.upsert_progress(user, module, &ProgressUpdate::progress(pct(40), 48.0), now)
        .await
        .unwrap();
    let record = repo
        .upsert_progress(user, module, &ProgressUpdate::progress(pct(30), 36.0), now)
        .await
        .unwrap();
    assert_eq!(record.percent_complete(), pct(40));
    assert!((record.last_position() - 36.0).abs() < f64::EPSILON);
    assert_eq!(record.unlock_state(), UnlockState::Unlocked);

    repo.upsert_progress(user, module, &ProgressUpdate::completion(118.0), now)
        .await
        .unwrap();
    let record = repo
        .upsert_progress(user, module, &ProgressUpdate::progress(pct(2), 3.0), now)
        .await
        .unwrap();
    assert!(record.completed());
    assert_eq!(record.completed_at(), Some(now));
    assert_eq!(record.percent_complete(), Percent::FULL);

    let fetched = repo.get_progress(user, module).await.unwrap().unwrap();
    assert_eq!(fetched, record);
}

#[tokio::test]
async fn sqlite_complete_and_unlock_is_idempotent() {
    let repo = connect("memdb_complete").await;
    seed_catalog(&repo).await;
    let user = UserId::random();
    let (a, b) = (ModuleId::new(1), ModuleId::new(2));

    let first = repo
        .complete_and_unlock(user, a, 115.0, Some(b), fixed_now())
        .await
        .unwrap();
    assert!(!first.already_completed);
    assert_eq!(first.unlocked, Some(b));
    assert!(first.record.completed());

    for _ in 0..3 {
        let again = repo
            .complete_and_unlock(user, a, 120.0, Some(b), fixed_now())
            .await
            .unwrap();
        assert!(again.already_completed);
        assert_eq!(again.unlocked, None);
        assert!((again.record.last_position() - 115.0).abs() < f64::EPSILON);
    }

    let records = repo.list_progress(user).await.unwrap();
    assert_eq!(records.len(), 2);
    let next = &records[1];
    assert_eq!(next.module_id(), b);
    assert_eq!(next.percent_complete(), Percent::ZERO);
    assert_eq!(next.unlock_state(), UnlockState::Unlocked);
}

#[tokio::test]
async fn sqlite_concurrent_completions_create_one_unlock() {
    let repo = Arc::new(connect_file("course_concurrent").await);
    seed_catalog(&repo).await;
    let user = UserId::random();

    let mut handles = Vec::new();
    for i in 0..4 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(async move {
            repo.complete_and_unlock(
                user,
                ModuleId::new(1),
                100.0 + f64::from(i),
                Some(ModuleId::new(2)),
                fixed_now(),
            )
            .await
        }));
    }

    let mut fresh = 0;
    let mut unlocked = 0;
    for handle in handles {
        let write = handle.await.unwrap().unwrap();
        if !write.already_completed {
            fresh += 1;
        }
        if write.unlocked.is_some() {
            unlocked += 1;
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(unlocked, 1);
    assert_eq!(repo.list_progress(user).await.unwrap().len(), 2);
}

#[tokio::test]
async fn sqlite_unlock_never_clobbers_progress() {
    let repo = connect("memdb_unlock").await;
    seed_catalog(&repo).await;
    let user = UserId::random();
    let next = ModuleId::new(2);

    repo.upsert_progress(
        user,
        next,
        &ProgressUpdate::progress(Percent::new(12).unwrap(), 14.0),
        fixed_now(),
    )
    .await
    .unwrap();
    let write = repo
        .complete_and_unlock(user, ModuleId::new(1), 97.0, Some(next), fixed_now())
        .await
        .unwrap();
    assert_eq!(write.unlocked, None);

    let record = repo.get_progress(user, next).await.unwrap().unwrap();
    assert_eq!(record.percent_complete().value(), 12);
    assert!(!record.completed());
}
