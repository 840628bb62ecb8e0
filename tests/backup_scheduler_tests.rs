//! Integration tests for scheduled backup creation, reclamation and the
//! leader-only scheduler

mod common;

use chrono::{TimeZone, Utc};
use common::{BackupFixture, NODES};
use custodian::backup::{
    BackupExecutor, BackupScheduler, BackupSettings, BackupStorage, ScheduleInterval,
    UploadPolicy,
};
use custodian::coordination::LeadershipListener;
use std::collections::BTreeSet;
use std::time::Duration;

const OLDEST: &str = "scheduled-3.6.1-3-20240607003000";
const OLDER: &str = "scheduled-3.6.1-3-20240608003000";
const NEWEST: &str = "scheduled-3.6.1-3-20240609003000";
const ORPHAN: &str = "scheduled-3.6.1-3-20240601003000";

fn enabled_settings() -> BackupSettings {
    BackupSettings {
        scheduler_enabled: true,
        interval: ScheduleInterval::daily(),
        start_offset_minutes: 30,
        copies_to_keep: 2,
        upload_url: None,
    }
}

fn executor(fixture: &BackupFixture) -> BackupExecutor {
    BackupExecutor::new(fixture.ctx.clone(), Duration::from_millis(10))
}

fn policy() -> UploadPolicy {
    UploadPolicy {
        attempts: 1,
        retry_delay: Duration::from_millis(10),
    }
}

async fn on_disk(fixture: &BackupFixture) -> BTreeSet<String> {
    fixture.ctx.storage.cluster_backup_tags(true).await.unwrap()
}

/// Three retained scheduled backups, one orphan and one manual backup.
async fn populate(fixture: &BackupFixture) {
    for tag in [OLDEST, OLDER, NEWEST, ORPHAN, "manual-1"] {
        fixture.create_backup(tag, &NODES).await;
    }
    let mut config = fixture.config.load().await.unwrap();
    config.retained_backups = [OLDEST, OLDER, NEWEST].iter().map(|t| t.to_string()).collect();
    fixture.config.persist(&config).await.unwrap();
}

#[tokio::test]
async fn test_create_is_noop_when_disabled() {
    let fixture = BackupFixture::new();

    assert_eq!(executor(&fixture).create().await.unwrap(), None);
    assert!(on_disk(&fixture).await.is_empty());
}

#[tokio::test]
async fn test_create_once_per_scheduled_instant() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    let backups = executor(&fixture);

    let tag = backups.create().await.unwrap();
    assert_eq!(tag.as_deref(), Some("scheduled-3.6.1-3-20240610004500"));
    assert!(on_disk(&fixture).await.contains("scheduled-3.6.1-3-20240610004500"));

    let config = fixture.config.load().await.unwrap();
    assert!(config
        .retained_backups
        .contains("scheduled-3.6.1-3-20240610004500"));

    let status = fixture.config.operation_status().await.unwrap();
    let created = status.last_scheduled_creation.unwrap();
    assert_eq!(created.name, "scheduled-3.6.1-3-20240610004500");
    assert_eq!(
        status.next_scheduled_creation,
        Some(Utc.with_ymd_and_hms(2024, 6, 11, 0, 30, 0).unwrap())
    );

    // Still before the next instant
    fixture.clock.advance(Duration::from_secs(3600));
    assert_eq!(backups.create().await.unwrap(), None);

    fixture.clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(
        backups.create().await.unwrap().as_deref(),
        Some("scheduled-3.6.1-3-20240611014500")
    );
}

#[tokio::test]
async fn test_reclaim_without_upload_server_keeps_newest_copies() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    populate(&fixture).await;

    let mut deleted = executor(&fixture).reclaim().await.unwrap();
    deleted.sort();

    assert_eq!(deleted, vec![ORPHAN.to_string(), OLDEST.to_string()]);
    let expected: BTreeSet<String> = [OLDER, NEWEST, "manual-1"]
        .iter()
        .map(|t| t.to_string())
        .collect();
    assert_eq!(on_disk(&fixture).await, expected);

    let config = fixture.config.load().await.unwrap();
    let retained: Vec<&str> = config.retained_backups.iter().map(String::as_str).collect();
    assert_eq!(retained, vec![OLDER, NEWEST]);
}

#[tokio::test]
async fn test_reclaim_keeps_backups_until_uploaded() {
    let fixture = BackupFixture::new();
    fixture
        .configure(BackupSettings {
            upload_url: Some("file:///remote".to_string()),
            ..enabled_settings()
        })
        .await;
    populate(&fixture).await;
    let backups = executor(&fixture);

    let deleted = backups.reclaim().await.unwrap();
    assert_eq!(deleted, vec![ORPHAN.to_string()]);
    assert!(on_disk(&fixture).await.contains(OLDEST));

    let mut config = fixture.config.load().await.unwrap();
    config.uploaded_backups.insert(OLDEST.to_string());
    fixture.config.persist(&config).await.unwrap();

    let deleted = backups.reclaim().await.unwrap();
    assert_eq!(deleted, vec![OLDEST.to_string()]);
    assert!(!on_disk(&fixture).await.contains(OLDEST));
}

#[tokio::test]
async fn test_reclaim_with_nothing_to_do() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    fixture.create_backup("manual-1", &NODES).await;

    assert!(executor(&fixture).reclaim().await.unwrap().is_empty());
    assert!(on_disk(&fixture).await.contains("manual-1"));
}

async fn wait_for_next_run(scheduler: &BackupScheduler) -> chrono::DateTime<Utc> {
    for _ in 0..500 {
        if let Some(next) = scheduler.next_scheduled_run_time() {
            return next;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scheduler never scheduled a run");
}

#[tokio::test]
async fn test_scheduler_runs_cycle_when_leading() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    let scheduler = BackupScheduler::new(fixture.ctx.clone(), policy());

    assert!(!scheduler.is_leader());
    assert!(scheduler.next_scheduled_run_time().is_none());

    scheduler.start_leadership().await;
    assert!(scheduler.is_leader());

    let next = wait_for_next_run(&scheduler).await;
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 11, 0, 30, 0).unwrap());
    assert!(on_disk(&fixture).await.contains("scheduled-3.6.1-3-20240610004500"));

    scheduler.stop_leadership();
    assert!(!scheduler.is_leader());
    assert!(scheduler.next_scheduled_run_time().is_none());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_reschedules_on_config_change() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    let scheduler = BackupScheduler::new(fixture.ctx.clone(), policy());

    scheduler.start_leadership().await;
    let first = wait_for_next_run(&scheduler).await;
    assert_eq!(first, Utc.with_ymd_and_hms(2024, 6, 11, 0, 30, 0).unwrap());

    fixture
        .configure(BackupSettings {
            interval: "12hour".parse().unwrap(),
            ..enabled_settings()
        })
        .await;
    scheduler.notify_config_changed();

    let expected = Utc.with_ymd_and_hms(2024, 6, 10, 12, 30, 0).unwrap();
    for _ in 0..500 {
        if scheduler.next_scheduled_run_time() == Some(expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.next_scheduled_run_time(), Some(expected));

    // The backup of this morning still covers the 00:30 instant
    let scheduled: Vec<String> = on_disk(&fixture).await.into_iter().collect();
    assert_eq!(scheduled, vec!["scheduled-3.6.1-3-20240610004500".to_string()]);

    scheduler.shutdown().await;
    assert!(scheduler.next_scheduled_run_time().is_none());
}

#[tokio::test]
async fn test_follower_ignores_config_changes() {
    let fixture = BackupFixture::new();
    fixture.configure(enabled_settings()).await;
    let scheduler = BackupScheduler::new(fixture.ctx.clone(), policy());

    scheduler.notify_config_changed();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(scheduler.next_scheduled_run_time().is_none());
    assert!(on_disk(&fixture).await.is_empty());
}

#[tokio::test]
async fn test_scheduler_idles_when_disabled_without_upload_server() {
    let fixture = BackupFixture::new();
    let scheduler = BackupScheduler::new(fixture.ctx.clone(), policy());

    scheduler.start_leadership().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(scheduler.is_leader());
    assert!(scheduler.next_scheduled_run_time().is_none());
    assert!(on_disk(&fixture).await.is_empty());
    scheduler.shutdown().await;
}
