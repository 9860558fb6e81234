use crate::config::BackupSettings;
use crate::error::Result;
use crate::models::{AutomaticBackupConfig, BackupStatus, DatabaseConfig, Frequency};
use crate::repository::DatabaseConfigRepository;
use crate::services::BackupService;
use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, TimeZone, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initiator recorded on every scheduled dump. Retention only touches these.
pub const AUTO_INITIATOR: &str = "automatic_backups";

#[derive(Clone)]
pub struct BackupScheduler {
    service: BackupService,
    configs: DatabaseConfigRepository,
    wake: Arc<Notify>,
    check_interval: Duration,
    freshness: Duration,
}

impl BackupScheduler {
    pub fn new(
        service: BackupService,
        configs: DatabaseConfigRepository,
        settings: &BackupSettings,
    ) -> Self {
        Self {
            service,
            configs,
            wake: Arc::new(Notify::new()),
            check_interval: settings.check_interval(),
            freshness: settings.freshness_window(),
        }
    }

    /// Runs an extra check soon, e.g. after a backup config changed.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            "Automatic backup scheduler started"
        );
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.tick().await {
                error!("Automatic backup check failed: {}", e);
            }
        }
        info!("Automatic backup scheduler stopped");
    }

    pub async fn tick(&self) -> Result<()> {
        self.tick_at(Local::now().fixed_offset()).await
    }

    /// One pass over every database with automatic backups enabled. A failure
    /// for one database does not stop the others.
    pub async fn tick_at(&self, now: DateTime<FixedOffset>) -> Result<()> {
        for config in self.configs.list_with_automatic_backups().await? {
            if let Err(e) = self.check_database(&config, &now).await {
                error!(connection_id = %config.connection_id, "Automatic backup failed: {}", e);
            }
        }
        Ok(())
    }

    async fn check_database(
        &self,
        config: &DatabaseConfig,
        now: &DateTime<FixedOffset>,
    ) -> Result<()> {
        let Some(backup_config) = config.backups_config.as_deref() else {
            return Ok(());
        };
        if !backup_config.enabled {
            return Ok(());
        }
        let connection_id = config.connection_id.as_str();
        let backups = self.service.backups();

        if backups
            .find_in_progress(connection_id, self.freshness)
            .await?
            .is_some()
        {
            debug!(connection_id, "Skipping automatic backup, a dump is running");
            return Ok(());
        }

        let last_created = backups
            .list_by_initiator(connection_id, AUTO_INITIATOR)
            .await?
            .first()
            .and_then(|job| Utc.timestamp_millis_opt(job.created).single());
        if !is_backup_due(backup_config, last_created, now) {
            return Ok(());
        }

        if backup_config.is_local() {
            if let Err(e) = self.service.check_space(connection_id).await {
                warn!(connection_id, "Automatic backup skipped: {}", e);
                return self.record_error(config.id, backup_config, &e.to_string()).await;
            }
        }
        if backup_config.err.is_some() {
            self.configs.set_backup_error(config.id, None).await?;
        }

        info!(connection_id, "Starting automatic backup");
        let job = match self
            .service
            .dump_and_wait(
                connection_id,
                backup_config.credential_id,
                backup_config.dump_options.clone(),
                AUTO_INITIATOR,
            )
            .await
        {
            Ok(job) => job,
            Err(e) => {
                warn!(connection_id, "Automatic backup not started: {}", e);
                return self.record_error(config.id, backup_config, &e.to_string()).await;
            }
        };

        match &job.status.0 {
            BackupStatus::Ok(_) => {
                if let Some(keep_last) = backup_config.keep_last {
                    self.apply_retention(connection_id, keep_last).await?;
                }
            }
            BackupStatus::Err(message) => {
                warn!(connection_id, backup_id = %job.id, "Automatic backup failed: {}", message);
            }
            BackupStatus::Loading(_) => {}
        }
        Ok(())
    }

    /// Written only when the text changed, so a persistent failure is stored once.
    async fn record_error(
        &self,
        config_id: i64,
        backup_config: &AutomaticBackupConfig,
        message: &str,
    ) -> Result<()> {
        if backup_config.err.as_deref() != Some(message) {
            self.configs.set_backup_error(config_id, Some(message)).await?;
        }
        Ok(())
    }

    async fn apply_retention(&self, connection_id: &str, keep_last: u32) -> Result<()> {
        let jobs = self
            .service
            .backups()
            .list_by_initiator(connection_id, AUTO_INITIATOR)
            .await?;
        for job in jobs.iter().skip(keep_last as usize) {
            match self.service.delete_backup(&job.id, true).await {
                Ok(()) => info!(connection_id, backup_id = %job.id, "Pruned automatic backup"),
                Err(e) => warn!(backup_id = %job.id, "Failed to prune automatic backup: {}", e),
            }
        }
        Ok(())
    }
}

/// Whether a scheduled backup should run at `now`, given the creation time of
/// the newest automatic backup. Hour and day gates are lower bounds in the
/// local time of `now`.
pub fn is_backup_due<Tz: TimeZone>(
    config: &AutomaticBackupConfig,
    last_created: Option<DateTime<Utc>>,
    now: &DateTime<Tz>,
) -> bool {
    let age = last_created.map(|last| now.with_timezone(&Utc) - last);
    let older_than = |hours: i64| age.is_none_or(|age| age > chrono::Duration::hours(hours));

    let hour_ok = config.hour.is_none_or(|hour| now.hour() >= hour);
    let weekday_ok = config
        .day_of_week
        .is_none_or(|day| now.weekday().number_from_monday() >= day);
    // A day 31 schedule still runs on the last day of shorter months.
    let month_day_ok = config.day_of_month.is_none_or(|day| {
        now.day() >= day || now.day() == last_day_of_month(now.year(), now.month())
    });

    match config.frequency {
        Frequency::Hourly => older_than(1),
        Frequency::Daily => hour_ok && older_than(24),
        Frequency::Weekly => weekday_ok && hour_ok && older_than(24 * 7),
        Frequency::Monthly => month_day_ok && weekday_ok && hour_ok && older_than(24 * 28),
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DumpFormat, DumpOptions, PgDumpOptions};

    fn daily(hour: Option<u32>) -> AutomaticBackupConfig {
        AutomaticBackupConfig {
            enabled: true,
            frequency: Frequency::Daily,
            hour,
            day_of_week: None,
            day_of_month: None,
            keep_last: None,
            err: None,
            credential_id: None,
            dump_options: DumpOptions::PgDump(PgDumpOptions::new(DumpFormat::Custom)),
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn daily_respects_hour_gate() {
        let config = daily(Some(14));
        let now = at(2024, 5, 10, 15);
        let last = now - chrono::Duration::hours(25);
        assert!(is_backup_due(&config, Some(last), &now));

        let early = at(2024, 5, 10, 13);
        let last = early - chrono::Duration::hours(25);
        assert!(!is_backup_due(&config, Some(last), &early));
    }

    #[test]
    fn recent_backup_is_not_due_again() {
        let config = daily(None);
        let now = at(2024, 5, 10, 15);
        assert!(!is_backup_due(&config, Some(now - chrono::Duration::hours(3)), &now));
        assert!(is_backup_due(&config, None, &now));

        let hourly = AutomaticBackupConfig {
            frequency: Frequency::Hourly,
            ..daily(None)
        };
        assert!(is_backup_due(&hourly, Some(now - chrono::Duration::minutes(61)), &now));
        assert!(!is_backup_due(&hourly, Some(now - chrono::Duration::minutes(30)), &now));
    }

    #[test]
    fn weekly_waits_for_day_of_week() {
        let config = AutomaticBackupConfig {
            frequency: Frequency::Weekly,
            day_of_week: Some(5),
            ..daily(Some(2))
        };
        // 2024-05-09 is a Thursday, 2024-05-10 a Friday.
        let thursday = at(2024, 5, 9, 12);
        let friday = at(2024, 5, 10, 12);
        let last = Some(at(2024, 5, 1, 12));
        assert!(!is_backup_due(&config, last, &thursday));
        assert!(is_backup_due(&config, last, &friday));
        assert!(!is_backup_due(&config, Some(at(2024, 5, 6, 12)), &friday));
    }

    #[test]
    fn monthly_day_clamps_to_last_day() {
        let config = AutomaticBackupConfig {
            frequency: Frequency::Monthly,
            day_of_month: Some(31),
            ..daily(None)
        };
        let last = Some(at(2024, 1, 31, 0));
        assert!(!is_backup_due(&config, last, &at(2024, 2, 28, 12)));
        assert!(is_backup_due(&config, last, &at(2024, 2, 29, 12)));
        assert_eq!(last_day_of_month(2023, 2), 28);
        assert_eq!(last_day_of_month(2024, 12), 31);
    }

    #[cfg(unix)]
    mod runs {
        use super::*;
        use crate::models::BackupJob;
        use crate::repository::backup_repository::sample_job;
        use crate::services::backup_service::tests::{Harness, harness};
        use sqlx::types::Json;

        const PLENTY: u64 = 10_000_000_000;

        async fn scheduled(
            h: &Harness,
            config: AutomaticBackupConfig,
        ) -> (BackupScheduler, DatabaseConfigRepository, i64) {
            let configs = DatabaseConfigRepository::new(h.pool.clone());
            let db_config = configs.create("c1").await.unwrap();
            configs
                .update_backups_config(db_config.id, Some(&config))
                .await
                .unwrap();
            let scheduler = BackupScheduler::new(
                h.service.clone(),
                configs.clone(),
                &BackupSettings::default(),
            );
            (scheduler, configs, db_config.id)
        }

        fn automatic_job(id: &str, hours_ago: i64) -> BackupJob {
            let created = (Utc::now() - chrono::Duration::hours(hours_ago)).timestamp_millis();
            let mut job = sample_job(id, "c1", created);
            job.initiator = AUTO_INITIATOR.to_string();
            job.status = Json(BackupStatus::Ok(created.to_string()));
            job
        }

        #[tokio::test]
        async fn due_dump_runs_and_prunes_old_backups() {
            let h = harness(PLENTY).await;
            h.tool("pg_dump", "printf 'PAYLOAD'");
            for (id, hours) in [("old-3", 72), ("old-2", 48), ("old-1", 26)] {
                h.backups.insert(&automatic_job(id, hours)).await.unwrap();
            }
            let config = AutomaticBackupConfig {
                keep_last: Some(2),
                ..daily(None)
            };
            let (scheduler, _, _) = scheduled(&h, config).await;

            scheduler.tick_at(Utc::now().fixed_offset()).await.unwrap();

            let remaining = h.backups.list_by_initiator("c1", AUTO_INITIATOR).await.unwrap();
            assert_eq!(remaining.len(), 2);
            assert!(matches!(remaining[0].status.0, BackupStatus::Ok(_)));
            assert!(remaining[0].local_filepath.is_some());
            assert_eq!(remaining[1].id, "old-1");
        }

        #[tokio::test]
        async fn not_due_does_nothing() {
            let h = harness(PLENTY).await;
            h.tool("pg_dump", "printf 'PAYLOAD'");
            h.backups.insert(&automatic_job("recent", 2)).await.unwrap();
            let (scheduler, _, _) = scheduled(&h, daily(None)).await;

            scheduler.tick_at(Utc::now().fixed_offset()).await.unwrap();
            assert_eq!(h.backups.list_by_connection("c1").await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn running_dump_is_not_doubled() {
            let h = harness(PLENTY).await;
            h.tool("pg_dump", "printf 'PAYLOAD'");
            let created = Utc::now().timestamp_millis();
            h.backups.insert(&sample_job("manual", "c1", created)).await.unwrap();
            let (scheduler, _, _) = scheduled(&h, daily(None)).await;

            scheduler.tick_at(Utc::now().fixed_offset()).await.unwrap();
            assert_eq!(h.backups.list_by_connection("c1").await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn space_failure_is_written_to_config_and_later_cleared() {
            let h = harness(50_000_000).await;
            h.tool("pg_dump", "printf 'PAYLOAD'");
            let (scheduler, configs, _) = scheduled(&h, daily(None)).await;

            scheduler.tick_at(Utc::now().fixed_offset()).await.unwrap();
            let stored = configs.get_by_connection("c1").await.unwrap();
            let err = stored.backups_config.unwrap().0.err;
            assert!(err.unwrap().contains("not enough space"));
            assert!(h.backups.list_by_connection("c1").await.unwrap().is_empty());

            let h2 = harness(PLENTY).await;
            h2.tool("pg_dump", "printf 'PAYLOAD'");
            let config = AutomaticBackupConfig {
                err: Some("stale".to_string()),
                ..daily(None)
            };
            let (scheduler, configs, _) = scheduled(&h2, config).await;
            scheduler.tick_at(Utc::now().fixed_offset()).await.unwrap();
            let stored = configs.get_by_connection("c1").await.unwrap();
            assert_eq!(stored.backups_config.unwrap().0.err, None);
            assert_eq!(h2.backups.list_by_connection("c1").await.unwrap().len(), 1);
        }
    }
}
