use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sea_orm::sea_query::Value;
use sea_orm::{ConnectionTrait, Database};

use gridfeed::error::IngestError;
use gridfeed::jobs::run_reconcile;
use gridfeed::migrate::{Migrator, SqlMigrator};
use gridfeed::reconcile::{SnapshotOutcome, SnapshotReconciler, PROCESSED_DIR};
use gridfeed::store::tables::WEATHER;
use gridfeed::store::{count_rows, read_rows, Store, StoredRow, UpsertMerger};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    _dir: tempfile::TempDir,
    inbox: PathBuf,
    store: Store,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let inbox = dir.path().join("inbox");
        fs::create_dir(&inbox).expect("inbox");
        let store = Store::connect_sqlite(&dir.path().join("canonical.db"), TIMEOUT)
            .await
            .expect("connect");
        SqlMigrator::new(store.conn()).up().await.expect("migrate");
        Self {
            _dir: dir,
            inbox,
            store,
        }
    }

    fn reconciler(&self) -> SnapshotReconciler {
        self.reconciler_with_batch(2)
    }

    fn reconciler_with_batch(&self, batch_size: usize) -> SnapshotReconciler {
        SnapshotReconciler::new(&self.inbox, "db", UpsertMerger::new(batch_size), TIMEOUT)
    }

    fn processed(&self, name: &str) -> PathBuf {
        self.inbox.join(PROCESSED_DIR).join(name)
    }
}

/// Writes a snapshot file built from raw SQL statements.
async fn write_snapshot(path: &Path, statements: &[&str]) {
    let conn = Database::connect(format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .expect("create snapshot");
    for sql in statements {
        conn.execute_unprepared(sql).await.expect("snapshot sql");
    }
    conn.close().await.expect("close snapshot");
}

/// The schema site loggers write their local buffer with.
const WEATHER_DDL: &str = "CREATE TABLE weather (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT,
    temperature_c REAL, dew_point_c REAL, relative_humidity REAL, pressure_hpa REAL,
    wind_speed_ms REAL, wind_direction_deg REAL, precip_mmph REAL,
    energy_today_wh INTEGER, pv_feed_in_w INTEGER, battery_soc_pct INTEGER,
    active_power_pcc_w INTEGER, bat_charge_w INTEGER, bat_discharge_w INTEGER,
    sma_json TEXT, merged_at TEXT, pushed_at TEXT
)";

const WEATHER_INSERT: &str =
    "INSERT INTO weather (ts, temperature_c, pv_feed_in_w, sma_json, merged_at, pushed_at) VALUES";

async fn standard_snapshot(path: &Path) {
    let rows = format!(
        "{WEATHER_INSERT} \
         ('2024-06-01T10:00:00Z', 20.5, 1500, '{{\"inv\": {{\"w\": 1500}}}}', '2024-06-01T10:01:00Z', NULL), \
         ('2024-06-01 10:15:00', 21.0, 1620, NULL, NULL, NULL), \
         ('2024-06-01T10:30:00+00:00', 21.5, NULL, '{{\"inv\": {{\"w\": 0}}}}', NULL, '2024-06-01T10:40:00Z')"
    );
    write_snapshot(path, &[WEATHER_DDL, &rows]).await;
}

/// One-row snapshot with the given key, temperature and payload.
async fn single_row_snapshot(path: &Path, ts: &str, temperature: f64, sma_json: &str) {
    let row = format!("{WEATHER_INSERT} ('{ts}', {temperature}, NULL, '{sma_json}', NULL, NULL)");
    write_snapshot(path, &[WEATHER_DDL, &row]).await;
}

fn value(row: &StoredRow, name: &str) -> Value {
    let i = WEATHER
        .columns
        .iter()
        .position(|c| c.name == name)
        .expect("weather column");
    row.values[i].clone()
}

/// Keys and values without the audit columns.
fn contents(rows: &[StoredRow]) -> Vec<(chrono::DateTime<Utc>, Vec<Value>)> {
    rows.iter().map(|r| (r.ts, r.values.clone())).collect()
}

#[tokio::test]
async fn test_snapshot_is_merged_and_relocated() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("site-a.db");
    standard_snapshot(&path).await;

    let outcome = fx
        .reconciler()
        .process(fx.store.conn(), &path)
        .await
        .expect("process");
    assert_eq!(outcome, SnapshotOutcome::Merged { rows: 3, written: 3 });
    assert!(!path.exists());
    assert!(fx.processed("site-a.db").exists());

    let rows = read_rows(fx.store.conn(), &WEATHER).await.expect("read");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].ts, Utc.with_ymd_and_hms(2024, 6, 1, 10, 15, 0).unwrap());
    assert_eq!(value(&rows[0], "temperature_c"), Value::from(Some(20.5)));
    assert_eq!(value(&rows[0], "pv_feed_in_w"), Value::from(Some(1500i64)));
    assert_eq!(
        value(&rows[0], "sma_json"),
        Value::from(Some(serde_json::json!({"inv": {"w": 1500}})))
    );
    assert_eq!(
        value(&rows[0], "merged_at"),
        Value::from(Some("2024-06-01T10:01:00Z".to_string()))
    );
    assert_eq!(value(&rows[1], "sma_json"), Value::Json(None));
    assert_eq!(value(&rows[1], "dew_point_c"), Value::Double(None));
    assert_eq!(value(&rows[2], "pv_feed_in_w"), Value::BigInt(None));
    assert_eq!(
        value(&rows[2], "pushed_at"),
        Value::from(Some("2024-06-01T10:40:00Z".to_string()))
    );
}

#[tokio::test]
async fn test_snapshot_with_partial_column_set_is_merged() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("site.db");
    write_snapshot(
        &path,
        &[
            "CREATE TABLE weather (ts, temperature_c, sma_json, merged_at, pushed_at)",
            "INSERT INTO weather VALUES ('2024-06-01T12:00:00Z', 19.5, '{\"inv\": 1}', NULL, NULL)",
        ],
    )
    .await;

    let report = fx.reconciler().run(fx.store.conn()).await.expect("run");
    assert_eq!((report.merged, report.skipped, report.rows_written), (1, 0, 1));
    assert!(fx.processed("site.db").exists());

    let rows = read_rows(fx.store.conn(), &WEATHER).await.expect("read");
    assert_eq!(rows.len(), 1);
    assert_eq!(value(&rows[0], "temperature_c"), Value::from(Some(19.5)));
    assert_eq!(value(&rows[0], "sma_json"), Value::from(Some(serde_json::json!({"inv": 1}))));
    assert_eq!(value(&rows[0], "battery_soc_pct"), Value::BigInt(None));
}

#[tokio::test]
async fn test_replaying_a_snapshot_changes_nothing() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("site-a.db");
    standard_snapshot(&path).await;
    fx.reconciler()
        .process(fx.store.conn(), &path)
        .await
        .expect("first");
    let before = read_rows(fx.store.conn(), &WEATHER).await.expect("read");

    // A crash between merge and relocation leaves the file in the inbox.
    fs::rename(fx.processed("site-a.db"), &path).expect("move back");
    let outcome = fx
        .reconciler()
        .process(fx.store.conn(), &path)
        .await
        .expect("replay");
    assert_eq!(outcome, SnapshotOutcome::Merged { rows: 3, written: 0 });

    let after = read_rows(fx.store.conn(), &WEATHER).await.expect("read");
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rerun_after_failure_partway_converges() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("site-a.db");
    standard_snapshot(&path).await;

    // The store rejects the second key, so the second one-row batch fails.
    let conn = fx.store.conn();
    conn.execute_unprepared(
        "CREATE TRIGGER reject_10_15 BEFORE INSERT ON weather \
         WHEN strftime('%H:%M', NEW.ts) = '10:15' \
         BEGIN SELECT RAISE(ABORT, 'store rejected row'); END",
    )
    .await
    .expect("trigger");

    let reconciler = fx.reconciler_with_batch(1);
    let report = reconciler.run(conn).await.expect("run");
    assert_eq!(report.failed(), 1);
    assert!(matches!(report.failures[0].1, IngestError::Persist { .. }));
    assert!(path.exists());
    assert!(!fx.processed("site-a.db").exists());
    let prefix = read_rows(conn, &WEATHER).await.expect("read");
    assert_eq!(prefix.len(), 1);
    assert_eq!(prefix[0].ts, Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());

    conn.execute_unprepared("DROP TRIGGER reject_10_15")
        .await
        .expect("drop trigger");
    let outcome = reconciler.process(conn, &path).await.expect("rerun");
    assert_eq!(outcome, SnapshotOutcome::Merged { rows: 3, written: 2 });
    let recovered = read_rows(conn, &WEATHER).await.expect("read");
    assert_eq!(recovered[0], prefix[0]);

    // Same final contents as merging the file in one clean pass.
    let clean = Fixture::new().await;
    let clean_path = clean.inbox.join("site-a.db");
    standard_snapshot(&clean_path).await;
    clean
        .reconciler_with_batch(1)
        .process(clean.store.conn(), &clean_path)
        .await
        .expect("clean pass");
    let expected = read_rows(clean.store.conn(), &WEATHER).await.expect("read");
    assert_eq!(contents(&recovered), contents(&expected));
}

#[tokio::test]
async fn test_existing_rows_are_never_overwritten() {
    let fx = Fixture::new().await;
    single_row_snapshot(&fx.inbox.join("a.db"), "2024-06-01T00:00:00Z", 1.0, "{\"v\": 1}").await;
    single_row_snapshot(&fx.inbox.join("b.db"), "2024-06-01T00:00:00Z", 2.0, "{\"v\": 2}").await;

    let report = fx.reconciler().run(fx.store.conn()).await.expect("run");
    assert_eq!(report.merged, 2);
    assert_eq!(report.rows_written, 1);

    let rows = read_rows(fx.store.conn(), &WEATHER).await.expect("read");
    assert_eq!(rows.len(), 1);
    assert_eq!(value(&rows[0], "temperature_c"), Value::from(Some(1.0)));
    assert_eq!(value(&rows[0], "sma_json"), Value::from(Some(serde_json::json!({"v": 1}))));
}

#[tokio::test]
async fn test_snapshot_without_weather_table_is_skipped_and_relocated() {
    let fx = Fixture::new().await;
    let no_table = fx.inbox.join("a.db");
    let no_ts = fx.inbox.join("b.db");
    write_snapshot(&no_table, &["CREATE TABLE other (id INTEGER)"]).await;
    write_snapshot(&no_ts, &["CREATE TABLE weather (id INTEGER, temperature_c REAL)"]).await;

    let report = fx.reconciler().run(fx.store.conn()).await.expect("run");
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed(), 0);
    assert!(fx.processed("a.db").exists());
    assert!(fx.processed("b.db").exists());
    assert_eq!(count_rows(fx.store.conn(), &WEATHER).await.expect("count"), 0);
}

#[tokio::test]
async fn test_malformed_snapshot_stays_in_inbox_and_others_proceed() {
    let fx = Fixture::new().await;
    let bad = fx.inbox.join("a.db");
    let good = fx.inbox.join("b.db");
    single_row_snapshot(&bad, "2024-06-01T00:00:00Z", 1.0, "not json").await;
    standard_snapshot(&good).await;

    let report = fx.reconciler().run(fx.store.conn()).await.expect("run");
    assert_eq!(report.failed(), 1);
    assert_eq!(report.merged, 1);
    assert!(bad.exists());
    assert!(!good.exists());
    assert_eq!(count_rows(fx.store.conn(), &WEATHER).await.expect("count"), 3);

    // The job reports the failure after attempting every file.
    let err = run_reconcile(fx.store.conn(), &fx.inbox, "db", UpsertMerger::default(), TIMEOUT)
        .await
        .expect_err("bad snapshot remains");
    assert!(err.is_parse());
    assert!(bad.exists());
}

#[tokio::test]
async fn test_misaligned_snapshot_rows_fail_the_file() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("a.db");
    single_row_snapshot(&path, "2024-06-01T00:07:00Z", 1.0, "{}").await;

    let err = fx
        .reconciler()
        .process(fx.store.conn(), &path)
        .await
        .expect_err("misaligned");
    assert!(err.is_parse());
    assert!(path.exists());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let fx = Fixture::new().await;
    standard_snapshot(&fx.inbox.join("a.db")).await;
    fs::write(fx.inbox.join("notes.txt"), "not a snapshot").expect("write");

    let first = run_reconcile(fx.store.conn(), &fx.inbox, "db", UpsertMerger::default(), TIMEOUT)
        .await
        .expect("first");
    assert_eq!(first.merged, 1);

    let second = run_reconcile(fx.store.conn(), &fx.inbox, "db", UpsertMerger::default(), TIMEOUT)
        .await
        .expect("second");
    assert_eq!(second.merged + second.skipped + second.failed(), 0);
    assert!(fx.inbox.join("notes.txt").exists());
}

#[tokio::test]
async fn test_snapshot_is_opened_read_only() {
    let fx = Fixture::new().await;
    let path = fx.inbox.join("a.db");
    standard_snapshot(&path).await;
    let original = fs::read(&path).expect("read snapshot");

    fx.reconciler()
        .process(fx.store.conn(), &path)
        .await
        .expect("process");
    assert_eq!(fs::read(fx.processed("a.db")).expect("read processed"), original);
}
