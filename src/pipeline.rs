use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, PersistReport, Persister};
use crate::error::{IngestError, Result};
use crate::feed::{FeedClient, StopReason};

/// What the fetch stage produced, independent of persistence.
#[derive(Debug)]
pub struct FetchSummary {
    pub records: usize,
    pub pages: usize,
    pub skipped: usize,
    pub stop: StopReason,
    /// The error that ended the fetch early, if any.
    pub error: Option<IngestError>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The feed yielded nothing; persistence was not attempted.
    NoRecords,
    Persisted(PersistReport),
}

#[derive(Debug)]
pub struct RunReport {
    pub fetch: FetchSummary,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

/// Fetch the configured feed window, then persist whatever was fetched.
///
/// Fetch errors only shorten the record list. Database errors that are not scoped to
/// a single record fail the run; the connection is closed on every path.
pub async fn run(config: &Config) -> Result<RunReport> {
    let started = Instant::now();
    run_stages(config, started).await.map_err(|e| {
        error!("Process failed: {}", e);
        e
    })
}

async fn run_stages(config: &Config, started: Instant) -> Result<RunReport> {
    let client = FeedClient::new(config.feed.clone())?;

    info!(
        target_records = config.feed.target,
        start = %config.feed.start_date,
        end = %config.feed.end_date,
        "Starting to fetch asteroid records"
    );
    let outcome = client.fetch_all().await;
    let fetch = FetchSummary {
        records: outcome.records.len(),
        pages: outcome.pages,
        skipped: outcome.skipped,
        stop: outcome.stop,
        error: outcome.error,
    };
    info!(
        records = fetch.records,
        earth = outcome.records.iter().filter(|r| r.approach.is_earth()).count(),
        pages = fetch.pages,
        skipped = fetch.skipped,
        "Fetch finished"
    );

    if outcome.records.is_empty() {
        warn!("No data fetched, skipping database insertion");
        return Ok(RunReport {
            fetch,
            outcome: RunOutcome::NoRecords,
            elapsed: started.elapsed(),
        });
    }

    info!(db = %config.db_path.display(), "Starting database insertion");
    let conn = db::connect(&config.db_path)?;
    db::init_schema(&conn)?;
    let report = Persister::new(&conn, config.persist.clone()).persist(&outcome.records)?;
    drop(conn);

    let elapsed = started.elapsed();
    info!(
        asteroids = report.inserted_objects,
        approaches = report.inserted_approaches,
        elapsed_secs = elapsed.as_secs_f64(),
        "Process completed"
    );

    Ok(RunReport {
        fetch,
        outcome: RunOutcome::Persisted(report),
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, PersistConfig};
    use crate::neo::tests::raw_neo;
    use chrono::NaiveDate;
    use reqwest::Url;
    use serde_json::{json, Value};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, db_path: std::path::PathBuf) -> Config {
        Config {
            feed: FeedConfig {
                api_key: "test-key".into(),
                base_url: Url::parse(&format!("{}/feed", server.uri())).unwrap(),
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
                target: 100,
                request_delay: Duration::ZERO,
                request_timeout: Duration::from_secs(5),
            },
            persist: PersistConfig::default(),
            db_path,
        }
    }

    async fn serve(server: &MockServer, at: &str, body: Value) {
        Mock::given(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    fn count(db_path: &std::path::Path, table: &str) -> usize {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn same_object_on_two_dates() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/feed",
            json!({
                "links": { "next": null },
                "near_earth_objects": {
                    "2024-01-01": [raw_neo(1001, "2024-01-01"), raw_neo(1002, "2024-01-01")],
                    "2024-01-04": [raw_neo(1001, "2024-01-04")],
                }
            }),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nasa.sqlite");

        let report = run(&config(&server, db_path.clone())).await.unwrap();

        assert_eq!(report.fetch.records, 3);
        match report.outcome {
            RunOutcome::Persisted(p) => {
                assert_eq!(p.inserted_objects, 2);
                assert_eq!(p.inserted_approaches, 3);
            }
            RunOutcome::NoRecords => panic!("expected persisted outcome"),
        }
        assert_eq!(count(&db_path, "asteroids"), 2);
        assert_eq!(count(&db_path, "close_approaches"), 3);
    }

    #[tokio::test]
    async fn empty_feed_skips_persistence() {
        let server = MockServer::start().await;
        serve(&server, "/feed", json!({ "links": {}, "near_earth_objects": {} })).await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nasa.sqlite");

        let report = run(&config(&server, db_path.clone())).await.unwrap();

        assert!(matches!(report.outcome, RunOutcome::NoRecords));
        assert_eq!(report.fetch.records, 0);
        assert!(!db_path.exists());
    }

    #[tokio::test]
    async fn partial_fetch_is_still_persisted() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/feed",
            json!({
                "links": { "next": format!("{}/feed/next", server.uri()) },
                "near_earth_objects": { "2024-01-01": [raw_neo(7, "2024-01-01")] }
            }),
        )
        .await;
        Mock::given(path("/feed/next"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nasa.sqlite");

        let report = run(&config(&server, db_path.clone())).await.unwrap();

        assert_eq!(report.fetch.stop, StopReason::Failed);
        assert!(report.fetch.error.is_some());
        assert!(matches!(report.outcome, RunOutcome::Persisted(ref p) if p.inserted_objects == 1));
        assert_eq!(count(&db_path, "close_approaches"), 1);
    }

    #[tokio::test]
    async fn unusable_database_fails_run() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/feed",
            json!({ "near_earth_objects": { "2024-01-01": [raw_neo(7, "2024-01-01")] } }),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let err = run(&config(&server, blocker.join("nasa.sqlite"))).await.unwrap_err();

        assert!(matches!(err, IngestError::Io(_)));
    }
}
