use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

mod migrations;

use crate::events::{ActionEvent, EventReceiver, SessionStats};
use migrations::run_migrations;

type JournalTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum JournalCommand {
    Execute(JournalTask),
    Shutdown,
}

struct JournalInner {
    sender: mpsc::Sender<JournalCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for JournalInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(JournalCommand::Shutdown) {
                error!("Failed to send shutdown to journal thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join journal thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

/// One recorded dispatch decision, as read back from the journal.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub occurred_at: DateTime<Utc>,
    pub button_id: String,
    pub action: String,
    pub source: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stats: SessionStats,
}

/// Append-only SQLite record of what the watcher did and why.
///
/// All statements run on a dedicated worker thread; async callers get
/// their results back over a oneshot channel.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
    db_path: Arc<PathBuf>,
}

impl Journal {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<JournalCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("permitwatch-journal".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open journal database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run journal migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Journal initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        JournalCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        JournalCommand::Shutdown => break,
                    }
                }

                info!("Journal thread shutting down");
            })
            .with_context(|| "failed to spawn journal worker thread")?;

        ready_rx
            .recv()
            .context("journal worker exited before signaling readiness")??;

        info!("Journal initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(JournalInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = JournalCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Journal caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to journal thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("journal thread terminated unexpectedly"))?
    }

    pub async fn begin_run(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let run_id = run_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, started_at) VALUES (?1, ?2)",
                params![run_id, started_at.to_rfc3339()],
            )
            .with_context(|| "failed to insert run")?;
            Ok(())
        })
        .await
    }

    pub async fn finalize_run(
        &self,
        run_id: &str,
        stopped_at: DateTime<Utc>,
        stats: SessionStats,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE runs
                 SET stopped_at = ?1,
                     approved = ?2,
                     denied = ?3,
                     skipped = ?4,
                     failed = ?5
                 WHERE id = ?6",
                params![
                    stopped_at.to_rfc3339(),
                    to_i64(stats.approved)?,
                    to_i64(stats.denied)?,
                    to_i64(stats.skipped)?,
                    to_i64(stats.failed)?,
                    run_id,
                ],
            )
            .with_context(|| "failed to finalize run")?;
            Ok(())
        })
        .await
    }

    pub async fn record_event(&self, run_id: &str, event: &ActionEvent) -> Result<()> {
        let run_id = run_id.to_string();
        let record = event.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO action_events
                 (run_id, occurred_at, button_id, action, source, outcome, detail, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    record.occurred_at.to_rfc3339(),
                    record.button_id,
                    record.action.as_str(),
                    record.source.as_str(),
                    record.outcome.as_str(),
                    record.outcome.detail(),
                    record.confidence.map(f64::from),
                ],
            )
            .with_context(|| "failed to insert action event")?;
            Ok(())
        })
        .await
    }

    /// Newest events first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<JournalEntry>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT occurred_at, button_id, action, source, outcome, detail, confidence
                 FROM action_events
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(JournalEntry {
                    occurred_at: parse_datetime(&row.get::<_, String>(0)?)?,
                    button_id: row.get(1)?,
                    action: row.get(2)?,
                    source: row.get(3)?,
                    outcome: row.get(4)?,
                    detail: row.get(5)?,
                    confidence: row.get(6)?,
                });
            }

            Ok(entries)
        })
        .await
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, stopped_at, approved, denied, skipped, failed
                 FROM runs
                 ORDER BY started_at DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(RunSummary {
                    id: row.get(0)?,
                    started_at: parse_datetime(&row.get::<_, String>(1)?)?,
                    stopped_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|s| parse_datetime(&s))
                        .transpose()?,
                    stats: SessionStats {
                        approved: to_u64(row.get::<_, i64>(3)?)?,
                        denied: to_u64(row.get::<_, i64>(4)?)?,
                        skipped: to_u64(row.get::<_, i64>(5)?)?,
                        failed: to_u64(row.get::<_, i64>(6)?)?,
                    },
                });
            }

            Ok(runs)
        })
        .await
    }
}

/// Drains the event channel until every sender is gone, tallying stats
/// and mirroring each event into the journal when one is open.
pub async fn consume(
    mut events: EventReceiver,
    journal: Option<Journal>,
    run_id: String,
) -> SessionStats {
    let mut stats = SessionStats::default();
    while let Some(event) = events.recv().await {
        stats.absorb(&event);
        if let Some(journal) = &journal {
            if let Err(err) = journal.record_event(&run_id, &event).await {
                warn!("Failed to record action event: {err:?}");
            }
        }
    }
    stats
}
