pub mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod txn;

pub use conflict::now_ms;
pub use error::{EngineError, ErrorKind};
pub use store::{DocumentStore, ReadKey, Versioned};
pub use txn::Transaction;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::limits::MAX_TX_RETRIES;
use crate::wal::{Commit, Wal};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file. Appends that are already queued when one arrives are
/// written as a batch and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so no half-written batch lingers in the buffer.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// The booking engine: committed documents, the WAL writer handle and the
/// commit section that serializes validation and apply.
pub struct Engine {
    pub store: DocumentStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    commit_lock: Mutex<()>,
    tz: Tz,
}

impl Engine {
    /// Replay the log at `wal_path` and start the WAL writer. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, tz: Tz) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        if replay.truncated {
            warn!(
                path = %wal_path.display(),
                kept = replay.commits.len(),
                "discarding torn WAL tail"
            );
            // Rewrite so later appends don't land behind the garbage.
            Wal::write_compact_file(&wal_path, &replay.commits)?;
            wal.swap_compact_file()?;
        }

        let store = DocumentStore::new();
        for commit in &replay.commits {
            for event in &commit.events {
                store.apply(event);
            }
        }
        debug!(
            commits = replay.commits.len(),
            users = store.user_count(),
            bookings = store.booking_count(),
            "WAL replayed"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            store,
            wal_tx,
            commit_lock: Mutex::new(()),
            tz,
        })
    }

    /// Timezone the business wall clocks are read in.
    pub fn tz(&self) -> Tz {
        self.tz
    }

    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn reads_current(&self, reads: &HashMap<ReadKey, u64>) -> bool {
        reads.iter().all(|(key, version)| self.store.version(key) == *version)
    }

    /// Run `body` as an optimistic transaction.
    ///
    /// The body may run several times and must not have side effects outside
    /// the handle. Its reads are validated at commit; on a mismatch it is
    /// re-run, up to `MAX_TX_RETRIES` times. A domain error from the body is
    /// returned as is unless the reads it was based on are already stale.
    pub async fn run_transaction<T, F>(&self, op: &'static str, body: F) -> Result<T, EngineError>
    where
        F: Fn(&mut Transaction<'_>) -> Result<T, EngineError>,
    {
        for attempt in 0..MAX_TX_RETRIES {
            if attempt > 0 {
                metrics::counter!(crate::observability::TX_RETRIES_TOTAL, "op" => op).increment(1);
                tokio::task::yield_now().await;
            }

            let mut tx = Transaction::new(&self.store, now_ms());
            let outcome = body(&mut tx);
            let torn = tx.is_torn();
            let (reads, writes) = tx.into_parts();

            let value = match outcome {
                Ok(value) => value,
                Err(e) => {
                    if !torn && self.reads_current(&reads) {
                        return Err(e);
                    }
                    debug!(op, attempt, error = %e, "transaction body failed on stale reads, retrying");
                    continue;
                }
            };
            if torn {
                continue;
            }

            let _guard = self.commit_lock.lock().await;
            if !self.reads_current(&reads) {
                debug!(op, attempt, "transaction reads went stale, retrying");
                continue;
            }
            if writes.is_empty() {
                return Ok(value);
            }

            let commit = Commit {
                committed_at: now_ms(),
                events: writes,
            };
            self.wal_append(commit.clone()).await?;
            for event in &commit.events {
                self.store.apply(event);
            }
            return Ok(value);
        }

        warn!(op, retries = MAX_TX_RETRIES, "transaction gave up after repeated conflicts");
        metrics::counter!(crate::observability::TX_CONFLICTS_TOTAL, "op" => op).increment(1);
        Err(EngineError::TxConflict(MAX_TX_RETRIES))
    }

    /// Replace the WAL with the minimal commit list that rebuilds the store.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _guard = self.commit_lock.lock().await;
        let snapshot = Commit {
            committed_at: now_ms(),
            events: self.store.snapshot_events(),
        };
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits: vec![snapshot],
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
