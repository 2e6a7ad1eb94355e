mod availability;
mod error;
mod mutations;
mod queries;
mod snapshot;
mod store;

pub use error::EngineError;
pub use mutations::CommandOutcome;
pub use queries::{FeasibleReport, FeasibleShortfall};
pub use snapshot::SnapshotPage;
pub use store::{InMemoryStore, ResourceBook, SharedBook, StoredOutcome};

use std::io;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::id::{IdempotencyKey, ResourceId};
use crate::model::{EventRecord, Ms};
use crate::stream::StreamHub;
use crate::wal::{Checkpoint, CommandRecord, Wal, WalRecord};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        checkpoint: Box<Checkpoint>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(WalRecord, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(WalRecord, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact {
            checkpoint,
            response,
        } => {
            let result = Wal::write_compact_file(wal.path(), &checkpoint)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The command processor: validates mutations against the zero-sum
/// availability invariant, assigns per-resource seqs under the book
/// locks, persists through the group-commit WAL, and fans committed
/// events out to stream subscribers.
pub struct Engine {
    pub(crate) store: InMemoryStore,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) hub: StreamHub,
    pub(crate) cfg: EngineConfig,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the WAL (checkpoint + tail) and start the writer task.
    pub fn open(cfg: EngineConfig, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let records = Wal::replay(&cfg.wal_path)?;
        let wal = Wal::open(&cfg.wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for record in records {
            match record {
                WalRecord::Checkpoint(checkpoint) => store.restore(checkpoint),
                WalRecord::Command(command) => {
                    for (resource, event) in &command.events {
                        let book = store.book(resource);
                        // Sole owner during replay — try_write cannot contend.
                        let mut guard = book.try_write().expect("replay: uncontended write");
                        guard.apply(event.clone());
                        store.apply_side_effects(&event.body);
                    }
                    if let Some((key, hash)) = command.idem {
                        store.idem_restore(
                            key,
                            StoredOutcome {
                                command_hash: hash,
                                events: command.events,
                            },
                        );
                    }
                }
            }
        }

        Ok(Self {
            store,
            clock,
            hub: StreamHub::new(),
            cfg,
            wal_tx,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Active holds whose TTL has passed — the sweeper's work list.
    pub fn overdue_holds(&self, now: Ms) -> Vec<crate::id::HoldId> {
        self.store.overdue_holds(now)
    }

    /// Drop cuts issued before the retention horizon.
    pub fn prune_cuts(&self, issued_before: Ms) -> usize {
        self.store.prune_cuts(issued_before)
    }

    pub(crate) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Durable-before-ack append with bounded retry; exhaustion surfaces
    /// `internal` and leaves state untouched.
    pub(super) async fn wal_append(&self, record: WalRecord) -> Result<(), EngineError> {
        let mut last_err = String::new();
        for attempt in 0..self.cfg.wal_retry_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.cfg.wal_retry_backoff_ms << (attempt - 1),
                ))
                .await;
            }
            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Append {
                    record: record.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
            match rx.await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "WAL append failed: {e}");
                    last_err = e.to_string();
                }
                Err(_) => {
                    return Err(EngineError::Internal("WAL writer dropped response".into()))
                }
            }
        }
        Err(EngineError::Internal(format!("WAL append failed: {last_err}")))
    }

    /// Acquire write locks on every named book in lexicographic urn order
    /// — the global order that keeps multi-resource commands deadlock-free.
    pub(super) async fn lock_books(
        &self,
        resources: &[ResourceId],
    ) -> Vec<(ResourceId, OwnedRwLockWriteGuard<ResourceBook>)> {
        let mut sorted: Vec<ResourceId> = resources.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for resource in sorted {
            let book = self.store.book(&resource);
            let guard = book.write_owned().await;
            guards.push((resource, guard));
        }
        guards
    }

    /// WAL-append, apply to books and tables, store the idempotency
    /// binding, and publish — the single commit point of every command.
    /// All listed resources' locks are held by the caller.
    pub(super) async fn commit(
        &self,
        guards: &mut [(ResourceId, OwnedRwLockWriteGuard<ResourceBook>)],
        idem: Option<(&IdempotencyKey, [u8; 32])>,
        events: Vec<(ResourceId, EventRecord)>,
    ) -> Result<Vec<(ResourceId, EventRecord)>, EngineError> {
        let record = CommandRecord {
            idem: idem.map(|(k, h)| (k.clone(), h)),
            events: events.clone(),
        };
        self.wal_append(WalRecord::Command(record)).await?;

        for (resource, event) in &events {
            let (_, guard) = guards
                .iter_mut()
                .find(|(r, _)| r == resource)
                .expect("committed event targets a locked book");
            guard.apply(event.clone());
            self.store.apply_side_effects(&event.body);
            self.hub.publish(resource, Arc::new(event.clone()));
            metrics::counter!(
                crate::observability::EVENTS_TOTAL,
                "type" => event.body.event_type()
            )
            .increment(1);
        }
        if let Some((key, hash)) = idem {
            self.store.idem_finish(
                key,
                StoredOutcome {
                    command_hash: hash,
                    events: events.clone(),
                },
            );
        }
        Ok(events)
    }
}

/// Hash of the canonical JSON of `(type, payload)` — what binds an
/// idempotency key to exactly one command.
pub(super) fn command_hash<T: Serialize>(type_tag: &str, payload: &T) -> [u8; 32] {
    let canonical =
        serde_json::to_vec(&(type_tag, payload)).expect("command payloads serialize");
    let digest = Sha256::digest(&canonical);
    digest.into()
}

/// Clears a Pending idempotency reservation unless the command committed.
pub(super) struct IdemClaim<'a> {
    store: &'a InMemoryStore,
    key: IdempotencyKey,
    committed: bool,
}

impl<'a> IdemClaim<'a> {
    pub(super) fn new(store: &'a InMemoryStore, key: IdempotencyKey) -> Self {
        Self {
            store,
            key,
            committed: false,
        }
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdemClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.idem_abort(&self.key);
        }
    }
}
