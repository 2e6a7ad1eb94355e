use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineError, SharedBook};
use crate::id::{HoldId, ResourceId};
use crate::limits::*;
use crate::model::{EventRecord, Ms, SeqMark, Span};
use crate::wire;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: committed events fan out per resource. Publishing with
/// no listeners is a no-op — subscribers always recover from the log, the
/// broadcast is only the wakeup.
pub struct StreamHub {
    channels: DashMap<ResourceId, broadcast::Sender<Arc<EventRecord>>>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a resource's committed events. Creates the channel if
    /// needed.
    pub fn subscribe(&self, resource: &ResourceId) -> broadcast::Receiver<Arc<EventRecord>> {
        self.channels
            .entry(resource.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn publish(&self, resource: &ResourceId, record: Arc<EventRecord>) {
        if let Some(sender) = self.channels.get(resource) {
            let _ = sender.send(record);
        }
    }
}

// ── Subscriptions ────────────────────────────────────────────────

/// A logical subscription request over one or more resources.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub resources: Vec<ResourceId>,
    /// Resume marks; present ⇒ resume mode, bootstrap suppressed.
    pub after: Option<Vec<(ResourceId, SeqMark)>>,
    pub include_bootstrap: bool,
    /// Window carried in bootstrap frames; required in bootstrap mode.
    pub window: Option<Span>,
    pub heartbeat_sec: Option<u32>,
}

/// Reply to `stream.open`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpened {
    /// Effective heartbeat — may be clamped below the request.
    pub heartbeat_sec: u32,
    /// Watermark the tail starts after, per subscribed resource.
    pub as_of: BTreeMap<ResourceId, SeqMark>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Bootstrap(BootstrapState),
    Event {
        resource: ResourceId,
        record: Arc<EventRecord>,
    },
    Heartbeat,
}

/// Initial per-resource state in bootstrap mode; events after it carry
/// `seq > as_of_seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapState {
    pub resource: ResourceId,
    pub window: Span,
    pub supply: Vec<(Ms, i64)>,
    pub allocation: Vec<(Ms, i64)>,
    pub holds: Vec<BootstrapHold>,
    pub as_of_seq: SeqMark,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapHold {
    pub hold_id: HoldId,
    pub span: Span,
    pub demand: i64,
    pub expires_at: Ms,
}

impl BootstrapState {
    pub fn to_wire(&self) -> wire::StateBootstrapEvt {
        wire::StateBootstrapEvt {
            resource: self.resource.clone(),
            window: wire::Window::from_span(&self.window),
            supply: self
                .supply
                .iter()
                .map(|&(at, delta)| wire::WireDelta {
                    at: wire::Stamp(at),
                    delta,
                })
                .collect(),
            allocation: self
                .allocation
                .iter()
                .map(|&(at, delta)| wire::WireDelta {
                    at: wire::Stamp(at),
                    delta,
                })
                .collect(),
            holds: self
                .holds
                .iter()
                .map(|h| wire::WireHold {
                    hold_id: h.hold_id.clone(),
                    interval: wire::Window::from_span(&h.span),
                    demand: h.demand,
                    expires_at: wire::Stamp(h.expires_at),
                })
                .collect(),
            as_of_seq: self.as_of_seq,
        }
    }
}

/// A live subscription. Dropping it cancels everything immediately; no
/// further frames are produced.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        metrics::gauge!(crate::observability::STREAMS_ACTIVE).decrement(1.0);
    }
}

impl Engine {
    /// `stream.open` — per-resource ordered tails with strict seq order,
    /// no gaps, no duplicates within the connection. Bootstrap mode
    /// captures each resource's watermark and initial window under the
    /// resource's read lock; resume mode starts strictly after the
    /// caller's marks and fails `not_found` when a mark predates the
    /// retained log.
    pub async fn open_stream(
        &self,
        req: StreamRequest,
    ) -> Result<(StreamOpened, Subscription), EngineError> {
        if req.resources.is_empty() || req.resources.len() > MAX_RESOURCES_PER_COMMAND {
            return Err(EngineError::bad_request("resource count out of range"));
        }
        let mut unique = req.resources.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != req.resources.len() {
            return Err(EngineError::bad_request("duplicate resource in stream"));
        }

        let resume: Option<BTreeMap<ResourceId, SeqMark>> = match &req.after {
            Some(marks) => {
                let mut map = BTreeMap::new();
                for (resource, mark) in marks {
                    if !req.resources.contains(resource) {
                        return Err(EngineError::bad_request(
                            "resume mark names an unsubscribed resource",
                        ));
                    }
                    map.insert(resource.clone(), *mark);
                }
                Some(map)
            }
            None => None,
        };
        let bootstrap = resume.is_none() && req.include_bootstrap;
        let window = match (bootstrap, req.window) {
            (true, None) => {
                return Err(EngineError::bad_request("bootstrap requires a window"));
            }
            (_, w) => w,
        };

        let heartbeat_sec = req
            .heartbeat_sec
            .unwrap_or(self.cfg.heartbeat_default_sec)
            .clamp(MIN_HEARTBEAT_SEC, MAX_HEARTBEAT_SEC)
            .min(self.cfg.heartbeat_max_sec)
            .max(MIN_HEARTBEAT_SEC);

        // Phase 1 — per resource, under its read lock: pin the watermark,
        // attach the broadcast receiver, and capture bootstrap state. A
        // writer can only commit before or after this critical section,
        // so the log backfill from the watermark has no gap to fall into.
        struct TailPlan {
            resource: ResourceId,
            book: SharedBook,
            events_rx: broadcast::Receiver<Arc<EventRecord>>,
            start_after: SeqMark,
            bootstrap: Option<BootstrapState>,
        }
        let mut plans = Vec::with_capacity(req.resources.len());
        let now = self.now();
        for resource in &req.resources {
            let book = self.store.book(resource);
            let guard = book.read().await;
            let events_rx = self.hub.subscribe(resource);
            let start_after = match &resume {
                Some(map) => map.get(resource).copied().unwrap_or(-1),
                None => guard.seq_hi(),
            };
            if start_after + 1 < guard.base_seq() as SeqMark {
                return Err(EngineError::TailTruncated(resource.clone()));
            }
            let boot = if bootstrap {
                let window = window.expect("bootstrap mode validated a window");
                let supply = guard.supply.clip(&window);
                let allocation = guard.allocation.clip(&window);
                let holds = self
                    .store
                    .live_holds_for(resource, now)
                    .into_iter()
                    .filter_map(|h| {
                        h.demand_on(resource).map(|demand| BootstrapHold {
                            hold_id: h.id.clone(),
                            span: h.span,
                            demand,
                            expires_at: h.expires_at,
                        })
                    })
                    .collect();
                Some(BootstrapState {
                    resource: resource.clone(),
                    window,
                    supply: supply.entries().to_vec(),
                    allocation: allocation.entries().to_vec(),
                    holds,
                    as_of_seq: guard.seq_hi(),
                })
            } else {
                None
            };
            drop(guard);
            plans.push(TailPlan {
                resource: resource.clone(),
                book,
                events_rx,
                start_after,
                bootstrap: boot,
            });
        }

        // Phase 2 — hand out the channel and start the pumps.
        let (tx, rx) = mpsc::channel(self.cfg.stream_buffer.max(CHANNEL_CAPACITY));
        let cancel = CancellationToken::new();
        let frames = Arc::new(AtomicU64::new(0));
        let mut as_of = BTreeMap::new();
        let mut tasks = Vec::with_capacity(plans.len() + 1);

        for plan in &mut plans {
            if let Some(state) = plan.bootstrap.take() {
                tx.try_send(StreamFrame::Bootstrap(state))
                    .map_err(|_| EngineError::Internal("stream buffer exhausted".into()))?;
                frames.fetch_add(1, Ordering::Relaxed);
            }
        }
        for plan in plans {
            as_of.insert(plan.resource.clone(), plan.start_after);
            tasks.push(tokio::spawn(forward_tail(
                plan.resource,
                plan.book,
                plan.events_rx,
                tx.clone(),
                cancel.clone(),
                frames.clone(),
                plan.start_after,
            )));
        }
        tasks.push(tokio::spawn(heartbeat_pump(
            tx,
            cancel.clone(),
            frames,
            Duration::from_secs(heartbeat_sec as u64),
        )));

        metrics::gauge!(crate::observability::STREAMS_ACTIVE).increment(1.0);
        Ok((
            StreamOpened {
                heartbeat_sec,
                as_of,
            },
            Subscription { rx, cancel, tasks },
        ))
    }
}

/// Pump one resource's tail. The log is the source of truth — the
/// broadcast only signals that there is something new to read — so
/// delivery is in strict seq order with no gaps or duplicates even when
/// the broadcast channel lags.
async fn forward_tail(
    resource: ResourceId,
    book: SharedBook,
    mut events_rx: broadcast::Receiver<Arc<EventRecord>>,
    tx: mpsc::Sender<StreamFrame>,
    cancel: CancellationToken,
    frames: Arc<AtomicU64>,
    mut last: SeqMark,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        // Drain everything the log has past `last`.
        loop {
            let batch = {
                let guard = book.read().await;
                guard.read_after(last, STREAM_READ_BATCH)
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(()) => {
                    // Truncated under us; the subscriber must re-sync
                    // via cut + snapshot.
                    tracing::debug!(%resource, "tail truncated mid-stream, cancelling");
                    cancel.cancel();
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            for record in batch {
                last = record.seq as SeqMark;
                let frame = StreamFrame::Event {
                    resource: resource.clone(),
                    record,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                frames.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Sleep until the next commit (or a lag notice — either way the
        // log drain above recovers).
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = events_rx.recv() => match received {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

/// Emit `stream.heartbeat` whenever a full interval passes with no other
/// frame on the wire.
async fn heartbeat_pump(
    tx: mpsc::Sender<StreamFrame>,
    cancel: CancellationToken,
    frames: Arc<AtomicU64>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick is immediate
    let mut seen = frames.load(Ordering::Relaxed);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let current = frames.load(Ordering::Relaxed);
                if current == seen {
                    if tx.send(StreamFrame::Heartbeat).await.is_err() {
                        return;
                    }
                } else {
                    seen = current;
                }
            }
        }
    }
}
