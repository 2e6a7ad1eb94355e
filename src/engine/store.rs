use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::id::{AllocationId, CutId, HoldId, IdempotencyKey, ResourceId};
use crate::model::{
    Allocation, AllocationState, Cut, EventBody, EventRecord, Hold, HoldState, Ms, SeqMark,
    EXPIRED_REASON,
};
use crate::timeline::DeltaTimeline;
use crate::wal::{BookState, Checkpoint, IdemState};

pub type SharedBook = Arc<RwLock<ResourceBook>>;

/// Per-resource state guarded by one write lock: the supply and committed
/// allocation timelines plus the retained tail of the event log. Hold
/// demand lives in the hold table and is integrated on demand, so the TTL
/// filter is re-applied on every availability computation.
pub struct ResourceBook {
    pub resource: ResourceId,
    pub supply: DeltaTimeline,
    pub allocation: DeltaTimeline,
    base_seq: u64,
    events: Vec<Arc<EventRecord>>,
}

impl ResourceBook {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            supply: DeltaTimeline::new(0),
            allocation: DeltaTimeline::new(0),
            base_seq: 0,
            events: Vec::new(),
        }
    }

    /// Seq the next committed event will carry.
    pub fn next_seq(&self) -> u64 {
        self.base_seq + self.events.len() as u64
    }

    /// Latest committed seq, −1 when nothing has ever been committed.
    pub fn seq_hi(&self) -> SeqMark {
        self.next_seq() as SeqMark - 1
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Append a committed record and fold its deltas into the timelines.
    /// The caller (commit or replay) assigns seqs; strict succession is
    /// an invariant, not an input.
    pub fn apply(&mut self, record: EventRecord) {
        debug_assert_eq!(record.seq, self.next_seq(), "seq must be strict successor");
        match &record.body {
            EventBody::SupplyDeltaApplied { span, delta, .. } => {
                self.supply.add_interval_delta(span, *delta);
            }
            EventBody::AllocCommitted { span, .. } => {
                if let Some(demand) = record.body.demand_on(&self.resource) {
                    self.allocation.add_interval_delta(span, demand);
                }
            }
            EventBody::AllocCanceled { span, .. } => {
                if let Some(demand) = record.body.demand_on(&self.resource) {
                    self.allocation.add_interval_delta(span, -demand);
                }
            }
            EventBody::HoldPlaced { .. } | EventBody::HoldReleased { .. } => {}
        }
        self.events.push(Arc::new(record));
    }

    /// In-order events with seq strictly greater than `after`. Errors when
    /// `after` predates the retained tail (truncated at a cut).
    pub fn read_after(
        &self,
        after: SeqMark,
        limit: usize,
    ) -> Result<Vec<Arc<EventRecord>>, ()> {
        let first_wanted = after + 1;
        if first_wanted < self.base_seq as SeqMark {
            return Err(());
        }
        let skip = (first_wanted - self.base_seq as SeqMark) as usize;
        Ok(self
            .events
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Retained events with seq strictly greater than `mark`, unbounded.
    pub fn tail_from(&self, mark: SeqMark) -> &[Arc<EventRecord>] {
        let first_wanted = (mark + 1).max(self.base_seq as SeqMark);
        let skip = (first_wanted - self.base_seq as SeqMark) as usize;
        &self.events[skip.min(self.events.len())..]
    }

    /// Drop events with seq < `seq`. Only ever called with a cut
    /// watermark + 1, so gaps appear only at a cut.
    pub fn truncate_before(&mut self, seq: u64) {
        if seq <= self.base_seq {
            return;
        }
        let drop = ((seq - self.base_seq) as usize).min(self.events.len());
        self.events.drain(..drop);
        self.base_seq += drop as u64;
    }

    fn to_state(&self) -> BookState {
        BookState {
            resource: self.resource.clone(),
            supply: self.supply.clone(),
            allocation: self.allocation.clone(),
            base_seq: self.base_seq,
            events: self.events.iter().map(|e| (**e).clone()).collect(),
        }
    }

    fn from_state(state: BookState) -> Self {
        Self {
            resource: state.resource,
            supply: state.supply,
            allocation: state.allocation,
            base_seq: state.base_seq,
            events: state.events.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Outcome bound to an idempotency key: the canonical command hash and
/// the events the first application emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOutcome {
    pub command_hash: [u8; 32],
    pub events: Vec<(ResourceId, EventRecord)>,
}

#[derive(Debug, Clone)]
pub enum IdemEntry {
    /// First application still running; a concurrent duplicate fails
    /// `conflict` rather than racing it.
    Pending,
    Stored(StoredOutcome),
}

pub enum IdemBegin {
    Fresh,
    InFlight,
    Done(StoredOutcome),
}

/// All mutable engine state. Books are reconstructable from the WAL;
/// holds, allocations, and idempotency bindings are projections of the
/// same records, rebuilt on replay.
pub struct InMemoryStore {
    books: DashMap<ResourceId, SharedBook>,
    holds: DashMap<HoldId, Hold>,
    allocations: DashMap<AllocationId, Allocation>,
    resource_holds: DashMap<ResourceId, HashSet<HoldId>>,
    idem: DashMap<IdempotencyKey, IdemEntry>,
    cuts: DashMap<CutId, Cut>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
            holds: DashMap::new(),
            allocations: DashMap::new(),
            resource_holds: DashMap::new(),
            idem: DashMap::new(),
            cuts: DashMap::new(),
        }
    }

    // ── Books ────────────────────────────────────────────────

    /// Resources are created externally and referenced by urn; the first
    /// reference materializes an empty book.
    pub fn book(&self, resource: &ResourceId) -> SharedBook {
        self.books
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceBook::new(resource.clone()))))
            .value()
            .clone()
    }

    pub fn book_ids(&self) -> Vec<ResourceId> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }

    // ── Hold table ───────────────────────────────────────────

    pub fn hold(&self, id: &HoldId) -> Option<Hold> {
        self.holds.get(id).map(|h| h.value().clone())
    }

    /// Live holds demanding capacity on `resource` at `now`.
    pub fn live_holds_for(&self, resource: &ResourceId, now: Ms) -> Vec<Hold> {
        let Some(ids) = self.resource_holds.get(resource) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.holds.get(id))
            .filter(|h| h.is_live(now))
            .map(|h| h.value().clone())
            .collect()
    }

    /// Sum of live hold demand on `resource` as a timeline.
    pub fn hold_demand(&self, resource: &ResourceId, now: Ms) -> DeltaTimeline {
        let mut demand = DeltaTimeline::new(0);
        for hold in self.live_holds_for(resource, now) {
            if let Some(d) = hold.demand_on(resource) {
                demand.add_interval_delta(&hold.span, d);
            }
        }
        demand
    }

    /// Holds whose TTL has passed but whose expiry event has not been
    /// emitted yet — the sweeper's work list.
    pub fn overdue_holds(&self, now: Ms) -> Vec<HoldId> {
        self.holds
            .iter()
            .filter(|h| h.state == HoldState::Active && h.expires_at <= now)
            .map(|h| h.id.clone())
            .collect()
    }

    pub fn allocation(&self, id: &AllocationId) -> Option<Allocation> {
        self.allocations.get(id).map(|a| a.value().clone())
    }

    /// Fold one event body into the hold/allocation tables. Idempotent:
    /// a multi-resource command appears once per resource log during
    /// replay, and each occurrence folds to the same state.
    pub fn apply_side_effects(&self, body: &EventBody) {
        match body {
            EventBody::SupplyDeltaApplied { .. } => {}
            EventBody::HoldPlaced {
                hold_id,
                resources,
                span,
                demands,
                expires_at,
            } => {
                if !self.holds.contains_key(hold_id) {
                    self.holds.insert(
                        hold_id.clone(),
                        Hold {
                            id: hold_id.clone(),
                            resources: resources.clone(),
                            span: *span,
                            demands: demands.clone(),
                            expires_at: *expires_at,
                            state: HoldState::Active,
                        },
                    );
                    for r in resources {
                        self.resource_holds
                            .entry(r.clone())
                            .or_default()
                            .insert(hold_id.clone());
                    }
                }
            }
            EventBody::HoldReleased {
                hold_id, reason, ..
            } => {
                let terminal = if reason.as_deref() == Some(EXPIRED_REASON) {
                    HoldState::Expired
                } else {
                    HoldState::Released
                };
                self.finish_hold(hold_id, terminal);
            }
            EventBody::AllocCommitted {
                allocation_id,
                hold_id,
                resources,
                span,
                demands,
            } => {
                self.finish_hold(hold_id, HoldState::Confirmed);
                if !self.allocations.contains_key(allocation_id) {
                    self.allocations.insert(
                        allocation_id.clone(),
                        Allocation {
                            id: allocation_id.clone(),
                            hold_id: hold_id.clone(),
                            resources: resources.clone(),
                            span: *span,
                            demands: demands.clone(),
                            state: AllocationState::Committed,
                        },
                    );
                }
            }
            EventBody::AllocCanceled { allocation_id, .. } => {
                if let Some(mut alloc) = self.allocations.get_mut(allocation_id) {
                    alloc.state = AllocationState::Canceled;
                }
            }
        }
    }

    /// Move a hold to a terminal (or Confirmed) state and drop it from the
    /// per-resource index so availability scans stay small.
    fn finish_hold(&self, hold_id: &HoldId, state: HoldState) {
        let resources = if let Some(mut hold) = self.holds.get_mut(hold_id) {
            if hold.state != HoldState::Active {
                return;
            }
            hold.state = state;
            hold.resources.clone()
        } else {
            return;
        };
        for r in &resources {
            if let Some(mut ids) = self.resource_holds.get_mut(r) {
                ids.remove(hold_id);
            }
        }
    }

    // ── Idempotency ──────────────────────────────────────────

    /// First write wins: a vacant entry becomes Pending and the command
    /// proceeds; an occupied one replays or conflicts.
    pub fn idem_begin(&self, key: &IdempotencyKey) -> IdemBegin {
        use dashmap::mapref::entry::Entry;
        match self.idem.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                IdemEntry::Pending => IdemBegin::InFlight,
                IdemEntry::Stored(outcome) => IdemBegin::Done(outcome.clone()),
            },
            Entry::Vacant(entry) => {
                entry.insert(IdemEntry::Pending);
                IdemBegin::Fresh
            }
        }
    }

    pub fn idem_finish(&self, key: &IdempotencyKey, outcome: StoredOutcome) {
        self.idem.insert(key.clone(), IdemEntry::Stored(outcome));
    }

    /// Clear a Pending reservation after a failed command.
    pub fn idem_abort(&self, key: &IdempotencyKey) {
        if let Some(entry) = self.idem.get(key)
            && matches!(entry.value(), IdemEntry::Pending)
        {
            drop(entry);
            self.idem.remove(key);
        }
    }

    /// Restore a binding from the WAL without going through Pending.
    pub fn idem_restore(&self, key: IdempotencyKey, outcome: StoredOutcome) {
        self.idem.insert(key, IdemEntry::Stored(outcome));
    }

    // ── Cuts ─────────────────────────────────────────────────

    pub fn insert_cut(&self, cut: Cut) {
        self.cuts.insert(cut.id.clone(), cut);
    }

    pub fn cut(&self, id: &CutId) -> Option<Cut> {
        self.cuts.get(id).map(|c| c.value().clone())
    }

    /// Retention is time-bounded; the sweeper prunes expired cuts.
    pub fn prune_cuts(&self, issued_before: Ms) -> usize {
        let expired: Vec<CutId> = self
            .cuts
            .iter()
            .filter(|c| c.issued_at < issued_before)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            self.cuts.remove(id);
        }
        expired.len()
    }

    // ── Checkpointing ────────────────────────────────────────

    /// Assemble a checkpoint from book guards the engine already holds.
    pub fn checkpoint_with(&self, books: Vec<BookState>) -> Checkpoint {
        Checkpoint {
            books,
            holds: self.holds.iter().map(|h| h.value().clone()).collect(),
            allocations: self
                .allocations
                .iter()
                .map(|a| a.value().clone())
                .collect(),
            idem: self
                .idem
                .iter()
                .filter_map(|e| match e.value() {
                    IdemEntry::Stored(outcome) => Some(IdemState {
                        key: e.key().clone(),
                        command_hash: outcome.command_hash,
                        events: outcome.events.clone(),
                    }),
                    IdemEntry::Pending => None,
                })
                .collect(),
        }
    }

    pub fn restore(&self, checkpoint: Checkpoint) {
        for state in checkpoint.books {
            let book = ResourceBook::from_state(state);
            self.books
                .insert(book.resource.clone(), Arc::new(RwLock::new(book)));
        }
        for hold in checkpoint.holds {
            if hold.state == HoldState::Active {
                for r in &hold.resources {
                    self.resource_holds
                        .entry(r.clone())
                        .or_default()
                        .insert(hold.id.clone());
                }
            }
            self.holds.insert(hold.id.clone(), hold);
        }
        for alloc in checkpoint.allocations {
            self.allocations.insert(alloc.id.clone(), alloc);
        }
        for state in checkpoint.idem {
            self.idem_restore(
                state.key,
                StoredOutcome {
                    command_hash: state.command_hash,
                    events: state.events,
                },
            );
        }
    }
}

/// Extract a book's checkpoint form; free so the engine can call it on a
/// held guard.
pub fn book_state(book: &ResourceBook) -> BookState {
    book.to_state()
}
