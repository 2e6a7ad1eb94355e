use std::collections::BTreeMap;

use crate::id::{CutId, ResourceId};
use crate::limits::*;
use crate::model::{Cut, EventBody, Ms, SeqMark, Span};
use crate::timeline::DeltaTimeline;

use super::{Engine, EngineError};

/// One page of `state.snapshot`: supply and allocation deltas within the
/// window, strictly as of the cut's watermark for the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPage {
    pub resource: ResourceId,
    pub seq_hi: SeqMark,
    pub supply: Vec<(Ms, i64)>,
    pub allocation: Vec<(Ms, i64)>,
    pub next_page_after: Option<Ms>,
}

impl Engine {
    /// `cut.create` — capture each listed resource's `seq_hi` under its
    /// read lock. No cross-resource coordination: a cut only promises to
    /// be strictly-before any later observation.
    pub async fn create_cut(&self, resources: &[ResourceId]) -> Result<Cut, EngineError> {
        if resources.is_empty() || resources.len() > MAX_RESOURCES_PER_COMMAND {
            return Err(EngineError::bad_request("resource count out of range"));
        }
        let mut seqs = BTreeMap::new();
        for resource in resources {
            let book = self.store.book(resource);
            let guard = book.read().await;
            seqs.insert(resource.clone(), guard.seq_hi());
        }
        let cut = Cut {
            id: CutId::mint(),
            seqs,
            issued_at: self.now(),
        };
        self.store.insert_cut(cut.clone());
        Ok(cut)
    }

    /// `state.snapshot` — project one resource's timelines as of a cut,
    /// paginated by instant. Current timelines are cloned under a brief
    /// read lock and events past the watermark are un-applied, so the
    /// projection never blocks writers for the duration of the fold.
    pub async fn state_snapshot(
        &self,
        cut_id: &CutId,
        resource: &ResourceId,
        window: Span,
        page_after: Option<Ms>,
        page_size: Option<usize>,
    ) -> Result<SnapshotPage, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::bad_request(
                "window start must be strictly before end",
            ));
        }
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let cut = self
            .store
            .cut(cut_id)
            .ok_or_else(|| EngineError::CutNotFound(cut_id.to_string()))?;
        let as_of = *cut
            .seqs
            .get(resource)
            .ok_or_else(|| EngineError::bad_request("resource not covered by cut"))?;

        let book = self.store.book(resource);
        let guard = book.read().await;
        if as_of + 1 < guard.base_seq() as SeqMark {
            return Err(EngineError::TailTruncated(resource.clone()));
        }
        let mut supply = guard.supply.clone();
        let mut allocation = guard.allocation.clone();
        let tail: Vec<_> = guard.tail_from(as_of).to_vec();
        drop(guard);

        // Un-apply everything the cut has not seen.
        for event in &tail {
            unapply(&mut supply, &mut allocation, resource, &event.body);
        }

        let supply = supply.clip(&window);
        let allocation = allocation.clip(&window);
        Ok(paginate(
            resource.clone(),
            as_of,
            &supply,
            &allocation,
            page_after,
            page_size,
            &window,
        ))
    }
}

/// Invert one event's timeline contribution on `resource`.
fn unapply(
    supply: &mut DeltaTimeline,
    allocation: &mut DeltaTimeline,
    resource: &ResourceId,
    body: &EventBody,
) {
    match body {
        EventBody::SupplyDeltaApplied { span, delta, .. } => {
            supply.add_interval_delta(span, -delta);
        }
        EventBody::AllocCommitted { span, .. } => {
            if let Some(demand) = body.demand_on(resource) {
                allocation.add_interval_delta(span, -demand);
            }
        }
        EventBody::AllocCanceled { span, .. } => {
            if let Some(demand) = body.demand_on(resource) {
                allocation.add_interval_delta(span, demand);
            }
        }
        EventBody::HoldPlaced { .. } | EventBody::HoldReleased { .. } => {}
    }
}

/// Order deltas by instant (clipping already coalesced per instant, so
/// instants are unique within each timeline) and emit whole instant
/// groups — a page boundary never splits an instant, which keeps the
/// strictly-greater `page_after` cursor loss-free.
fn paginate(
    resource: ResourceId,
    seq_hi: SeqMark,
    supply: &DeltaTimeline,
    allocation: &DeltaTimeline,
    page_after: Option<Ms>,
    page_size: usize,
    window: &Span,
) -> SnapshotPage {
    let in_range = |&&(at, _): &&(Ms, i64)| {
        at >= window.start && at < window.end && page_after.is_none_or(|after| at > after)
    };
    let supply_deltas: Vec<(Ms, i64)> = supply.entries().iter().filter(in_range).copied().collect();
    let alloc_deltas: Vec<(Ms, i64)> =
        allocation.entries().iter().filter(in_range).copied().collect();

    let mut instants: Vec<Ms> = supply_deltas
        .iter()
        .chain(alloc_deltas.iter())
        .map(|&(at, _)| at)
        .collect();
    instants.sort_unstable();
    instants.dedup();

    let mut page_supply = Vec::new();
    let mut page_alloc = Vec::new();
    let mut emitted = 0usize;
    let mut next_page_after = None;
    for (i, &at) in instants.iter().enumerate() {
        if emitted >= page_size {
            next_page_after = Some(instants[i - 1]);
            break;
        }
        if let Ok(pos) = supply_deltas.binary_search_by_key(&at, |&(t, _)| t) {
            page_supply.push(supply_deltas[pos]);
            emitted += 1;
        }
        if let Ok(pos) = alloc_deltas.binary_search_by_key(&at, |&(t, _)| t) {
            page_alloc.push(alloc_deltas[pos]);
            emitted += 1;
        }
    }

    SnapshotPage {
        resource,
        seq_hi,
        supply: page_supply,
        allocation: page_alloc,
        next_page_after,
    }
}
