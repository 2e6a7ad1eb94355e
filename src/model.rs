use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{AllocationId, CutId, HoldId, IdempotencyKey, ResourceId};

/// Unix milliseconds — the only internal time type. Instants cross the wire
/// as canonical RFC3339 and are normalized to `Ms` on ingest (see `wire`).
pub type Ms = i64;

/// Half-open interval `[start, end)`. Empty spans are rejected upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Reason carried on `hold.released` when the engine expires a hold lazily.
pub const EXPIRED_REASON: &str = "expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldState {
    Active,
    Confirmed,
    Released,
    Expired,
}

/// A short-lived reservation. While Active and unexpired its demand is
/// subtracted from availability as if allocated. Terminal states never
/// transition again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub resources: Vec<ResourceId>,
    pub span: Span,
    pub demands: Vec<i64>,
    pub expires_at: Ms,
    pub state: HoldState,
}

impl Hold {
    /// Active in the table *and* unexpired at `now`. Availability always
    /// re-applies this filter; the expiry event itself is emitted lazily.
    pub fn is_live(&self, now: Ms) -> bool {
        self.state == HoldState::Active && self.expires_at > now
    }

    /// Demand this hold places on `resource`, if it covers it.
    pub fn demand_on(&self, resource: &ResourceId) -> Option<i64> {
        self.resources
            .iter()
            .position(|r| r == resource)
            .map(|i| self.demands[i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Committed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub hold_id: HoldId,
    pub resources: Vec<ResourceId>,
    pub span: Span,
    pub demands: Vec<i64>,
    pub state: AllocationState,
}

/// One committed record in a per-resource log. `seq` is the per-resource
/// ordinal: strictly monotone from 0, gaps only across truncation at a cut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: Ms,
    pub source_idem: Option<IdempotencyKey>,
    pub body: EventBody,
}

/// Event payloads. Bodies are self-contained: replay and as-of-cut
/// projection derive every timeline delta from the body alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventBody {
    SupplyDeltaApplied {
        resource: ResourceId,
        span: Span,
        delta: i64,
    },
    HoldPlaced {
        hold_id: HoldId,
        resources: Vec<ResourceId>,
        span: Span,
        demands: Vec<i64>,
        expires_at: Ms,
    },
    HoldReleased {
        hold_id: HoldId,
        resources: Vec<ResourceId>,
        span: Span,
        demands: Vec<i64>,
        reason: Option<String>,
    },
    AllocCommitted {
        allocation_id: AllocationId,
        hold_id: HoldId,
        resources: Vec<ResourceId>,
        span: Span,
        demands: Vec<i64>,
    },
    AllocCanceled {
        allocation_id: AllocationId,
        hold_id: HoldId,
        resources: Vec<ResourceId>,
        span: Span,
        demands: Vec<i64>,
        reason: Option<String>,
    },
}

impl EventBody {
    /// Wire discriminant — a forever verb, never renamed or reused.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventBody::SupplyDeltaApplied { .. } => "supply.delta.applied",
            EventBody::HoldPlaced { .. } => "hold.placed",
            EventBody::HoldReleased { .. } => "hold.released",
            EventBody::AllocCommitted { .. } => "alloc.committed",
            EventBody::AllocCanceled { .. } => "alloc.canceled",
        }
    }

    /// Demand the event's hold/allocation places on `resource`.
    pub fn demand_on(&self, resource: &ResourceId) -> Option<i64> {
        let (resources, demands) = match self {
            EventBody::HoldPlaced { resources, demands, .. }
            | EventBody::HoldReleased { resources, demands, .. }
            | EventBody::AllocCommitted { resources, demands, .. }
            | EventBody::AllocCanceled { resources, demands, .. } => (resources, demands),
            EventBody::SupplyDeltaApplied { .. } => return None,
        };
        resources
            .iter()
            .position(|r| r == resource)
            .map(|i| demands[i])
    }
}

/// Watermark over a per-resource log: the latest committed seq, or −1 when
/// the log has never seen an event. Resume-after and bootstrap both speak
/// in watermarks ("events with seq strictly greater").
pub type SeqMark = i64;

/// Cross-resource watermark: each listed resource's `seq_hi` at issue time.
/// Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cut {
    pub id: CutId,
    pub seqs: BTreeMap<ResourceId, SeqMark>,
    pub issued_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(&format!("urn:tap:resource:{s}")).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn hold_liveness_applies_ttl() {
        let hold = Hold {
            id: HoldId::mint(),
            resources: vec![rid("a")],
            span: Span::new(0, 100),
            demands: vec![1],
            expires_at: 1_000,
            state: HoldState::Active,
        };
        assert!(hold.is_live(999));
        assert!(!hold.is_live(1_000));

        let confirmed = Hold {
            state: HoldState::Confirmed,
            ..hold
        };
        assert!(!confirmed.is_live(0));
    }

    #[test]
    fn demand_lookup_by_resource() {
        let hold = Hold {
            id: HoldId::mint(),
            resources: vec![rid("a"), rid("b")],
            span: Span::new(0, 100),
            demands: vec![1, 3],
            expires_at: 1_000,
            state: HoldState::Active,
        };
        assert_eq!(hold.demand_on(&rid("b")), Some(3));
        assert_eq!(hold.demand_on(&rid("c")), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = EventRecord {
            seq: 7,
            ts: 123,
            source_idem: Some(IdempotencyKey::new("K1")),
            body: EventBody::HoldPlaced {
                hold_id: HoldId::mint(),
                resources: vec![rid("a")],
                span: Span::new(1_000, 2_000),
                demands: vec![2],
                expires_at: 9_000,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: EventRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
