use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::id::{ActorId, AllocationId, CutId, HoldId, IdempotencyKey, ResourceId};
use crate::model::{EventBody, EventRecord, Ms, SeqMark, Span};

/// Envelope schema version.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Instants ─────────────────────────────────────────────────────

/// A wall-clock instant on the wire: canonical RFC3339 UTC (`Z` suffix,
/// no fractional trailing zeros), millisecond precision internally.
/// Lexicographic order of the canonical form matches chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp(pub Ms);

impl Stamp {
    pub fn canonical(self) -> String {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .expect("instant within validated range")
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let dt = DateTime::parse_from_rfc3339(raw).map_err(|e| format!("bad instant: {e}"))?;
        Ok(Self(dt.with_timezone(&Utc).timestamp_millis()))
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Stamp::parse(&raw).map_err(D::Error::custom)
    }
}

/// `{start, end}`, both canonical instants, inclusive-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Stamp,
    pub end: Stamp,
}

impl Window {
    pub fn from_span(span: &Span) -> Self {
        Self {
            start: Stamp(span.start),
            end: Stamp(span.end),
        }
    }

    /// Empty windows are rejected here, before any engine code runs.
    pub fn to_span(&self) -> Result<Span, String> {
        if self.start.0 >= self.end.0 {
            return Err("interval start must be strictly before end".into());
        }
        Ok(Span::new(self.start.0, self.end.0))
    }
}

// ── Error codes ──────────────────────────────────────────────────

/// The closed error-code set. Append-only; codes are never renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    CapacityViolation,
    ExpiredHold,
    IdempotencyReplay,
    RateLimited,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::CapacityViolation => "capacity_violation",
            ErrorCode::ExpiredHold => "expired_hold",
            ErrorCode::IdempotencyReplay => "idempotency_replay",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ── Envelope ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Cmd,
    Evt,
    Qry,
    Rpy,
    Err,
}

/// Every exchanged message. `kind` + `type` discriminate the payload;
/// both are forever verbs — never renamed or reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub id: String,
    pub ts: Stamp,
    pub issuer: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub kind: Kind,
    #[serde(flatten)]
    pub msg: Message,
}

impl Envelope {
    pub fn new(issuer: ActorId, ts: Stamp, kind: Kind, msg: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: Ulid::new().to_string(),
            ts,
            issuer,
            subj: None,
            corr: None,
            caus: None,
            meta: None,
            sig: None,
            kind,
            msg,
        }
    }

    /// Structural checks beyond what serde enforces: version and
    /// kind/type agreement.
    pub fn validate(&self) -> Result<(), String> {
        if self.v != PROTOCOL_VERSION {
            return Err(format!("unsupported envelope version {}", self.v));
        }
        let expected = self.msg.kind();
        if self.kind != expected {
            return Err(format!(
                "kind {:?} does not match type {:?}",
                self.kind, expected
            ));
        }
        Ok(())
    }
}

/// Payloads, tagged by the `type` discriminant. `state.snapshot` names
/// both the query and its reply; the two shapes have disjoint required
/// fields and are told apart untagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    // commands
    #[serde(rename = "supply.delta")]
    SupplyDelta(SupplyDeltaCmd),
    #[serde(rename = "hold.place")]
    HoldPlace(HoldPlaceCmd),
    #[serde(rename = "hold.confirm")]
    HoldConfirm(HoldConfirmCmd),
    #[serde(rename = "hold.release")]
    HoldRelease(HoldReleaseCmd),
    #[serde(rename = "alloc.cancel")]
    AllocCancel(AllocCancelCmd),
    // events
    #[serde(rename = "supply.delta.applied")]
    SupplyDeltaApplied(SupplyDeltaAppliedEvt),
    #[serde(rename = "hold.placed")]
    HoldPlaced(HoldPlacedEvt),
    #[serde(rename = "hold.released")]
    HoldReleased(HoldReleasedEvt),
    #[serde(rename = "alloc.committed")]
    AllocCommitted(AllocCommittedEvt),
    #[serde(rename = "alloc.canceled")]
    AllocCanceled(AllocCanceledEvt),
    #[serde(rename = "state.bootstrap")]
    StateBootstrap(StateBootstrapEvt),
    #[serde(rename = "stream.heartbeat")]
    StreamHeartbeat(StreamHeartbeatEvt),
    // queries and replies
    #[serde(rename = "feasible.check")]
    FeasibleCheck(FeasibleCheckQry),
    #[serde(rename = "feasible.result")]
    FeasibleResult(FeasibleResultRpy),
    #[serde(rename = "freebusy.get")]
    FreebusyGet(FreebusyGetQry),
    #[serde(rename = "freebusy.data")]
    FreebusyData(FreebusyDataRpy),
    #[serde(rename = "cut.create")]
    CutCreate(CutCreateQry),
    #[serde(rename = "cut.created")]
    CutCreated(CutCreatedRpy),
    #[serde(rename = "state.snapshot")]
    StateSnapshot(StateSnapshotMsg),
    #[serde(rename = "stream.open")]
    StreamOpen(StreamOpenQry),
    #[serde(rename = "stream.opened")]
    StreamOpened(StreamOpenedRpy),
    // errors
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::SupplyDelta(_)
            | Message::HoldPlace(_)
            | Message::HoldConfirm(_)
            | Message::HoldRelease(_)
            | Message::AllocCancel(_) => Kind::Cmd,
            Message::SupplyDeltaApplied(_)
            | Message::HoldPlaced(_)
            | Message::HoldReleased(_)
            | Message::AllocCommitted(_)
            | Message::AllocCanceled(_)
            | Message::StateBootstrap(_)
            | Message::StreamHeartbeat(_) => Kind::Evt,
            Message::FeasibleCheck(_)
            | Message::FreebusyGet(_)
            | Message::CutCreate(_)
            | Message::StreamOpen(_) => Kind::Qry,
            Message::FeasibleResult(_)
            | Message::FreebusyData(_)
            | Message::CutCreated(_)
            | Message::StreamOpened(_) => Kind::Rpy,
            Message::StateSnapshot(StateSnapshotMsg::Query(_)) => Kind::Qry,
            Message::StateSnapshot(StateSnapshotMsg::Page(_)) => Kind::Rpy,
            Message::Error(_) => Kind::Err,
        }
    }

    /// Wire form of a committed per-resource event record.
    pub fn from_event(resource: &ResourceId, record: &EventRecord) -> Message {
        let seq = record.seq;
        let source_idem = record.source_idem.clone();
        match &record.body {
            EventBody::SupplyDeltaApplied { span, delta, .. } => {
                Message::SupplyDeltaApplied(SupplyDeltaAppliedEvt {
                    resource: resource.clone(),
                    seq,
                    interval: Window::from_span(span),
                    delta: *delta,
                    source_idem,
                })
            }
            EventBody::HoldPlaced {
                hold_id,
                resources,
                span,
                demands,
                expires_at,
            } => Message::HoldPlaced(HoldPlacedEvt {
                resource: resource.clone(),
                seq,
                hold_id: hold_id.clone(),
                resources: resources.clone(),
                interval: Window::from_span(span),
                demands: demands.clone(),
                expires_at: Stamp(*expires_at),
                source_idem,
            }),
            EventBody::HoldReleased {
                hold_id, reason, ..
            } => Message::HoldReleased(HoldReleasedEvt {
                resource: resource.clone(),
                seq,
                hold_id: hold_id.clone(),
                reason: reason.clone(),
                source_idem,
            }),
            EventBody::AllocCommitted {
                allocation_id,
                hold_id,
                resources,
                span,
                demands,
            } => Message::AllocCommitted(AllocCommittedEvt {
                resource: resource.clone(),
                seq,
                allocation_id: allocation_id.clone(),
                hold_id: hold_id.clone(),
                resources: resources.clone(),
                interval: Window::from_span(span),
                demands: demands.clone(),
                source_idem,
            }),
            EventBody::AllocCanceled {
                allocation_id,
                reason,
                ..
            } => Message::AllocCanceled(AllocCanceledEvt {
                resource: resource.clone(),
                seq,
                allocation_id: allocation_id.clone(),
                reason: reason.clone(),
                source_idem,
            }),
        }
    }
}

// ── Command payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyDeltaCmd {
    pub resource: ResourceId,
    pub interval: Window,
    pub delta: i64,
    pub idem: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldPlaceCmd {
    pub resources: Vec<ResourceId>,
    pub interval: Window,
    pub demands: Vec<i64>,
    pub ttl_sec: i64,
    pub idem: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldConfirmCmd {
    pub hold_id: HoldId,
    pub idem: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldReleaseCmd {
    pub hold_id: HoldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub idem: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocCancelCmd {
    pub allocation_id: AllocationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub idem: IdempotencyKey,
}

// ── Event payloads ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyDeltaAppliedEvt {
    pub resource: ResourceId,
    pub seq: u64,
    pub interval: Window,
    pub delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_idem: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldPlacedEvt {
    pub resource: ResourceId,
    pub seq: u64,
    pub hold_id: HoldId,
    pub resources: Vec<ResourceId>,
    pub interval: Window,
    pub demands: Vec<i64>,
    pub expires_at: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_idem: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldReleasedEvt {
    pub resource: ResourceId,
    pub seq: u64,
    pub hold_id: HoldId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_idem: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocCommittedEvt {
    pub resource: ResourceId,
    pub seq: u64,
    pub allocation_id: AllocationId,
    pub hold_id: HoldId,
    pub resources: Vec<ResourceId>,
    pub interval: Window,
    pub demands: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_idem: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocCanceledEvt {
    pub resource: ResourceId,
    pub seq: u64,
    pub allocation_id: AllocationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_idem: Option<IdempotencyKey>,
}

/// One delta of a projected timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDelta {
    pub at: Stamp,
    pub delta: i64,
}

/// Active hold as carried in a bootstrap frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHold {
    pub hold_id: HoldId,
    pub interval: Window,
    pub demand: i64,
    pub expires_at: Stamp,
}

/// Initial state for one subscribed resource; subsequent events carry
/// `seq > asOfSeq`, strictly in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBootstrapEvt {
    pub resource: ResourceId,
    pub window: Window,
    pub supply: Vec<WireDelta>,
    pub allocation: Vec<WireDelta>,
    pub holds: Vec<WireHold>,
    pub as_of_seq: SeqMark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeartbeatEvt {}

// ── Query / reply payloads ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeasibleCheckQry {
    pub resources: Vec<ResourceId>,
    pub interval: Window,
    pub demands: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeasibleViolation {
    pub resource: ResourceId,
    pub available: i64,
    pub demand: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeasibleResultRpy {
    pub feasible: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FeasibleViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreebusyGetQry {
    pub resource: ResourceId,
    pub window: Window,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSegment {
    pub interval: Window,
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreebusyDataRpy {
    pub resource: ResourceId,
    pub segments: Vec<WireSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutCreateQry {
    pub resources: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutCreatedRpy {
    pub cut_id: CutId,
    pub seqs: BTreeMap<ResourceId, SeqMark>,
    pub issued_at: Stamp,
}

/// The verb `state.snapshot` names both directions; required fields are
/// disjoint so the untagged decode is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateSnapshotMsg {
    Page(StateSnapshotPage),
    Query(StateSnapshotQry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotQry {
    pub cut_id: CutId,
    pub resource: ResourceId,
    pub window: Window,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_after: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotPage {
    pub resource: ResourceId,
    pub seq_hi: SeqMark,
    pub supply: Vec<WireDelta>,
    pub allocation: Vec<WireDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_after: Option<Stamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMark {
    pub resource: ResourceId,
    pub seq_hi: SeqMark,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenQry {
    pub resources: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<ResumeMark>>,
    #[serde(default = "default_true")]
    pub include_bootstrap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_sec: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenedRpy {
    /// Effective heartbeat — the server may clamp below the request.
    pub heartbeat_sec: u32,
    /// Watermarks the tail starts after, one per subscribed resource.
    pub as_of: BTreeMap<ResourceId, SeqMark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(&format!("urn:tap:resource:{s}")).unwrap()
    }

    fn envelope(kind: Kind, msg: Message) -> Envelope {
        let mut env = Envelope::new(ActorId::new("urn:tap:actor:test"), Stamp(1_700_000_000_000), kind, msg);
        env.id = "01ARZ3NDEKTSV4RRFFQ69G5FAV".into();
        env
    }

    #[test]
    fn instant_canonical_form() {
        assert_eq!(Stamp(0).canonical(), "1970-01-01T00:00:00Z");
        assert_eq!(Stamp(1_500).canonical(), "1970-01-01T00:00:01.500Z");
        // no fractional trailing zeros on whole seconds
        assert_eq!(Stamp(2_000).canonical(), "1970-01-01T00:00:02Z");
    }

    #[test]
    fn instant_canonicalization_is_idempotent() {
        for raw in [
            "2026-03-01T09:00:00Z",
            "2026-03-01T09:00:00.250Z",
            "2026-03-01T10:30:00+01:30",
            "2026-03-01T09:00:00.000Z",
        ] {
            let once = Stamp::parse(raw).unwrap().canonical();
            let twice = Stamp::parse(&once).unwrap().canonical();
            assert_eq!(once, twice, "for {raw}");
        }
    }

    #[test]
    fn instant_lexicographic_matches_chronological() {
        let a = Stamp::parse("2026-03-01T09:00:00Z").unwrap();
        let b = Stamp::parse("2026-03-01T09:00:00.001Z").unwrap();
        let c = Stamp::parse("2026-03-01T09:00:01Z").unwrap();
        assert!(a < b && b < c);
        let mut canon = vec![c.canonical(), a.canonical(), b.canonical()];
        canon.sort();
        assert_eq!(canon, vec![a.canonical(), b.canonical(), c.canonical()]);
    }

    #[test]
    fn window_rejects_empty_interval() {
        let w = Window {
            start: Stamp(100),
            end: Stamp(100),
        };
        assert!(w.to_span().is_err());
        let inverted = Window {
            start: Stamp(200),
            end: Stamp(100),
        };
        assert!(inverted.to_span().is_err());
    }

    #[test]
    fn envelope_roundtrip_is_byte_identical() {
        let env = envelope(
            Kind::Cmd,
            Message::HoldPlace(HoldPlaceCmd {
                resources: vec![rid("court-1"), rid("court-2")],
                interval: Window {
                    start: Stamp(1_770_000_000_000),
                    end: Stamp(1_770_003_600_000),
                },
                demands: vec![1, 2],
                ttl_sec: 600,
                idem: IdempotencyKey::new("K1"),
            }),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn envelope_wire_shape() {
        let env = envelope(
            Kind::Cmd,
            Message::SupplyDelta(SupplyDeltaCmd {
                resource: rid("court-1"),
                interval: Window {
                    start: Stamp(0),
                    end: Stamp(3_600_000),
                },
                delta: 1,
                idem: IdempotencyKey::new("K9"),
            }),
        );
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["kind"], "cmd");
        assert_eq!(value["type"], "supply.delta");
        assert_eq!(value["body"]["resource"], "urn:tap:resource:court-1");
        assert_eq!(value["body"]["interval"]["start"], "1970-01-01T00:00:00Z");
        assert!(value.get("subj").is_none()); // absent optionals stay absent
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut env = envelope(
            Kind::Evt,
            Message::CutCreate(CutCreateQry {
                resources: vec![rid("a")],
            }),
        );
        assert!(env.validate().is_err());
        env.kind = Kind::Qry;
        env.validate().unwrap();
    }

    #[test]
    fn snapshot_verb_decodes_both_directions() {
        let qry = Message::StateSnapshot(StateSnapshotMsg::Query(StateSnapshotQry {
            cut_id: CutId::new("C1"),
            resource: rid("a"),
            window: Window {
                start: Stamp(0),
                end: Stamp(1_000),
            },
            page_after: None,
            page_size: Some(2),
        }));
        let page = Message::StateSnapshot(StateSnapshotMsg::Page(StateSnapshotPage {
            resource: rid("a"),
            seq_hi: 41,
            supply: vec![WireDelta {
                at: Stamp(0),
                delta: 3,
            }],
            allocation: vec![],
            next_page_after: None,
        }));
        for (msg, kind) in [(qry, Kind::Qry), (page, Kind::Rpy)] {
            let json = serde_json::to_string(&msg).unwrap();
            let back: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
            assert_eq!(back.kind(), kind);
        }
    }

    #[test]
    fn event_frame_from_record() {
        let record = EventRecord {
            seq: 3,
            ts: 9_000,
            source_idem: Some(IdempotencyKey::new("K1")),
            body: EventBody::HoldPlaced {
                hold_id: HoldId::new("H1"),
                resources: vec![rid("a"), rid("b")],
                span: Span::new(0, 1_000),
                demands: vec![1, 1],
                expires_at: 60_000,
            },
        };
        let msg = Message::from_event(&rid("b"), &record);
        match &msg {
            Message::HoldPlaced(evt) => {
                assert_eq!(evt.resource, rid("b"));
                assert_eq!(evt.seq, 3);
                assert_eq!(evt.hold_id, HoldId::new("H1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(msg.kind(), Kind::Evt);
    }

    #[test]
    fn error_codes_use_snake_case() {
        let body = ErrorBody {
            code: ErrorCode::CapacityViolation,
            message: "no capacity".into(),
            retryable: Some(false),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "capacity_violation");
    }
}
