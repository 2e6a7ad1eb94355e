//! tapline — a federated time-allocation engine.
//!
//! Supply and demand of time-indexed bookable inventory, tracked as an
//! append-only per-resource log of supply and allocation deltas. The
//! engine validates mutations against a zero-sum availability invariant
//! (confirmed allocations never exceed published supply at any instant),
//! emits authoritative per-resource ordered events, serves point-in-time
//! snapshots identified by cross-resource cuts, and streams resumable
//! event tails with optional in-stream bootstrap.
//!
//! Transports, auth, and discovery live outside this crate; the engine
//! speaks [`wire`] envelopes at its edges and owns everything between
//! command validation and durable commit.

pub mod clock;
pub mod config;
pub mod engine;
pub mod id;
pub mod limits;
pub mod model;
pub mod observability;
pub mod stream;
pub mod sweeper;
pub mod timeline;
pub mod wal;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{CommandOutcome, Engine, EngineError, FeasibleReport, SnapshotPage};
pub use stream::{StreamFrame, StreamOpened, StreamRequest, Subscription};
pub use timeline::DeltaTimeline;
