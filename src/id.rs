use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_URN_OPAQUE_LEN;

/// Declares a tagged opaque-string identifier kind. Each kind is a distinct
/// type: a `HoldId` never passes where an `AllocationId` is expected.
macro_rules! id_kind {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Mint a fresh id.
            pub fn mint() -> Self {
                Self(Ulid::new().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fmt_debug_id!($name);
        }
    };
}

macro_rules! fmt_debug_id {
    ($name:ident) => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, concat!(stringify!($name), "({})"), self.0)
        }
    };
}

id_kind!(
    /// The party issuing a command or owning a subscription.
    ActorId
);
id_kind!(
    /// A bookable time slot advertised by a node.
    SlotId
);
id_kind!(
    /// A short-lived reservation; becomes an allocation on confirm.
    HoldId
);
id_kind!(
    /// A buyer-side order grouping one or more holds.
    OrderId
);
id_kind!(
    /// A committed allocation minted by `hold.confirm`.
    AllocationId
);
id_kind!(
    /// A cross-resource watermark issued by `cut.create`.
    CutId
);
id_kind!(
    /// Client-supplied token binding a command attempt to one outcome.
    IdempotencyKey
);

const URN_PREFIX: &str = "urn:tap:resource:";

/// Resource identifier: `urn:tap:resource:<opaque>` with a printable-ASCII
/// opaque segment of length 1–128. Lexicographic `Ord` on the full urn is
/// the global lock-acquisition order for multi-resource commands.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Validate and adopt a resource urn.
    pub fn parse(raw: &str) -> Result<Self, BadResourceUrn> {
        let opaque = raw.strip_prefix(URN_PREFIX).ok_or(BadResourceUrn)?;
        if opaque.is_empty() || opaque.len() > MAX_URN_OPAQUE_LEN {
            return Err(BadResourceUrn);
        }
        if !opaque.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
            return Err(BadResourceUrn);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourceId {
    fmt_debug_id!(ResourceId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadResourceUrn;

impl fmt::Display for BadResourceUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource id must be urn:tap:resource:<opaque> (printable ASCII, 1-128 chars)")
    }
}

impl std::error::Error for BadResourceUrn {}
