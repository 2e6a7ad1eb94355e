use crate::id::ResourceId;
use crate::limits::*;
use crate::model::Span;

use super::availability::availability;
use super::{Engine, EngineError};

/// Reply body of `feasible.check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeasibleReport {
    pub feasible: bool,
    pub shortfalls: Vec<FeasibleShortfall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeasibleShortfall {
    pub resource: ResourceId,
    pub available: i64,
    pub demand: i64,
}

impl Engine {
    /// `feasible.check` — a dry-run admission test: would `hold.place`
    /// with these demands succeed right now? Reads only; commands racing
    /// this query re-validate under their own locks.
    pub async fn feasible_check(
        &self,
        resources: &[ResourceId],
        span: Span,
        demands: &[i64],
    ) -> Result<FeasibleReport, EngineError> {
        if resources.is_empty() || resources.len() > MAX_RESOURCES_PER_COMMAND {
            return Err(EngineError::bad_request("resource count out of range"));
        }
        if demands.len() != resources.len() {
            return Err(EngineError::bad_request(
                "demands must pair one-to-one with resources",
            ));
        }
        validate_window(&span)?;

        let now = self.now();
        let mut shortfalls = Vec::new();
        for (resource, demand) in resources.iter().zip(demands) {
            let book = self.store.book(resource);
            let guard = book.read().await;
            let available = availability(&self.store, &guard, now).min_over(&span);
            drop(guard);
            if available < *demand {
                shortfalls.push(FeasibleShortfall {
                    resource: resource.clone(),
                    available,
                    demand: *demand,
                });
            }
        }
        Ok(FeasibleReport {
            feasible: shortfalls.is_empty(),
            shortfalls,
        })
    }

    /// `freebusy.get` — the availability step function over a window as
    /// ordered segments.
    pub async fn freebusy(
        &self,
        resource: &ResourceId,
        window: Span,
    ) -> Result<Vec<(Span, i64)>, EngineError> {
        validate_window(&window)?;
        let now = self.now();
        let book = self.store.book(resource);
        let guard = book.read().await;
        let free = availability(&self.store, &guard, now);
        drop(guard);
        Ok(free.segments(&window))
    }
}

fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::bad_request(
            "window start must be strictly before end",
        ));
    }
    if window.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::bad_request("window too wide"));
    }
    Ok(())
}
