use crate::id::{AllocationId, HoldId, IdempotencyKey, ResourceId};
use crate::limits::*;
use crate::model::{
    AllocationState, EventBody, EventRecord, HoldState, Ms, Span, EXPIRED_REASON,
};

use super::availability::min_available;
use super::store::IdemBegin;
use super::{command_hash, Engine, EngineError, IdemClaim};

/// What a command returns: the events it committed (or originally
/// committed, when `replayed`).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub replayed: bool,
    pub events: Vec<(ResourceId, EventRecord)>,
}

impl CommandOutcome {
    pub fn hold_id(&self) -> Option<HoldId> {
        self.events.first().and_then(|(_, e)| match &e.body {
            EventBody::HoldPlaced { hold_id, .. }
            | EventBody::HoldReleased { hold_id, .. }
            | EventBody::AllocCommitted { hold_id, .. } => Some(hold_id.clone()),
            _ => None,
        })
    }

    pub fn allocation_id(&self) -> Option<AllocationId> {
        self.events.first().and_then(|(_, e)| match &e.body {
            EventBody::AllocCommitted { allocation_id, .. }
            | EventBody::AllocCanceled { allocation_id, .. } => Some(allocation_id.clone()),
            _ => None,
        })
    }

    pub fn seq_on(&self, resource: &ResourceId) -> Option<u64> {
        self.events
            .iter()
            .find(|(r, _)| r == resource)
            .map(|(_, e)| e.seq)
    }
}

fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::bad_request(
            "interval start must be strictly before end",
        ));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::bad_request("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::bad_request("interval too wide"));
    }
    Ok(())
}

fn validate_idem(key: &IdempotencyKey) -> Result<(), EngineError> {
    if key.as_str().is_empty() || key.as_str().len() > MAX_IDEM_KEY_LEN {
        return Err(EngineError::bad_request("idempotency key length"));
    }
    Ok(())
}

fn validate_reason(reason: Option<&String>) -> Result<(), EngineError> {
    if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(EngineError::bad_request("reason too long"));
    }
    Ok(())
}

impl Engine {
    /// Idempotency gate shared by every command. `Ok(Some(..))` is a
    /// replay of the original outcome — no side effects, not an error.
    fn begin_idem(
        &self,
        key: &IdempotencyKey,
        hash: [u8; 32],
    ) -> Result<(Option<CommandOutcome>, Option<IdemClaim<'_>>), EngineError> {
        match self.store.idem_begin(key) {
            IdemBegin::Fresh => Ok((None, Some(IdemClaim::new(&self.store, key.clone())))),
            IdemBegin::InFlight => Err(EngineError::IdemConflict(format!(
                "key {key} is bound to a command still in flight"
            ))),
            IdemBegin::Done(outcome) => {
                if outcome.command_hash != hash {
                    return Err(EngineError::IdemConflict(format!(
                        "key {key} was bound to a different command"
                    )));
                }
                Ok((
                    Some(CommandOutcome {
                        replayed: true,
                        events: outcome.events,
                    }),
                    None,
                ))
            }
        }
    }

    /// `supply.delta` — append a supply step to one resource. Reductions
    /// must not drive availability negative anywhere in the interval;
    /// live hold demand counts, so a hold can never be stranded by a
    /// later supply withdrawal.
    pub async fn supply_delta(
        &self,
        resource: ResourceId,
        span: Span,
        delta: i64,
        idem: IdempotencyKey,
    ) -> Result<CommandOutcome, EngineError> {
        validate_span(&span)?;
        validate_idem(&idem)?;
        if delta == 0 {
            return Err(EngineError::bad_request("delta must be nonzero"));
        }
        let hash = command_hash("supply.delta", &(&resource, &span, delta));
        let (replay, claim) = self.begin_idem(&idem, hash)?;
        if let Some(outcome) = replay {
            return Ok(outcome);
        }
        let claim = claim.expect("fresh idem claim");

        let mut guards = self.lock_books(std::slice::from_ref(&resource)).await;
        let now = self.now();

        if delta < 0 {
            let available = min_available(&self.store, &guards[0].1, &span, now);
            if available + delta < 0 {
                return Err(EngineError::CapacityViolation {
                    resource,
                    available,
                    demand: -delta,
                });
            }
        }

        let event = EventRecord {
            seq: guards[0].1.next_seq(),
            ts: now,
            source_idem: Some(idem.clone()),
            body: EventBody::SupplyDeltaApplied {
                resource: resource.clone(),
                span,
                delta,
            },
        };
        let events = self
            .commit(&mut guards, Some((&idem, hash)), vec![(resource, event)])
            .await?;
        claim.commit();
        Ok(CommandOutcome {
            replayed: false,
            events,
        })
    }

    /// `hold.place` — reserve capacity on one or more resources for a
    /// TTL. Admission is all-or-nothing: every resource must clear its
    /// demand or no event appears anywhere.
    pub async fn place_hold(
        &self,
        resources: Vec<ResourceId>,
        span: Span,
        demands: Vec<i64>,
        ttl_sec: i64,
        idem: IdempotencyKey,
    ) -> Result<CommandOutcome, EngineError> {
        validate_span(&span)?;
        validate_idem(&idem)?;
        if resources.is_empty() || resources.len() > MAX_RESOURCES_PER_COMMAND {
            return Err(EngineError::bad_request("resource count out of range"));
        }
        if demands.len() != resources.len() {
            return Err(EngineError::bad_request(
                "demands must pair one-to-one with resources",
            ));
        }
        let mut unique = resources.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != resources.len() {
            return Err(EngineError::bad_request("duplicate resource in hold"));
        }
        if demands.iter().any(|&d| d < 1) {
            return Err(EngineError::bad_request("demands must be positive"));
        }
        if !(MIN_HOLD_TTL_SEC..=MAX_HOLD_TTL_SEC).contains(&ttl_sec) {
            return Err(EngineError::bad_request("ttl out of range"));
        }

        let hash = command_hash("hold.place", &(&resources, &span, &demands, ttl_sec));
        let (replay, claim) = self.begin_idem(&idem, hash)?;
        if let Some(outcome) = replay {
            return Ok(outcome);
        }
        let claim = claim.expect("fresh idem claim");

        let mut guards = self.lock_books(&resources).await;
        let now = self.now();

        for (resource, demand) in resources.iter().zip(&demands) {
            let (_, guard) = guards
                .iter()
                .find(|(r, _)| r == resource)
                .expect("hold resource is locked");
            let available = min_available(&self.store, guard, &span, now);
            if available < *demand {
                return Err(EngineError::CapacityViolation {
                    resource: resource.clone(),
                    available,
                    demand: *demand,
                });
            }
        }

        let hold_id = HoldId::mint();
        let expires_at = now + ttl_sec * 1_000;
        let body = EventBody::HoldPlaced {
            hold_id,
            resources: resources.clone(),
            span,
            demands,
            expires_at,
        };
        let events = self.fan_out(&guards, &resources, now, Some(&idem), &body);
        let events = self.commit(&mut guards, Some((&idem, hash)), events).await?;
        claim.commit();
        Ok(CommandOutcome {
            replayed: false,
            events,
        })
    }

    /// `hold.confirm` — turn an Active, unexpired hold into a committed
    /// allocation. An overdue hold gets its lazy expiry record here (the
    /// first observation) and the confirm fails `expired_hold`.
    pub async fn confirm_hold(
        &self,
        hold_id: HoldId,
        idem: IdempotencyKey,
    ) -> Result<CommandOutcome, EngineError> {
        validate_idem(&idem)?;
        let hash = command_hash("hold.confirm", &hold_id);
        let (replay, claim) = self.begin_idem(&idem, hash)?;
        if let Some(outcome) = replay {
            return Ok(outcome);
        }
        let claim = claim.expect("fresh idem claim");

        let hold = self
            .store
            .hold(&hold_id)
            .ok_or_else(|| EngineError::HoldNotFound(hold_id.clone()))?;
        let mut guards = self.lock_books(&hold.resources).await;
        let now = self.now();
        // Re-read under the locks; the hold may have moved since the
        // unlocked lookup.
        let hold = self
            .store
            .hold(&hold_id)
            .ok_or_else(|| EngineError::HoldNotFound(hold_id.clone()))?;

        match hold.state {
            HoldState::Active if hold.expires_at > now => {}
            HoldState::Active => {
                self.emit_expiry(&mut guards, &hold, now).await?;
                return Err(EngineError::ExpiredHold(hold_id));
            }
            HoldState::Expired => return Err(EngineError::ExpiredHold(hold_id)),
            HoldState::Confirmed | HoldState::Released => {
                return Err(EngineError::HoldNotFound(hold_id));
            }
        }

        let allocation_id = AllocationId::mint();
        let body = EventBody::AllocCommitted {
            allocation_id,
            hold_id: hold.id.clone(),
            resources: hold.resources.clone(),
            span: hold.span,
            demands: hold.demands.clone(),
        };
        let events = self.fan_out(&guards, &hold.resources, now, Some(&idem), &body);
        let events = self.commit(&mut guards, Some((&idem, hash)), events).await?;
        claim.commit();
        Ok(CommandOutcome {
            replayed: false,
            events,
        })
    }

    /// `hold.release` — explicitly drop an Active hold. An overdue hold
    /// is expired instead and the release reports `not_found`: the hold
    /// was no longer active when the command arrived.
    pub async fn release_hold(
        &self,
        hold_id: HoldId,
        reason: Option<String>,
        idem: IdempotencyKey,
    ) -> Result<CommandOutcome, EngineError> {
        validate_idem(&idem)?;
        validate_reason(reason.as_ref())?;
        let hash = command_hash("hold.release", &(&hold_id, &reason));
        let (replay, claim) = self.begin_idem(&idem, hash)?;
        if let Some(outcome) = replay {
            return Ok(outcome);
        }
        let claim = claim.expect("fresh idem claim");

        let hold = self
            .store
            .hold(&hold_id)
            .ok_or_else(|| EngineError::HoldNotFound(hold_id.clone()))?;
        let mut guards = self.lock_books(&hold.resources).await;
        let now = self.now();
        let hold = self
            .store
            .hold(&hold_id)
            .ok_or_else(|| EngineError::HoldNotFound(hold_id.clone()))?;

        match hold.state {
            HoldState::Active if hold.expires_at > now => {}
            HoldState::Active => {
                self.emit_expiry(&mut guards, &hold, now).await?;
                return Err(EngineError::HoldNotFound(hold_id));
            }
            _ => return Err(EngineError::HoldNotFound(hold_id)),
        }

        let body = EventBody::HoldReleased {
            hold_id: hold.id.clone(),
            resources: hold.resources.clone(),
            span: hold.span,
            demands: hold.demands.clone(),
            reason,
        };
        let events = self.fan_out(&guards, &hold.resources, now, Some(&idem), &body);
        let events = self.commit(&mut guards, Some((&idem, hash)), events).await?;
        claim.commit();
        Ok(CommandOutcome {
            replayed: false,
            events,
        })
    }

    /// `alloc.cancel` — return a committed allocation's capacity.
    pub async fn cancel_alloc(
        &self,
        allocation_id: AllocationId,
        reason: Option<String>,
        idem: IdempotencyKey,
    ) -> Result<CommandOutcome, EngineError> {
        validate_idem(&idem)?;
        validate_reason(reason.as_ref())?;
        let hash = command_hash("alloc.cancel", &(&allocation_id, &reason));
        let (replay, claim) = self.begin_idem(&idem, hash)?;
        if let Some(outcome) = replay {
            return Ok(outcome);
        }
        let claim = claim.expect("fresh idem claim");

        let alloc = self
            .store
            .allocation(&allocation_id)
            .ok_or_else(|| EngineError::AllocationNotFound(allocation_id.clone()))?;
        let mut guards = self.lock_books(&alloc.resources).await;
        let now = self.now();
        let alloc = self
            .store
            .allocation(&allocation_id)
            .ok_or_else(|| EngineError::AllocationNotFound(allocation_id.clone()))?;
        if alloc.state != AllocationState::Committed {
            return Err(EngineError::AllocationNotFound(allocation_id));
        }

        let body = EventBody::AllocCanceled {
            allocation_id: alloc.id.clone(),
            hold_id: alloc.hold_id.clone(),
            resources: alloc.resources.clone(),
            span: alloc.span,
            demands: alloc.demands.clone(),
            reason,
        };
        let events = self.fan_out(&guards, &alloc.resources, now, Some(&idem), &body);
        let events = self.commit(&mut guards, Some((&idem, hash)), events).await?;
        claim.commit();
        Ok(CommandOutcome {
            replayed: false,
            events,
        })
    }

    /// Emit the lazy expiry record for an overdue Active hold. Called by
    /// the sweeper and by commands that observe the expiry first-hand.
    /// Returns false when somebody else already moved the hold.
    pub async fn expire_hold(&self, hold_id: &HoldId) -> Result<bool, EngineError> {
        let Some(hold) = self.store.hold(hold_id) else {
            return Ok(false);
        };
        let mut guards = self.lock_books(&hold.resources).await;
        let now = self.now();
        let Some(hold) = self.store.hold(hold_id) else {
            return Ok(false);
        };
        if hold.state != HoldState::Active || hold.expires_at > now {
            return Ok(false);
        }
        self.emit_expiry(&mut guards, &hold, now).await?;
        Ok(true)
    }

    async fn emit_expiry(
        &self,
        guards: &mut [(ResourceId, tokio::sync::OwnedRwLockWriteGuard<super::ResourceBook>)],
        hold: &crate::model::Hold,
        now: Ms,
    ) -> Result<(), EngineError> {
        let body = EventBody::HoldReleased {
            hold_id: hold.id.clone(),
            resources: hold.resources.clone(),
            span: hold.span,
            demands: hold.demands.clone(),
            reason: Some(EXPIRED_REASON.into()),
        };
        let events = self.fan_out(guards, &hold.resources, now, None, &body);
        self.commit(guards, None, events).await?;
        Ok(())
    }

    /// Rewrite the WAL as a single checkpoint of current state. The
    /// pre-checkpoint tail disappears from disk; retained in-memory tails
    /// are untouched (see `truncate_at`).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut books = Vec::new();
        for resource in self.store.book_ids() {
            let book = self.store.book(&resource);
            let guard = book.read().await;
            books.push(super::store::book_state(&guard));
        }
        let checkpoint = self.store.checkpoint_with(books);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact {
                checkpoint: Box::new(checkpoint),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Drop retained log tails up to a cut's watermarks. Resumes past the
    /// cut keep working; older marks fail `not_found` and fall back to
    /// cut + snapshot.
    pub async fn truncate_at(&self, cut: &crate::model::Cut) {
        for (resource, mark) in &cut.seqs {
            if *mark < 0 {
                continue;
            }
            let book = self.store.book(resource);
            let mut guard = book.write().await;
            guard.truncate_before(*mark as u64 + 1);
        }
    }

    /// One event per listed resource, same body, each with its book's
    /// next seq. The caller holds every listed book's write lock.
    fn fan_out(
        &self,
        guards: &[(ResourceId, tokio::sync::OwnedRwLockWriteGuard<super::ResourceBook>)],
        resources: &[ResourceId],
        ts: Ms,
        source_idem: Option<&IdempotencyKey>,
        body: &EventBody,
    ) -> Vec<(ResourceId, EventRecord)> {
        resources
            .iter()
            .map(|resource| {
                let (_, guard) = guards
                    .iter()
                    .find(|(r, _)| r == resource)
                    .expect("fan-out resource is locked");
                (
                    resource.clone(),
                    EventRecord {
                        seq: guard.next_seq(),
                        ts,
                        source_idem: source_idem.cloned(),
                        body: body.clone(),
                    },
                )
            })
            .collect()
    }
}
