use crate::model::{Ms, Span};
use crate::timeline::DeltaTimeline;

use super::store::{InMemoryStore, ResourceBook};

// ── Availability Algorithm ────────────────────────────────────────
//
// Availability(R, t) = Supply(R, t) − Allocation(R, t) − LiveHoldDemand(R, t).
// Supply and committed allocation live in the book's timelines; hold
// demand is integrated from the hold table at query time so the TTL
// filter is always current.

/// The availability timeline for one book at `now`.
pub fn availability(store: &InMemoryStore, book: &ResourceBook, now: Ms) -> DeltaTimeline {
    let mut free = book.supply.clone();
    free.subtract(&book.allocation);
    free.subtract(&store.hold_demand(&book.resource, now));
    free
}

/// Minimum availability over `span` — the admission test input.
pub fn min_available(store: &InMemoryStore, book: &ResourceBook, span: &Span, now: Ms) -> i64 {
    availability(store, book, now).min_over(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{HoldId, ResourceId};
    use crate::model::EventBody;

    const H: Ms = 3_600_000;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(&format!("urn:tap:resource:{s}")).unwrap()
    }

    fn book_with_supply(resource: &ResourceId, span: Span, units: i64) -> ResourceBook {
        let mut book = ResourceBook::new(resource.clone());
        book.supply.add_interval_delta(&span, units);
        book
    }

    #[test]
    fn supply_minus_allocation() {
        let r = rid("a");
        let store = InMemoryStore::new();
        let mut book = book_with_supply(&r, Span::new(9 * H, 17 * H), 2);
        book.allocation.add_interval_delta(&Span::new(10 * H, 11 * H), 1);

        let free = availability(&store, &book, 0);
        assert_eq!(free.value_at(9 * H), 2);
        assert_eq!(free.value_at(10 * H + 1), 1);
        assert_eq!(free.value_at(11 * H), 2);
        assert_eq!(min_available(&store, &book, &Span::new(9 * H, 17 * H), 0), 1);
    }

    #[test]
    fn live_holds_reduce_availability() {
        let r = rid("a");
        let store = InMemoryStore::new();
        let book = book_with_supply(&r, Span::new(9 * H, 17 * H), 1);
        store.apply_side_effects(&EventBody::HoldPlaced {
            hold_id: HoldId::new("H1"),
            resources: vec![r.clone()],
            span: Span::new(10 * H, 11 * H),
            demands: vec![1],
            expires_at: 1_000,
        });

        assert_eq!(
            min_available(&store, &book, &Span::new(10 * H, 11 * H), 0),
            0
        );
        // Expired hold no longer counts.
        assert_eq!(
            min_available(&store, &book, &Span::new(10 * H, 11 * H), 1_000),
            1
        );
    }

    #[test]
    fn no_supply_means_negative_under_demand_probe() {
        let r = rid("a");
        let store = InMemoryStore::new();
        let book = ResourceBook::new(r);
        assert_eq!(min_available(&store, &book, &Span::new(0, H), 0), 0);
    }
}
