use serde::{Deserialize, Serialize};

use crate::model::{Ms, Span};

/// Piecewise-constant integer function of time: a baseline plus sorted
/// signed deltas at unique instants. Supply, allocation, and hold demand
/// are all sums of interval deltas, so one structure backs them all.
///
/// Coincident instants coalesce on insert; entries that sum to zero are
/// dropped. A prefix-sum cache keeps `value_at` at O(log n).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "TimelineRepr", into = "TimelineRepr")]
pub struct DeltaTimeline {
    baseline: i64,
    deltas: Vec<(Ms, i64)>,
    prefix: Vec<i64>,
}

#[derive(Serialize, Deserialize)]
struct TimelineRepr {
    baseline: i64,
    deltas: Vec<(Ms, i64)>,
}

impl From<TimelineRepr> for DeltaTimeline {
    fn from(repr: TimelineRepr) -> Self {
        let mut tl = Self {
            baseline: repr.baseline,
            deltas: repr.deltas,
            prefix: Vec::new(),
        };
        tl.rebuild_prefix();
        tl
    }
}

impl From<DeltaTimeline> for TimelineRepr {
    fn from(tl: DeltaTimeline) -> Self {
        Self {
            baseline: tl.baseline,
            deltas: tl.deltas,
        }
    }
}

impl DeltaTimeline {
    pub fn new(baseline: i64) -> Self {
        Self {
            baseline,
            deltas: Vec::new(),
            prefix: Vec::new(),
        }
    }

    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    pub fn entries(&self) -> &[(Ms, i64)] {
        &self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn rebuild_prefix(&mut self) {
        self.prefix.clear();
        let mut sum = 0i64;
        self.prefix.extend(self.deltas.iter().map(|&(_, d)| {
            sum += d;
            sum
        }));
    }

    /// Add `delta` at a single instant, coalescing with an existing entry.
    pub fn add_delta(&mut self, at: Ms, delta: i64) {
        if delta == 0 {
            return;
        }
        match self.deltas.binary_search_by_key(&at, |&(t, _)| t) {
            Ok(pos) => {
                self.deltas[pos].1 += delta;
                if self.deltas[pos].1 == 0 {
                    self.deltas.remove(pos);
                }
            }
            Err(pos) => self.deltas.insert(pos, (at, delta)),
        }
        self.rebuild_prefix();
    }

    /// `+delta` at `span.start`, `-delta` at `span.end`.
    pub fn add_interval_delta(&mut self, span: &Span, delta: i64) {
        self.add_delta(span.start, delta);
        self.add_delta(span.end, -delta);
    }

    /// `baseline + Σ dᵢ for tᵢ ≤ t`.
    pub fn value_at(&self, t: Ms) -> i64 {
        let idx = self.deltas.partition_point(|&(ti, _)| ti <= t);
        if idx == 0 {
            self.baseline
        } else {
            self.baseline + self.prefix[idx - 1]
        }
    }

    /// Minimum value over `[window.start, window.end)`. On an empty
    /// timeline this is the baseline.
    pub fn min_over(&self, window: &Span) -> i64 {
        let mut running = self.value_at(window.start);
        let mut min = running;
        let lo = self.deltas.partition_point(|&(t, _)| t <= window.start);
        for &(t, d) in &self.deltas[lo..] {
            if t >= window.end {
                break;
            }
            running += d;
            min = min.min(running);
        }
        min
    }

    /// Union of deltas, summing at coincident instants. Baselines add.
    pub fn merge(&mut self, other: &DeltaTimeline) {
        self.baseline += other.baseline;
        let mut merged = Vec::with_capacity(self.deltas.len() + other.deltas.len());
        let (a, b) = (&self.deltas, &other.deltas);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].0.cmp(&b[j].0) {
                std::cmp::Ordering::Less => {
                    merged.push(a[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(b[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    let sum = a[i].1 + b[j].1;
                    if sum != 0 {
                        merged.push((a[i].0, sum));
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&a[i..]);
        merged.extend_from_slice(&b[j..]);
        self.deltas = merged;
        self.rebuild_prefix();
    }

    /// Sign-flipped copy.
    pub fn negated(&self) -> DeltaTimeline {
        let mut out = DeltaTimeline::new(-self.baseline);
        out.deltas = self.deltas.iter().map(|&(t, d)| (t, -d)).collect();
        out.rebuild_prefix();
        out
    }

    /// Pointwise subtraction: `self − other`.
    pub fn subtract(&mut self, other: &DeltaTimeline) {
        self.merge(&other.negated());
    }

    /// Project onto `window`, preserving the value function from
    /// `window.start` onward: deltas before the window coalesce into one
    /// entry at `window.start`, deltas at or past its end into one entry
    /// at `window.end`. Before the window the clipped value is the
    /// baseline.
    pub fn clip(&self, window: &Span) -> DeltaTimeline {
        let mut head = 0i64;
        let mut tail = 0i64;
        let mut inside = Vec::new();
        for &(t, d) in &self.deltas {
            if t < window.start {
                head += d;
            } else if t >= window.end {
                tail += d;
            } else {
                inside.push((t, d));
            }
        }
        let mut clipped = DeltaTimeline::new(self.baseline);
        clipped.deltas = inside;
        clipped.rebuild_prefix();
        // Coalesce with any in-window entry already sitting on the boundary.
        clipped.add_delta(window.start, head);
        clipped.add_delta(window.end, tail);
        clipped
    }

    /// Piecewise-constant segments covering `window`, in order.
    pub fn segments(&self, window: &Span) -> Vec<(Span, i64)> {
        let mut out = Vec::new();
        let mut value = self.value_at(window.start);
        let mut cursor = window.start;
        let lo = self.deltas.partition_point(|&(t, _)| t <= window.start);
        for &(t, d) in &self.deltas[lo..] {
            if t >= window.end {
                break;
            }
            if t > cursor {
                out.push((Span::new(cursor, t), value));
            }
            value += d;
            cursor = t;
        }
        if cursor < window.end {
            out.push((Span::new(cursor, window.end), value));
        }
        out
    }
}
