use crate::model::*;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Bookable start instants within one shift.
///
/// Walks `cursor` from `shift.start` in `step` increments while
/// `cursor + duration <= shift.end`. A candidate `[cursor, cursor + duration)`
/// is emitted unless it overlaps a busy interval or starts before `now`.
/// The cursor advances by `step` whether or not the candidate was emitted.
///
/// Pure and lazy. Clone the result to walk it again.
pub fn compute_slots(shift: Span, duration: Ms, step: Ms, now: Ms, busy: Vec<Span>) -> Slots {
    let mut busy = busy;
    busy.retain(|b| b.overlaps(&shift));
    busy.sort_by_key(|s| s.start);
    Slots {
        cursor: shift.start,
        shift_end: shift.end,
        duration,
        step,
        now,
        busy: merge_overlapping(&busy),
    }
}

#[derive(Debug, Clone)]
pub struct Slots {
    cursor: Ms,
    shift_end: Ms,
    duration: Ms,
    step: Ms,
    now: Ms,
    /// Sorted, disjoint.
    busy: Vec<Span>,
}

impl Slots {
    /// A sequence that yields nothing.
    pub fn empty() -> Self {
        Self {
            cursor: 0,
            shift_end: 0,
            duration: 1,
            step: 1,
            now: 0,
            busy: Vec::new(),
        }
    }

    fn collides(&self, candidate: &Span) -> bool {
        // First busy span ending after the candidate starts is the only one
        // that can overlap, since busy spans are disjoint and sorted.
        let idx = self.busy.partition_point(|b| b.end <= candidate.start);
        self.busy
            .get(idx)
            .is_some_and(|b| b.start < candidate.end)
    }
}

impl Iterator for Slots {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        if self.duration <= 0 || self.step <= 0 {
            return None;
        }
        while self.cursor + self.duration <= self.shift_end {
            let start = self.cursor;
            self.cursor += self.step;
            let candidate = Span::new(start, start + self.duration);
            if self.collides(&candidate) || start < self.now {
                continue;
            }
            return Some(start);
        }
        None
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}
