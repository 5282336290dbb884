use crate::model::TimeRange;

// ── Free-slot algorithm ───────────────────────────────────────────

/// Gaps of `window` not covered by `committed`, at least `min_minutes` long.
/// `committed` must be sorted by start.
pub fn free_slots(window: &TimeRange, committed: &[TimeRange], min_minutes: i64) -> Vec<TimeRange> {
    subtract_ranges(&[*window], &merge_overlapping(committed))
        .into_iter()
        .filter(|r| r.duration_minutes() >= min_minutes)
        .collect()
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start() <= last.end()
        {
            if range.end() > last.end()
                && let Ok(grown) = TimeRange::new(last.start(), range.end())
            {
                *last = grown;
            }
            continue;
        }
        merged.push(range);
    }
    merged
}

/// Both inputs sorted and disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut current_start = b.start();
        let current_end = b.end();

        while ri < to_remove.len() && to_remove[ri].end() <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < current_end {
            let r = &to_remove[j];
            if let Ok(gap) = TimeRange::new(current_start, r.start()) {
                result.push(gap);
            }
            current_start = current_start.max(r.end());
            j += 1;
        }

        if let Ok(tail) = TimeRange::new(current_start, current_end) {
            result.push(tail);
        }
    }

    result
}
