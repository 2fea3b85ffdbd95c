use std::time::Duration;

use tracing::debug;

use super::TimeRange;

/// Merge near-adjacent segments and keep the result within `budget`.
///
/// Segments must be time-ordered. A segment starting within `max_gap` of the
/// running segment's end is absorbed into it. Merged segments that would push
/// the total past `budget` are dropped whole, never truncated.
pub fn merge_segments(segments: &[TimeRange], max_gap: Duration, budget: Duration) -> Vec<TimeRange> {
    let mut merged = Vec::new();
    let mut total = Duration::ZERO;
    let mut current: Option<TimeRange> = None;

    for segment in segments {
        let Some(mut running) = current else {
            current = Some(*segment);
            continue;
        };

        if segment.start.saturating_sub(running.end) <= max_gap {
            running.end = running.end.max(segment.end);
            current = Some(running);
            continue;
        }

        commit(&mut merged, &mut total, running, budget);
        current = Some(*segment);
    }

    if let Some(running) = current {
        commit(&mut merged, &mut total, running, budget);
    }

    merged
}

fn commit(merged: &mut Vec<TimeRange>, total: &mut Duration, segment: TimeRange, budget: Duration) {
    let duration = segment.duration();
    if *total + duration <= budget {
        *total += duration;
        merged.push(segment);
    } else {
        debug!(
            "Dropping {:.2}s segment at {:.2}s: budget {:.2}s already holds {:.2}s",
            duration.as_secs_f64(),
            segment.start.as_secs_f64(),
            budget.as_secs_f64(),
            total.as_secs_f64()
        );
    }
}
