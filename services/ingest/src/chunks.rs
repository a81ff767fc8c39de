use chrono::{DateTime, Duration, Utc};

/// A bounded `[start, end)` slice of a backfill's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Position on the fixed grid anchored at the backfill's overall start.
    pub index: usize,
}

/// Split `[overall_start, now)` into contiguous fixed-width chunks, oldest
/// first, returning only those not yet covered by `resume`.
///
/// Boundaries sit on the grid `overall_start + k * width` regardless of
/// `now` or `resume`, so re-planning always reproduces the same boundaries
/// and a resumed backfill neither re-requests nor skips a range. A resume
/// point inside a chunk re-plans that whole chunk (safe re-delivery). The
/// final chunk is truncated at `now`, never rounded past it.
pub fn plan(
    overall_start: DateTime<Utc>,
    now: DateTime<Utc>,
    width: Duration,
    resume: Option<DateTime<Utc>>,
) -> Vec<Chunk> {
    if width <= Duration::zero() || now <= overall_start {
        return Vec::new();
    }

    let first_index = match resume {
        Some(r) if r > overall_start => {
            ((r - overall_start).num_seconds() / width.num_seconds()) as usize
        }
        _ => 0,
    };

    let mut chunks = Vec::new();
    let mut index = first_index;
    loop {
        let start = overall_start + width * (index as i32);
        if start >= now {
            break;
        }
        let end = std::cmp::min(start + width, now);
        chunks.push(Chunk { start, end, index });
        index += 1;
    }

    chunks
}
