use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Why a candidate stay cannot take the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarClash {
    /// Overlaps an existing stay.
    Overlap(Ulid),
    /// Does not overlap, but lands inside another stay's buffer period.
    Buffer(Ulid),
}

impl CalendarClash {
    pub fn reservation_id(&self) -> Ulid {
        match self {
            CalendarClash::Overlap(id) | CalendarClash::Buffer(id) => *id,
        }
    }
}

pub(crate) fn validate_range(
    check_in: NaiveDate,
    check_out: NaiveDate,
) -> Result<StayRange, EngineError> {
    use crate::limits::*;
    if check_in >= check_out {
        return Err(EngineError::validation("Start date must be before end date"));
    }
    if (check_out - check_in).num_days() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(StayRange::new(check_in, check_out))
}

/// First calendar-holding reservation that clashes with `stay`, ignoring
/// `exclude`. Overlap is `a.in < b.out && b.in < a.out`; with a buffer of N
/// nights the candidate is widened by N on both sides.
pub(crate) fn find_clash(
    ls: &ListingState,
    stay: &StayRange,
    exclude: Option<Ulid>,
) -> Option<CalendarClash> {
    let buffer = ls.listing.policy.buffer_period.nights();
    let search = stay.widened(buffer);
    let mut buffered = None;
    for r in ls.overlapping(&search) {
        if Some(r.id) == exclude || !r.status.holds_calendar() {
            continue;
        }
        if r.stay.overlaps(stay) {
            return Some(CalendarClash::Overlap(r.id));
        }
        buffered.get_or_insert(CalendarClash::Buffer(r.id));
    }
    buffered
}

pub(crate) fn check_no_conflict(
    ls: &ListingState,
    stay: &StayRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_clash(ls, stay, exclude) {
        None => Ok(()),
        Some(clash) => Err(EngineError::Conflict(clash.reservation_id())),
    }
}
