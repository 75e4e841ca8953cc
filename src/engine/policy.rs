//! Listing-level temporal rules evaluated against a candidate stay.
//!
//! Everything here is a pure function of the policy, the stay and "now".
//! The buffer period needs reservation data and lives in `conflict`.

use chrono::{Datelike, NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Start date must be before end date")]
    InvalidRange,
    #[error("Check-in date is in the past")]
    CheckInInPast,
    #[error("Check-in is beyond the booking window of {0}")]
    BeyondBookingWindow(BookingWindow),
    #[error("Check-in is not allowed on this weekday")]
    RestrictedCheckIn,
    #[error("Check-out is not allowed on this weekday")]
    RestrictedCheckOut,
    #[error("Minimum stay is {0} nights")]
    BelowMinNights(u32),
    #[error("Maximum stay is {0} nights")]
    AboveMaxNights(u32),
    #[error("Same-day bookings close at {0}")]
    PastSameDayCutoff(NaiveTime),
    #[error("Stay is too close to another reservation ({0} buffer)")]
    BufferPeriod(BufferPeriod),
}

/// Validate `stay` against `policy` at wall-clock `now` (UTC). Returns the
/// first failing rule.
pub fn validate_stay(
    policy: &BookingPolicy,
    stay: &StayRange,
    now: NaiveDateTime,
) -> Result<(), PolicyViolation> {
    if stay.check_in >= stay.check_out {
        return Err(PolicyViolation::InvalidRange);
    }
    let today = now.date();
    if stay.check_in < today {
        return Err(PolicyViolation::CheckInInPast);
    }

    if let Some(horizon) = policy.booking_window.horizon(today)
        && stay.check_in > horizon
    {
        return Err(PolicyViolation::BeyondBookingWindow(policy.booking_window));
    }

    if policy.restricted_check_in.contains(stay.check_in.weekday()) {
        return Err(PolicyViolation::RestrictedCheckIn);
    }
    if policy.restricted_check_out.contains(stay.check_out.weekday()) {
        return Err(PolicyViolation::RestrictedCheckOut);
    }

    let nights = stay.nights();
    if let Some(min) = policy.min_nights
        && nights < min
    {
        return Err(PolicyViolation::BelowMinNights(min));
    }
    if let Some(max) = policy.max_nights
        && nights > max
    {
        return Err(PolicyViolation::AboveMaxNights(max));
    }

    if let Some(cutoff) = policy.same_day_cutoff
        && stay.check_in == today
        && now.time() > cutoff
    {
        return Err(PolicyViolation::PastSameDayCutoff(cutoff));
    }

    Ok(())
}
