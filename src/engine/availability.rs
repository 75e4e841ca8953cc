use chrono::NaiveDate;

use crate::model::*;

/// Whether a single date is open. An override containing the date wins in
/// either direction; otherwise the listing default applies.
pub fn is_date_open<'a>(
    default_availability: bool,
    overrides: impl IntoIterator<Item = &'a AvailabilityOverride>,
    date: NaiveDate,
) -> bool {
    overrides
        .into_iter()
        .find(|o| o.deleted_at.is_none() && o.span.contains(date))
        .map_or(default_availability, |o| o.available)
}

/// Whether every night of `stay` is bookable.
///
/// A single `true` override that covers the whole stay opens it even when
/// other overrides or the default would close individual nights.
pub fn is_stay_open(
    default_availability: bool,
    overrides: &[AvailabilityOverride],
    stay: &StayRange,
) -> bool {
    let covered_by_opening = overrides
        .iter()
        .any(|o| o.deleted_at.is_none() && o.available && o.span.covers_stay(stay));
    if covered_by_opening {
        return true;
    }
    stay
        .nights_iter()
        .all(|date| is_date_open(default_availability, overrides, date))
}
