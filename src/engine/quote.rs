use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::model::{Reservation, ReservationDraft};

use super::EngineError;

/// Material terms bound by the book hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteTerms {
    pub listing_id: Ulid,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub night_staying: u32,
    pub total_price: f64,
    pub guest_number: u32,
}

impl From<&ReservationDraft> for QuoteTerms {
    fn from(d: &ReservationDraft) -> Self {
        Self {
            listing_id: d.listing_id,
            check_in_date: d.check_in_date,
            check_out_date: d.check_out_date,
            night_staying: d.night_staying,
            total_price: d.total_price,
            guest_number: d.guest_number,
        }
    }
}

impl From<&Reservation> for QuoteTerms {
    fn from(r: &Reservation) -> Self {
        Self {
            listing_id: r.listing_id,
            check_in_date: r.stay.check_in,
            check_out_date: r.stay.check_out,
            night_staying: r.night_staying,
            total_price: r.total_price,
            guest_number: r.guest_number,
        }
    }
}

/// Lowercase hex SHA-256 of
/// `{listing_id}-{check_in}-{check_out}-{nights}-{total_price}-{guests}`.
/// Prices use the shortest round-trip decimal form, so `1500.0` hashes as `1500`.
pub fn book_hash(terms: &QuoteTerms) -> String {
    let material = format!(
        "{}-{}-{}-{}-{}-{}",
        terms.listing_id,
        terms.check_in_date.format("%Y-%m-%d"),
        terms.check_out_date.format("%Y-%m-%d"),
        terms.night_staying,
        terms.total_price,
        terms.guest_number,
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

pub fn verify(terms: &QuoteTerms, claimed: Option<&str>) -> Result<(), EngineError> {
    let claimed = match claimed.map(str::trim) {
        Some(h) if !h.is_empty() => h,
        _ => return Err(EngineError::validation("book_hash is required")),
    };
    if !claimed.eq_ignore_ascii_case(&book_hash(terms)) {
        return Err(EngineError::IntegrityViolation);
    }
    Ok(())
}

/// Human-facing booking number: `SH-` and ten upper-case hex digits.
pub fn booking_number(id: Ulid) -> String {
    let digest = Sha256::digest(id.to_bytes());
    let mut hex = hex::encode_upper(&digest[..5]);
    hex.truncate(10);
    format!("SH-{hex}")
}

pub(crate) fn pre_booking_key(hash: &str) -> String {
    format!("pre_reservation:{hash}")
}
