use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps and job scheduling.
pub type Ms = i64;

/// Reason recorded on reservations cancelled by the expiry job.
pub const EXPIRY_CANCEL_REASON: &str = "CANCEL_TIME_OUT_INVOICE";

/// Half-open stay `[check_in, check_out)`. One night per date in the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "check_in must be before check_out");
        Self { check_in, check_out }
    }

    pub fn nights(&self) -> u32 {
        (self.check_out - self.check_in).num_days().max(0) as u32
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// Every night of the stay, in order.
    pub fn nights_iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.check_in.iter_days().take_while(move |d| *d < self.check_out)
    }

    /// Range extended by `nights` on both ends. Saturates at the calendar bounds.
    pub fn widened(&self, nights: u32) -> StayRange {
        let days = Days::new(u64::from(nights));
        StayRange {
            check_in: self.check_in.checked_sub_days(days).unwrap_or(NaiveDate::MIN),
            check_out: self.check_out.checked_add_days(days).unwrap_or(NaiveDate::MAX),
        }
    }
}

impl fmt::Display for StayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// Inclusive date span used by host overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// True if every night of `stay` falls inside this span.
    pub fn covers_stay(&self, stay: &StayRange) -> bool {
        self.start <= stay.check_in && stay.check_out.pred_opt().is_some_and(|last| last <= self.end)
    }
}

// ── Listing policy ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowUnit {
    Day,
    Week,
    Month,
    Year,
}

/// How far ahead of today a check-in may be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BookingWindow {
    #[default]
    Inactive,
    Ahead { amount: u32, unit: WindowUnit },
}

impl BookingWindow {
    /// Latest allowed check-in date when booking on `today`.
    pub fn horizon(&self, today: NaiveDate) -> Option<NaiveDate> {
        match *self {
            BookingWindow::Inactive => None,
            BookingWindow::Ahead { amount, unit } => Some(match unit {
                WindowUnit::Day => today.checked_add_days(Days::new(u64::from(amount))),
                WindowUnit::Week => today.checked_add_days(Days::new(u64::from(amount) * 7)),
                WindowUnit::Month => today.checked_add_months(chrono::Months::new(amount)),
                WindowUnit::Year => amount
                    .checked_mul(12)
                    .and_then(|m| today.checked_add_months(chrono::Months::new(m))),
            }
            .unwrap_or(NaiveDate::MAX)),
        }
    }
}

impl FromStr for BookingWindow {
    type Err = String;

    /// Accepts `Inactive` or `<digits> <day|week|month|year>[s]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("inactive") {
            return Ok(BookingWindow::Inactive);
        }
        let mut parts = s.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("invalid booking window: {s}"));
        };
        if !amount.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid booking window: {s}"));
        }
        let amount: u32 = amount
            .parse()
            .map_err(|_| format!("invalid booking window: {s}"))?;
        let unit = match unit.strip_suffix('s').unwrap_or(unit) {
            "day" => WindowUnit::Day,
            "week" => WindowUnit::Week,
            "month" => WindowUnit::Month,
            "year" => WindowUnit::Year,
            _ => return Err(format!("invalid booking window: {s}")),
        };
        Ok(BookingWindow::Ahead { amount, unit })
    }
}

impl fmt::Display for BookingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingWindow::Inactive => write!(f, "Inactive"),
            BookingWindow::Ahead { amount, unit } => {
                let unit = match unit {
                    WindowUnit::Day => "day",
                    WindowUnit::Week => "week",
                    WindowUnit::Month => "month",
                    WindowUnit::Year => "year",
                };
                let plural = if *amount == 1 { "" } else { "s" };
                write!(f, "{amount} {unit}{plural}")
            }
        }
    }
}

/// Mandatory gap between consecutive stays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferPeriod {
    #[default]
    None,
    OneNight,
    TwoNights,
}

impl BufferPeriod {
    pub fn nights(&self) -> u32 {
        match self {
            BufferPeriod::None => 0,
            BufferPeriod::OneNight => 1,
            BufferPeriod::TwoNights => 2,
        }
    }
}

impl FromStr for BufferPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(BufferPeriod::None),
            "1 night" => Ok(BufferPeriod::OneNight),
            "2 nights" => Ok(BufferPeriod::TwoNights),
            other => Err(format!("invalid buffer period: {other}")),
        }
    }
}

impl fmt::Display for BufferPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufferPeriod::None => "None",
            BufferPeriod::OneNight => "1 night",
            BufferPeriod::TwoNights => "2 nights",
        })
    }
}

/// Set of weekdays numbered 0 (Sunday) to 6 (Saturday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn from_numbers(days: &[u8]) -> Result<Self, String> {
        let mut bits = 0u8;
        for &d in days {
            if d > 6 {
                return Err(format!("weekday out of range: {d}"));
            }
            bits |= 1 << d;
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn numbers(&self) -> Vec<u8> {
        (0..7).filter(|d| self.0 & (1 << d) != 0).collect()
    }
}

impl FromStr for WeekdaySet {
    type Err = String;

    /// Comma-separated weekday numbers, e.g. `0,6`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut days = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            days.push(part.parse::<u8>().map_err(|_| format!("bad weekday: {part}"))?);
        }
        Self::from_numbers(&days)
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nums: Vec<String> = self.numbers().iter().map(u8::to_string).collect();
        f.write_str(&nums.join(","))
    }
}

/// Listing-level temporal rules. Every field defaults to "no restriction".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookingPolicy {
    pub booking_window: BookingWindow,
    pub buffer_period: BufferPeriod,
    pub restricted_check_in: WeekdaySet,
    pub restricted_check_out: WeekdaySet,
    pub min_nights: Option<u32>,
    pub max_nights: Option<u32>,
    pub same_day_cutoff: Option<NaiveTime>,
}

// ── Listing ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListingStatus {
    #[default]
    Draft,
    Listed,
    Unlisted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "DRAFT",
            ListingStatus::Listed => "LISTED",
            ListingStatus::Unlisted => "UNLISTED",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(ListingStatus::Draft),
            "LISTED" => Ok(ListingStatus::Listed),
            "UNLISTED" => Ok(ListingStatus::Unlisted),
            other => Err(format!("unknown listing status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub slug: String,
    pub name: String,
    pub address: Option<String>,
    pub host_id: Ulid,
    pub region: Option<String>,
    pub amenities: Vec<String>,
    pub guest_capacity: u32,
    pub default_price: Option<f64>,
    pub default_availability: bool,
    pub free_cancellation: bool,
    pub status: ListingStatus,
    pub policy: BookingPolicy,
    pub created_at: Ms,
    pub deleted_at: Option<Ms>,
}

impl Listing {
    pub fn is_searchable(&self) -> bool {
        self.deleted_at.is_none() && self.status == ListingStatus::Listed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub span: DateSpan,
    pub available: bool,
    pub deleted_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceOverride {
    pub span: DateSpan,
    pub price: f64,
    pub deleted_at: Option<Ms>,
}

// ── Reservation ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Created,
    WaitingPayment,
    PaidPartial,
    PaidCompleted,
    Processing,
    Completed,
    Canceled,
    Fail,
    RefundPending,
    RefundCompleted,
    RefundFail,
}

impl ReservationStatus {
    /// Every status except CANCELED and FAIL occupies the calendar.
    pub fn holds_calendar(&self) -> bool {
        !matches!(self, ReservationStatus::Canceled | ReservationStatus::Fail)
    }

    /// Still waiting on payment, so the expiry job may cancel it.
    pub fn is_expirable(&self) -> bool {
        matches!(self, ReservationStatus::Created | ReservationStatus::WaitingPayment)
    }

    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            ReservationStatus::PaidPartial
                | ReservationStatus::PaidCompleted
                | ReservationStatus::Processing
                | ReservationStatus::Completed
        )
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        match self {
            Created => matches!(next, WaitingPayment | PaidPartial | PaidCompleted | Canceled | Fail),
            WaitingPayment => matches!(next, PaidPartial | PaidCompleted | Canceled | Fail),
            PaidPartial => matches!(next, PaidCompleted | Canceled | Fail | RefundPending),
            PaidCompleted => matches!(next, Processing | Canceled | RefundPending),
            Processing => matches!(next, Completed | Fail | RefundPending),
            RefundPending => matches!(next, RefundCompleted | RefundFail),
            Completed | Canceled | Fail | RefundCompleted | RefundFail => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ReservationStatus::*;
        match self {
            Created => "CREATED",
            WaitingPayment => "WAITING_PAYMENT",
            PaidPartial => "PAID_PARTIAL",
            PaidCompleted => "PAID_COMPLETED",
            Processing => "PROCESSING",
            Completed => "COMPLETED",
            Canceled => "CANCELED",
            Fail => "FAIL",
            RefundPending => "REFUND_PENDING",
            RefundCompleted => "REFUND_COMPLETED",
            RefundFail => "REFUND_FAIL",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ReservationStatus::*;
        let upper = s.trim().to_ascii_uppercase();
        Ok(match upper.strip_prefix("ORDER_").unwrap_or(&upper) {
            "CREATED" => Created,
            "WAITING_PAYMENT" => WaitingPayment,
            "PAID_PARTIAL" => PaidPartial,
            "PAID_COMPLETED" => PaidCompleted,
            "PROCESSING" => Processing,
            "COMPLETED" => Completed,
            "CANCELED" | "CANCELLED" => Canceled,
            "FAIL" | "FAILED" => Fail,
            "REFUND_PENDING" => RefundPending,
            "REFUND_COMPLETED" => RefundCompleted,
            "REFUND_FAIL" => RefundFail,
            other => return Err(format!("unknown reservation status: {other}")),
        })
    }
}

/// Terms and money fields a guest proposes. Staged as a pre-booking and
/// submitted again at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub listing_id: Ulid,
    pub guest_id: Ulid,
    pub host_id: Option<Ulid>,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub night_staying: u32,
    pub guest_number: u32,
    pub base_price: f64,
    pub service_fee: f64,
    pub tax: f64,
    pub guest_deposit: f64,
    pub total_price: f64,
    /// Opaque JSON document supplied by the client.
    pub guest_info: Option<String>,
    pub guest_wallet_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub booking_number: String,
    pub listing_id: Ulid,
    pub guest_id: Ulid,
    pub host_id: Ulid,
    pub listing_name: String,
    pub listing_address: Option<String>,
    pub stay: StayRange,
    pub night_staying: u32,
    pub guest_number: u32,
    pub base_price: f64,
    pub service_fee: f64,
    pub tax: f64,
    pub guest_deposit: f64,
    pub total_price: f64,
    pub guest_info: Option<String>,
    pub guest_wallet_address: Option<String>,
    pub status: ReservationStatus,
    pub book_hash: String,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub deleted_at: Option<Ms>,
}

/// Per-listing in-memory state. Reservations are kept sorted by check-in.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub listing: Listing,
    pub availability_overrides: Vec<AvailabilityOverride>,
    pub price_overrides: Vec<PriceOverride>,
    pub reservations: Vec<Reservation>,
}

impl ListingState {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            availability_overrides: Vec::new(),
            price_overrides: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by check-in.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.stay.check_in <= reservation.stay.check_in);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose stay overlaps `query`.
    /// Binary search skips everything checking in at or after `query.check_out`.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in < query.check_out);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out > query.check_in)
    }

    pub fn active_availability_overrides(&self) -> impl Iterator<Item = &AvailabilityOverride> {
        self.availability_overrides.iter().filter(|o| o.deleted_at.is_none())
    }

    pub fn active_price_overrides(&self) -> impl Iterator<Item = &PriceOverride> {
        self.price_overrides.iter().filter(|o| o.deleted_at.is_none())
    }
}

/// The event types. This is the engine WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ListingCreated {
        listing: Listing,
    },
    ListingUpdated {
        listing: Listing,
    },
    ListingDeleted {
        id: Ulid,
        at: Ms,
    },
    AvailabilityOverrideSet {
        listing_id: Ulid,
        span: DateSpan,
        available: bool,
    },
    AvailabilityOverrideDeleted {
        listing_id: Ulid,
        span: DateSpan,
        at: Ms,
    },
    PriceOverrideSet {
        listing_id: Ulid,
        span: DateSpan,
        price: f64,
    },
    PriceOverrideDeleted {
        listing_id: Ulid,
        span: DateSpan,
        at: Ms,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
}

impl Event {
    pub fn listing_id(&self) -> Ulid {
        match self {
            Event::ListingCreated { listing } | Event::ListingUpdated { listing } => listing.id,
            Event::ListingDeleted { id, .. } => *id,
            Event::AvailabilityOverrideSet { listing_id, .. }
            | Event::AvailabilityOverrideDeleted { listing_id, .. }
            | Event::PriceOverrideSet { listing_id, .. }
            | Event::PriceOverrideDeleted { listing_id, .. } => *listing_id,
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                reservation.listing_id
            }
        }
    }
}
