use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::jobs::{EXPIRE_RESERVATION, ExpireReservation, JobOptions};
use crate::limits::*;
use crate::model::*;

use super::availability::is_stay_open;
use super::conflict::{CalendarClash, find_clash, validate_range};
use super::policy::{PolicyViolation, validate_stay};
use super::quote::{self, QuoteTerms};
use super::{Engine, EngineError};

/// Full set of host-editable listing fields. Updates replace every field,
/// including the policy sub-record.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingInput {
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
}

impl From<&Listing> for ListingInput {
    fn from(l: &Listing) -> Self {
        Self {
            slug: l.slug.clone(),
            name: l.name.clone(),
            address: l.address.clone(),
            host_id: l.host_id,
            region: l.region.clone(),
            amenities: l.amenities.clone(),
            guest_capacity: l.guest_capacity,
            default_price: l.default_price,
            default_availability: l.default_availability,
            free_cancellation: l.free_cancellation,
            status: l.status,
            policy: l.policy.clone(),
        }
    }
}

impl ListingInput {
    fn validate(&self) -> Result<(), EngineError> {
        let slug = self.slug.trim();
        if slug.is_empty() {
            return Err(EngineError::validation("slug is required"));
        }
        if slug.len() > MAX_SLUG_LEN {
            return Err(EngineError::LimitExceeded("slug too long"));
        }
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("name is required"));
        }
        for text in [Some(&self.name), self.address.as_ref(), self.region.as_ref()]
            .into_iter()
            .flatten()
        {
            if text.len() > MAX_TEXT_LEN {
                return Err(EngineError::LimitExceeded("text field too long"));
            }
        }
        if self.guest_capacity == 0 {
            return Err(EngineError::validation("guest_capacity must be at least 1"));
        }
        if self.amenities.len() > MAX_AMENITIES {
            return Err(EngineError::LimitExceeded("too many amenities"));
        }
        if let Some(price) = self.default_price {
            check_money("default_price", price)?;
        }
        if let (Some(min), Some(max)) = (self.policy.min_nights, self.policy.max_nights)
            && min > max
        {
            return Err(EngineError::validation(
                "min_booking_night must not exceed max_booking_night",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Availability,
    Price,
}

impl OverrideKind {
    fn label(&self) -> &'static str {
        match self {
            OverrideKind::Availability => "availability override",
            OverrideKind::Price => "price override",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverrideValue {
    Available(bool),
    Price(f64),
}

impl OverrideValue {
    fn kind(&self) -> OverrideKind {
        match self {
            OverrideValue::Available(_) => OverrideKind::Availability,
            OverrideValue::Price(_) => OverrideKind::Price,
        }
    }
}

/// Partial reservation update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationPatch {
    pub check_in_date: Option<NaiveDate>,
    pub check_out_date: Option<NaiveDate>,
    pub night_staying: Option<u32>,
    pub guest_number: Option<u32>,
    pub base_price: Option<f64>,
    pub service_fee: Option<f64>,
    pub tax: Option<f64>,
    pub guest_deposit: Option<f64>,
    pub total_price: Option<f64>,
    pub guest_info: Option<String>,
    pub guest_wallet_address: Option<String>,
    pub status: Option<ReservationStatus>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
}

fn check_money(field: &str, value: f64) -> Result<(), EngineError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::validation(format!("{field} must be a non-negative number")));
    }
    Ok(())
}

fn check_span(span: &DateSpan) -> Result<(), EngineError> {
    if span.start > span.end {
        return Err(EngineError::validation("Start date must not be after end date"));
    }
    Ok(())
}

fn check_draft(draft: &ReservationDraft, stay: &StayRange) -> Result<(), EngineError> {
    if draft.night_staying != stay.nights() {
        return Err(EngineError::validation("night_staying does not match the date range"));
    }
    if draft.guest_number == 0 {
        return Err(EngineError::validation("guest_number must be at least 1"));
    }
    check_money("base_price", draft.base_price)?;
    check_money("service_fee", draft.service_fee)?;
    check_money("tax", draft.tax)?;
    check_money("guest_deposit", draft.guest_deposit)?;
    check_money("total_price", draft.total_price)?;
    if draft.guest_info.as_ref().is_some_and(|g| g.len() > MAX_GUEST_INFO_LEN) {
        return Err(EngineError::LimitExceeded("guest_info too large"));
    }
    if draft
        .guest_wallet_address
        .as_ref()
        .is_some_and(|w| w.len() > MAX_TEXT_LEN)
    {
        return Err(EngineError::LimitExceeded("guest_wallet_address too long"));
    }
    Ok(())
}

/// Map a calendar clash to the error the creation and update paths report.
fn clash_error(clash: CalendarClash, buffer: BufferPeriod) -> EngineError {
    metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
    match clash {
        CalendarClash::Overlap(id) => EngineError::Conflict(id),
        CalendarClash::Buffer(_) => {
            EngineError::Validation(PolicyViolation::BufferPeriod(buffer).to_string())
        }
    }
}

impl Engine {
    // ── Listings ───────────────────────────────────────────────

    pub async fn create_listing(&self, input: ListingInput) -> Result<Listing, EngineError> {
        input.validate()?;
        let _gate = self.compaction_gate.read().await;
        if self.listings.len() >= MAX_LISTINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many listings"));
        }

        let id = Ulid::new();
        let slug = input.slug.trim().to_string();
        // Claim the slug before the WAL append; release it if the append fails.
        match self.slugs.entry(slug.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists { kind: "listing", key: slug });
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let listing = Listing {
            id,
            slug: slug.clone(),
            name: input.name,
            address: input.address,
            host_id: input.host_id,
            region: input.region,
            amenities: input.amenities,
            guest_capacity: input.guest_capacity,
            default_price: input.default_price,
            default_availability: input.default_availability,
            free_cancellation: input.free_cancellation,
            status: input.status,
            policy: input.policy,
            created_at: self.clock.now_ms(),
            deleted_at: None,
        };
        if let Err(e) = self.wal.append(Event::ListingCreated { listing: listing.clone() }).await {
            self.slugs.remove(&slug);
            return Err(e.into());
        }
        self.listings
            .insert(id, Arc::new(RwLock::new(ListingState::new(listing.clone()))));
        self.cache.invalidate_listing(&slug);
        tracing::info!(listing_id = %id, slug, "listing created");
        Ok(listing)
    }

    pub async fn update_listing(&self, id: Ulid, input: ListingInput) -> Result<Listing, EngineError> {
        input.validate()?;
        let _gate = self.compaction_gate.read().await;
        let ls = self
            .get_listing_state(&id)
            .ok_or_else(|| EngineError::listing_not_found(id))?;
        let mut guard = ls.write().await;
        if guard.listing.deleted_at.is_some() {
            return Err(EngineError::listing_not_found(id));
        }

        let old_slug = guard.listing.slug.clone();
        let new_slug = input.slug.trim().to_string();
        let slug_changed = new_slug != old_slug;
        if slug_changed {
            match self.slugs.entry(new_slug.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::AlreadyExists { kind: "listing", key: new_slug });
                }
                Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let listing = Listing {
            id,
            slug: new_slug.clone(),
            name: input.name,
            address: input.address,
            host_id: input.host_id,
            region: input.region,
            amenities: input.amenities,
            guest_capacity: input.guest_capacity,
            default_price: input.default_price,
            default_availability: input.default_availability,
            free_cancellation: input.free_cancellation,
            status: input.status,
            policy: input.policy,
            created_at: guard.listing.created_at,
            deleted_at: None,
        };
        let event = Event::ListingUpdated { listing: listing.clone() };
        if let Err(e) = self.persist_and_apply(&mut guard, event).await {
            if slug_changed {
                self.slugs.remove(&new_slug);
            }
            return Err(e);
        }
        if slug_changed {
            self.slugs.remove(&old_slug);
            self.cache.invalidate_listing(&old_slug);
        }
        self.cache.invalidate_listing(&new_slug);
        Ok(listing)
    }

    /// Soft delete. Reservations stay readable; the slug is released.
    pub async fn delete_listing(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let ls = self
            .get_listing_state(&id)
            .ok_or_else(|| EngineError::listing_not_found(id))?;
        let mut guard = ls.write().await;
        if guard.listing.deleted_at.is_some() {
            return Err(EngineError::listing_not_found(id));
        }
        let event = Event::ListingDeleted { id, at: self.clock.now_ms() };
        self.persist_and_apply(&mut guard, event).await?;
        let slug = guard.listing.slug.clone();
        self.slugs.remove_if(&slug, |_, owner| *owner == id);
        self.cache.invalidate_listing(&slug);
        Ok(())
    }

    // ── Overrides ──────────────────────────────────────────────

    /// Create an override keyed by (listing, start, end). An active override
    /// with the same key is rejected.
    pub async fn create_override(
        &self,
        listing_id: Ulid,
        span: DateSpan,
        value: OverrideValue,
    ) -> Result<(), EngineError> {
        self.write_override(listing_id, span, value, false).await
    }

    /// Change the value of an existing active override.
    pub async fn update_override(
        &self,
        listing_id: Ulid,
        span: DateSpan,
        value: OverrideValue,
    ) -> Result<(), EngineError> {
        self.write_override(listing_id, span, value, true).await
    }

    async fn write_override(
        &self,
        listing_id: Ulid,
        span: DateSpan,
        value: OverrideValue,
        must_exist: bool,
    ) -> Result<(), EngineError> {
        check_span(&span)?;
        if let OverrideValue::Price(price) = value {
            check_money("price", price)?;
        }
        let _gate = self.compaction_gate.read().await;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::listing_not_found(listing_id))?;
        let mut guard = ls.write().await;
        if guard.listing.deleted_at.is_some() {
            return Err(EngineError::listing_not_found(listing_id));
        }

        let kind = value.kind();
        let (exists, total) = match kind {
            OverrideKind::Availability => (
                guard.active_availability_overrides().any(|o| o.span == span),
                guard.availability_overrides.len(),
            ),
            OverrideKind::Price => (
                guard.active_price_overrides().any(|o| o.span == span),
                guard.price_overrides.len(),
            ),
        };
        let key = format!("{listing_id}:{}:{}", span.start, span.end);
        match (must_exist, exists) {
            (false, true) => return Err(EngineError::AlreadyExists { kind: kind.label(), key }),
            (true, false) => return Err(EngineError::NotFound { kind: kind.label(), key }),
            (false, false) if total >= MAX_OVERRIDES_PER_LISTING => {
                return Err(EngineError::LimitExceeded("too many overrides on listing"));
            }
            _ => {}
        }

        let event = match value {
            OverrideValue::Available(available) => {
                Event::AvailabilityOverrideSet { listing_id, span, available }
            }
            OverrideValue::Price(price) => Event::PriceOverrideSet { listing_id, span, price },
        };
        self.persist_and_apply(&mut guard, event).await?;
        self.cache.invalidate_listing(&guard.listing.slug);
        Ok(())
    }

    pub async fn delete_override(
        &self,
        kind: OverrideKind,
        listing_id: Ulid,
        span: DateSpan,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::listing_not_found(listing_id))?;
        let mut guard = ls.write().await;
        let exists = match kind {
            OverrideKind::Availability => guard.active_availability_overrides().any(|o| o.span == span),
            OverrideKind::Price => guard.active_price_overrides().any(|o| o.span == span),
        };
        if !exists {
            return Err(EngineError::NotFound {
                kind: kind.label(),
                key: format!("{listing_id}:{}:{}", span.start, span.end),
            });
        }
        let at = self.clock.now_ms();
        let event = match kind {
            OverrideKind::Availability => Event::AvailabilityOverrideDeleted { listing_id, span, at },
            OverrideKind::Price => Event::PriceOverrideDeleted { listing_id, span, at },
        };
        self.persist_and_apply(&mut guard, event).await?;
        self.cache.invalidate_listing(&guard.listing.slug);
        Ok(())
    }

    // ── Pre-bookings ───────────────────────────────────────────

    /// Stage a proposed reservation in the side store under its book hash.
    pub async fn stage_pre_booking(&self, draft: &ReservationDraft) -> Result<String, EngineError> {
        let stay = validate_range(draft.check_in_date, draft.check_out_date)?;
        check_draft(draft, &stay)?;
        let hash = quote::book_hash(&QuoteTerms::from(draft));
        let body = serde_json::to_string(draft).map_err(|e| EngineError::Store(e.to_string()))?;
        self.side_store
            .set(&quote::pre_booking_key(&hash), body, self.settings.pre_booking_ttl)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        tracing::debug!(listing_id = %draft.listing_id, book_hash = hash, "pre-booking staged");
        Ok(hash)
    }

    pub async fn get_pre_booking(&self, hash: &str) -> Result<ReservationDraft, EngineError> {
        let raw = self
            .side_store
            .get(&quote::pre_booking_key(hash))
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound {
                kind: "Pre-reservation data",
                key: hash.to_string(),
            })?;
        serde_json::from_str(&raw).map_err(|e| EngineError::Store(e.to_string()))
    }

    // ── Reservations ───────────────────────────────────────────

    /// Create a reservation in `CREATED` and schedule its expiry.
    ///
    /// The book hash is verified first. Availability, policy and the calendar
    /// check then run under the listing write lock, and the reservation is
    /// durable before that lock is released.
    pub async fn create_reservation(
        &self,
        draft: ReservationDraft,
        book_hash: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        quote::verify(&QuoteTerms::from(&draft), book_hash)?;
        let stay = validate_range(draft.check_in_date, draft.check_out_date)?;
        check_draft(&draft, &stay)?;

        let _gate = self.compaction_gate.read().await;
        let ls = self
            .get_listing_state(&draft.listing_id)
            .ok_or_else(|| EngineError::listing_not_found(draft.listing_id))?;
        let mut guard = ls.write().await;
        let listing = &guard.listing;
        if listing.deleted_at.is_some() {
            return Err(EngineError::listing_not_found(draft.listing_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many reservations on listing"));
        }
        if draft.guest_number > listing.guest_capacity {
            return Err(EngineError::validation("Guest number exceeds listing capacity"));
        }

        if !is_stay_open(listing.default_availability, &guard.availability_overrides, &stay) {
            return Err(EngineError::NotAvailable);
        }
        let now = self.clock.now();
        validate_stay(&listing.policy, &stay, now.naive_utc())
            .map_err(|v| EngineError::Validation(v.to_string()))?;
        if let Some(clash) = find_clash(&guard, &stay, None) {
            return Err(clash_error(clash, guard.listing.policy.buffer_period));
        }

        let id = Ulid::new();
        let payload = serde_json::to_value(ExpireReservation { reservation_id: id })
            .map_err(|e| EngineError::Scheduling(e.to_string()))?;
        let options = JobOptions {
            delay: self.settings.hold_window,
            remove_on_complete: true,
            remove_on_fail: false,
        };
        self.jobs
            .enqueue(EXPIRE_RESERVATION, payload, options)
            .await
            .map_err(|e| EngineError::Scheduling(e.to_string()))?;

        let now_ms = now.timestamp_millis();
        let book_hash = quote::book_hash(&QuoteTerms::from(&draft));
        let reservation = Reservation {
            id,
            booking_number: quote::booking_number(id),
            listing_id: draft.listing_id,
            guest_id: draft.guest_id,
            host_id: draft.host_id.unwrap_or(guard.listing.host_id),
            listing_name: guard.listing.name.clone(),
            listing_address: guard.listing.address.clone(),
            stay,
            night_staying: draft.night_staying,
            guest_number: draft.guest_number,
            base_price: draft.base_price,
            service_fee: draft.service_fee,
            tax: draft.tax,
            guest_deposit: draft.guest_deposit,
            total_price: draft.total_price,
            guest_info: draft.guest_info,
            guest_wallet_address: draft.guest_wallet_address,
            status: ReservationStatus::Created,
            book_hash,
            cancel_reason: None,
            cancelled_by: None,
            created_at: now_ms,
            updated_at: now_ms,
            deleted_at: None,
        };
        self.persist_and_apply(&mut guard, Event::ReservationCreated { reservation: reservation.clone() })
            .await?;
        self.cache.invalidate_listing(&guard.listing.slug);

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            reservation_id = %id,
            listing_id = %reservation.listing_id,
            booking_number = reservation.booking_number,
            stay = %stay,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Apply `patch`. Date changes re-run the calendar check (with buffer)
    /// excluding this reservation; status changes follow the state machine.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_reservation_write(id).await?;
        let current = guard
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let mut next = current.clone();

        if patch.check_in_date.is_some() || patch.check_out_date.is_some() {
            let stay = validate_range(
                patch.check_in_date.unwrap_or(current.stay.check_in),
                patch.check_out_date.unwrap_or(current.stay.check_out),
            )?;
            if stay != current.stay {
                let holds = patch.status.unwrap_or(current.status).holds_calendar();
                if holds && let Some(clash) = find_clash(&guard, &stay, Some(id)) {
                    return Err(clash_error(clash, guard.listing.policy.buffer_period));
                }
                next.stay = stay;
                next.night_staying = stay.nights();
            }
        }

        if let Some(status) = patch.status
            && status != current.status
        {
            if !current.status.can_transition_to(status) {
                return Err(EngineError::InvalidTransition { from: current.status, to: status });
            }
            // Leaving CANCELED/FAIL is impossible, so only date changes can re-take the calendar.
            next.status = status;
        }

        if let Some(n) = patch.night_staying {
            if n != next.stay.nights() {
                return Err(EngineError::validation("night_staying does not match the date range"));
            }
            next.night_staying = n;
        }
        if let Some(g) = patch.guest_number {
            if g == 0 {
                return Err(EngineError::validation("guest_number must be at least 1"));
            }
            next.guest_number = g;
        }
        for (field, value, slot) in [
            ("base_price", patch.base_price, &mut next.base_price),
            ("service_fee", patch.service_fee, &mut next.service_fee),
            ("tax", patch.tax, &mut next.tax),
            ("guest_deposit", patch.guest_deposit, &mut next.guest_deposit),
            ("total_price", patch.total_price, &mut next.total_price),
        ] {
            if let Some(v) = value {
                check_money(field, v)?;
                *slot = v;
            }
        }
        if let Some(info) = patch.guest_info {
            if info.len() > MAX_GUEST_INFO_LEN {
                return Err(EngineError::LimitExceeded("guest_info too large"));
            }
            next.guest_info = Some(info);
        }
        if let Some(wallet) = patch.guest_wallet_address {
            next.guest_wallet_address = Some(wallet);
        }
        if let Some(reason) = patch.cancel_reason {
            next.cancel_reason = Some(reason);
        }
        if let Some(actor) = patch.cancelled_by {
            next.cancelled_by = Some(actor);
        }

        if next == current {
            return Ok(current);
        }
        // The stored hash always binds the terms the reservation now carries.
        if QuoteTerms::from(&next) != QuoteTerms::from(&current) {
            next.book_hash = quote::book_hash(&QuoteTerms::from(&next));
        }
        next.updated_at = self.clock.now_ms();
        self.persist_and_apply(&mut guard, Event::ReservationUpdated { reservation: next.clone() })
            .await?;
        self.cache.invalidate_listing(&guard.listing.slug);
        if next.status != current.status {
            tracing::info!(
                reservation_id = %id,
                from = %current.status,
                to = %next.status,
                "reservation status changed"
            );
        }
        Ok(next)
    }

    pub async fn transition_reservation(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch { status: Some(status), ..Default::default() })
            .await
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
        cancelled_by: Option<Ulid>,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation(
            id,
            ReservationPatch {
                status: Some(ReservationStatus::Canceled),
                cancel_reason: reason,
                cancelled_by,
                ..Default::default()
            },
        )
        .await
    }

    /// Administrative soft delete. Does not change the status, so a
    /// calendar-holding reservation keeps its dates blocked.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_reservation_write(id).await?;
        let mut next = guard
            .reservation(id)
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let now = self.clock.now_ms();
        next.deleted_at = Some(now);
        next.updated_at = now;
        self.persist_and_apply(&mut guard, Event::ReservationUpdated { reservation: next.clone() })
            .await?;
        Ok(next)
    }

    /// Cancel an unpaid hold. Returns `false` without touching state when the
    /// reservation already left `CREATED`/`WAITING_PAYMENT`.
    pub async fn expire_reservation(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_reservation_write(id).await?;
        let current = guard
            .reservation(id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        if !current.status.is_expirable() {
            tracing::debug!(reservation_id = %id, status = %current.status, "expiry skipped");
            return Ok(false);
        }
        let mut next = current.clone();
        next.status = ReservationStatus::Canceled;
        next.cancel_reason = Some(EXPIRY_CANCEL_REASON.to_string());
        next.updated_at = self.clock.now_ms();
        self.persist_and_apply(&mut guard, Event::ReservationUpdated { reservation: next })
            .await?;
        self.cache.invalidate_listing(&guard.listing.slug);
        metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL).increment(1);
        tracing::info!(reservation_id = %id, "unpaid reservation expired");
        Ok(true)
    }

    // ── WAL maintenance ────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.snapshot_events().await;
        self.wal.compact(events).await?;
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
