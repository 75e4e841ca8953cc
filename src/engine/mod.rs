mod availability;
mod conflict;
mod error;
mod mutations;
mod policy;
mod pricing;
mod queries;
mod quote;

pub use availability::{is_date_open, is_stay_open};
pub use conflict::CalendarClash;
pub use error::EngineError;
pub use mutations::{ListingInput, OverrideKind, OverrideValue, ReservationPatch};
pub use policy::{PolicyViolation, validate_stay};
pub use pricing::{NightlyPrice, StayPrice, price_stay, resolve_price};
pub use queries::{
    AvailabilityQuote, GuestCategory, HostSummary, SearchHit, SearchPage, SearchQuery, SortField,
    SortOrder,
};
pub use quote::{QuoteTerms, book_hash, booking_number};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::cache::{DEFAULT_CACHE_TTL, KvStore, SearchCache};
use crate::clock::Clock;
use crate::jobs::{EXPIRE_RESERVATION, ExpireReservation, Job, JobError, JobProcessor, JobQueue};
use crate::model::*;
use crate::wal::{Wal, WalWriter};

pub type SharedListingState = Arc<RwLock<ListingState>>;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long an unpaid reservation holds the calendar.
    pub hold_window: Duration,
    pub pre_booking_ttl: Duration,
    pub cache_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_window: Duration::from_secs(15 * 60),
            pre_booking_ttl: Duration::from_secs(60 * 60),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// External collaborators injected into an engine.
#[derive(Clone)]
pub struct EnginePorts {
    /// Holds staged pre-bookings and cached search answers.
    pub side_store: Arc<dyn KvStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    pub(super) listings: DashMap<Ulid, SharedListingState>,
    /// Live (not deleted) slug → listing id.
    pub(super) slugs: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → listing id.
    pub(super) reservation_to_listing: DashMap<Ulid, Ulid>,
    pub(super) wal: WalWriter<Event>,
    pub(super) cache: SearchCache,
    pub(super) side_store: Arc<dyn KvStore>,
    pub(super) jobs: Arc<dyn JobQueue>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    /// Writers hold this shared for their whole check → append → apply sequence,
    /// taken before any listing lock. Compaction holds it exclusively.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event to a listing's state (no locking; the caller holds the lock).
/// `ListingCreated` is handled at the map level, not here.
fn apply_to_listing(ls: &mut ListingState, event: &Event, reservation_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingCreated { .. } => {}
        Event::ListingUpdated { listing } => {
            ls.listing = listing.clone();
        }
        Event::ListingDeleted { at, .. } => {
            ls.listing.deleted_at = Some(*at);
        }
        Event::AvailabilityOverrideSet { span, available, .. } => {
            match ls.availability_overrides.iter_mut().find(|o| o.span == *span) {
                Some(o) => {
                    o.available = *available;
                    o.deleted_at = None;
                }
                None => ls.availability_overrides.push(AvailabilityOverride {
                    span: *span,
                    available: *available,
                    deleted_at: None,
                }),
            }
        }
        Event::AvailabilityOverrideDeleted { span, at, .. } => {
            if let Some(o) = ls.availability_overrides.iter_mut().find(|o| o.span == *span) {
                o.deleted_at = Some(*at);
            }
        }
        Event::PriceOverrideSet { span, price, .. } => {
            match ls.price_overrides.iter_mut().find(|o| o.span == *span) {
                Some(o) => {
                    o.price = *price;
                    o.deleted_at = None;
                }
                None => ls.price_overrides.push(PriceOverride {
                    span: *span,
                    price: *price,
                    deleted_at: None,
                }),
            }
        }
        Event::PriceOverrideDeleted { span, at, .. } => {
            if let Some(o) = ls.price_overrides.iter_mut().find(|o| o.span == *span) {
                o.deleted_at = Some(*at);
            }
        }
        Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
            ls.remove_reservation(reservation.id);
            ls.insert_reservation(reservation.clone());
            reservation_index.insert(reservation.id, reservation.listing_id);
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer. Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        ports: EnginePorts,
        settings: EngineSettings,
    ) -> std::io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = WalWriter::spawn(Wal::open(&wal_path)?);

        // Rebuild into plain owned state first; wrap in locks once complete.
        let reservation_to_listing = DashMap::new();
        let mut states: HashMap<Ulid, ListingState> = HashMap::new();
        for event in &events {
            match event {
                Event::ListingCreated { listing } => {
                    states.insert(listing.id, ListingState::new(listing.clone()));
                }
                other => {
                    if let Some(ls) = states.get_mut(&other.listing_id()) {
                        apply_to_listing(ls, other, &reservation_to_listing);
                    }
                }
            }
        }

        let listings = DashMap::new();
        let slugs = DashMap::new();
        for (id, ls) in states {
            if ls.listing.deleted_at.is_none() {
                slugs.insert(ls.listing.slug.clone(), id);
            }
            listings.insert(id, Arc::new(RwLock::new(ls)));
        }
        if !events.is_empty() {
            tracing::info!(
                path = %wal_path.display(),
                events = events.len(),
                listings = listings.len(),
                "replayed engine WAL"
            );
        }

        Ok(Self {
            listings,
            slugs,
            reservation_to_listing,
            wal,
            cache: SearchCache::new(ports.side_store.clone(), settings.cache_ttl),
            side_store: ports.side_store,
            jobs: ports.jobs,
            clock: ports.clock,
            settings,
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn get_listing_state(&self, id: &Ulid) -> Option<SharedListingState> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn listing_id_for_slug(&self, slug: &str) -> Option<Ulid> {
        self.slugs.get(slug).map(|e| *e.value())
    }

    pub fn listing_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_listing.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append then apply, while the caller holds the listing's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut ListingState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await?;
        apply_to_listing(ls, &event, &self.reservation_to_listing);
        Ok(())
    }

    /// Lookup reservation → listing, then take that listing's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let listing_id = self
            .listing_for_reservation(&reservation_id)
            .ok_or_else(|| EngineError::reservation_not_found(reservation_id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::listing_not_found(listing_id))?;
        Ok(ls.write_owned().await)
    }

    /// Minimal event sequence that recreates the current state.
    pub(super) async fn snapshot_events(&self) -> Vec<Event> {
        let mut ids: Vec<Ulid> = self.listings.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut events = Vec::new();
        for id in ids {
            let Some(ls) = self.get_listing_state(&id) else { continue };
            let guard = ls.read().await;
            events.push(Event::ListingCreated { listing: guard.listing.clone() });
            for o in &guard.availability_overrides {
                events.push(Event::AvailabilityOverrideSet {
                    listing_id: id,
                    span: o.span,
                    available: o.available,
                });
                if let Some(at) = o.deleted_at {
                    events.push(Event::AvailabilityOverrideDeleted { listing_id: id, span: o.span, at });
                }
            }
            for o in &guard.price_overrides {
                events.push(Event::PriceOverrideSet { listing_id: id, span: o.span, price: o.price });
                if let Some(at) = o.deleted_at {
                    events.push(Event::PriceOverrideDeleted { listing_id: id, span: o.span, at });
                }
            }
            for r in &guard.reservations {
                events.push(Event::ReservationCreated { reservation: r.clone() });
            }
        }
        events
    }
}

/// Consumes `expire-reservation` jobs for one engine.
pub struct ExpiryProcessor {
    engine: Arc<Engine>,
}

impl ExpiryProcessor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobProcessor for ExpiryProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        if job.name != EXPIRE_RESERVATION {
            return Err(JobError::UnknownJob(job.name.clone()));
        }
        let payload: ExpireReservation = job.payload_as()?;
        self.engine
            .expire_reservation(payload.reservation_id)
            .await
            .map(|_| ())
            .map_err(|e| JobError::Failed(e.to_string()))
    }
}
