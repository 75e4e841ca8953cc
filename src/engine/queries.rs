use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::cache::SearchCache;
use crate::limits::*;
use crate::model::*;

use super::availability::is_stay_open;
use super::conflict::{find_clash, validate_range};
use super::policy::validate_stay;
use super::pricing::{NightlyPrice, price_stay};
use super::mutations::{OverrideKind, OverrideValue};
use super::{Engine, EngineError};

/// Bookable stay on one listing with its price breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityQuote {
    pub listing_id: Ulid,
    pub slug: String,
    pub stay: StayRange,
    pub guest_capacity: u32,
    pub daily_prices: Vec<NightlyPrice>,
    pub total_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortField {
    Name,
    #[default]
    CreatedAt,
    DefaultPrice,
    /// Resolved nightly price for the searched stay.
    Price,
}

impl FromStr for SortField {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(SortField::Name),
            "created_at" => Ok(SortField::CreatedAt),
            "default_price" => Ok(SortField::DefaultPrice),
            "price" => Ok(SortField::Price),
            _ => Err(EngineError::validation("Invalid sorting field")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(EngineError::validation("Invalid sorting order")),
        }
    }
}

/// Listing search filters. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub check_in_date: Option<NaiveDate>,
    pub check_out_date: Option<NaiveDate>,
    pub adults: Option<u32>,
    pub children: Option<u32>,
    pub name: Option<String>,
    pub region: Option<String>,
    pub slug: Option<String>,
    pub amenities: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub free_cancellation: Option<bool>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Canonical form of a `SearchQuery`; its JSON is the cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct NormalizedSearch {
    stay: Option<StayRange>,
    guests: Option<u32>,
    name: Option<String>,
    region: Option<String>,
    slug: Option<String>,
    amenities: Vec<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    free_cancellation: Option<bool>,
    sort_by: SortField,
    sort_order: SortOrder,
    page: usize,
    page_size: usize,
}

fn normalize_text(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

impl SearchQuery {
    fn normalize(&self) -> Result<NormalizedSearch, EngineError> {
        let stay = match (self.check_in_date, self.check_out_date) {
            (Some(a), Some(b)) => Some(validate_range(a, b)?),
            (None, None) => None,
            _ => {
                return Err(EngineError::validation(
                    "check_in_date and check_out_date must be given together",
                ));
            }
        };
        let guests = match (self.adults, self.children) {
            (None, None) => None,
            (a, c) => Some(a.unwrap_or(0).saturating_add(c.unwrap_or(0))),
        };
        let mut amenities: Vec<String> = self
            .amenities
            .iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        amenities.sort();
        amenities.dedup();

        let sort_by = self
            .sort_by
            .as_deref()
            .map(str::parse::<SortField>)
            .transpose()?
            .unwrap_or_default();
        let sort_order = self
            .sort_order
            .as_deref()
            .map(str::parse::<SortOrder>)
            .transpose()?
            .unwrap_or_default();
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        Ok(NormalizedSearch {
            stay,
            guests,
            name: normalize_text(&self.name),
            region: normalize_text(&self.region),
            slug: self.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from),
            amenities,
            min_price: self.min_price,
            max_price: self.max_price,
            free_cancellation: self.free_cancellation,
            sort_by,
            sort_order,
            page,
            page_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub listing: Listing,
    /// Average resolved nightly price over the stay, or the default price without dates.
    pub nightly_price: f64,
    pub daily_prices: Vec<NightlyPrice>,
    pub total_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCategory {
    Upcoming,
    Past,
    Cancelled,
    Paid,
    NotPaid,
}

impl GuestCategory {
    fn matches(&self, r: &Reservation, today: NaiveDate) -> bool {
        match self {
            GuestCategory::Upcoming => r.stay.check_in > today && r.status.holds_calendar(),
            GuestCategory::Past => r.stay.check_out <= today,
            GuestCategory::Cancelled => r.status == ReservationStatus::Canceled,
            GuestCategory::Paid => r.status.is_paid(),
            GuestCategory::NotPaid => r.status.is_expirable(),
        }
    }
}

impl FromStr for GuestCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upcoming" => Ok(GuestCategory::Upcoming),
            "past" => Ok(GuestCategory::Past),
            "cancelled" | "canceled" => Ok(GuestCategory::Cancelled),
            "paid" => Ok(GuestCategory::Paid),
            "not_paid" => Ok(GuestCategory::NotPaid),
            other => Err(EngineError::validation(format!("unknown reservation category: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSummary {
    pub host_id: Ulid,
    pub date: NaiveDate,
    pub check_ins_today: usize,
    pub check_outs_today: usize,
    pub earnings: f64,
}

/// Whether `ls` can take `stay` right now. The failing rule is not reported.
fn stay_is_bookable(ls: &ListingState, stay: &StayRange, now: chrono::NaiveDateTime) -> bool {
    is_stay_open(ls.listing.default_availability, &ls.availability_overrides, stay)
        && validate_stay(&ls.listing.policy, stay, now).is_ok()
        && find_clash(ls, stay, None).is_none()
}

impl Engine {
    pub async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError> {
        let ls = self
            .get_listing_state(&id)
            .ok_or_else(|| EngineError::listing_not_found(id))?;
        let guard = ls.read().await;
        if guard.listing.deleted_at.is_some() {
            return Err(EngineError::listing_not_found(id));
        }
        Ok(guard.listing.clone())
    }

    pub async fn get_listing_by_slug(&self, slug: &str) -> Result<Listing, EngineError> {
        let id = self
            .listing_id_for_slug(slug)
            .ok_or_else(|| EngineError::listing_not_found(slug))?;
        self.get_listing(id).await
    }

    /// Availability and price for `slug` over `[check_in, check_out)`.
    ///
    /// An unknown slug, any failing rule, a closed night or an overlapping
    /// reservation yields `NotAvailable`. The guest count is checked against the listing capacity
    /// after the cache, so one cached answer serves every party size.
    pub async fn check_availability(
        &self,
        slug: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: Option<u32>,
        use_cache: bool,
    ) -> Result<AvailabilityQuote, EngineError> {
        let stay = validate_range(check_in, check_out)?;
        let key = SearchCache::availability_key(slug, &stay);
        let quote = self
            .cache
            .read_through("availability", &key, use_cache, || self.quote_stay(slug, stay))
            .await?;
        if let Some(guests) = guests
            && guests > quote.guest_capacity
        {
            return Err(EngineError::NotAvailable);
        }
        Ok(quote)
    }

    /// An unknown slug answers like a closed listing, so the cache can hold it.
    async fn quote_stay(&self, slug: &str, stay: StayRange) -> Result<AvailabilityQuote, EngineError> {
        let id = self.listing_id_for_slug(slug).ok_or(EngineError::NotAvailable)?;
        let ls = self.get_listing_state(&id).ok_or(EngineError::NotAvailable)?;
        let guard = ls.read().await;
        if !guard.listing.is_searchable() {
            return Err(EngineError::NotAvailable);
        }
        if !stay_is_bookable(&guard, &stay, self.clock.now().naive_utc()) {
            return Err(EngineError::NotAvailable);
        }
        let price = price_stay(guard.listing.default_price, &guard.price_overrides, &stay);
        Ok(AvailabilityQuote {
            listing_id: id,
            slug: guard.listing.slug.clone(),
            stay,
            guest_capacity: guard.listing.guest_capacity,
            daily_prices: price.nights,
            total_price: price.total,
        })
    }

    /// Filter, sort and page listed listings. Invalid sort options are
    /// rejected before the cache is consulted.
    pub async fn search(&self, query: &SearchQuery, use_cache: bool) -> Result<SearchPage, EngineError> {
        let normalized = query.normalize()?;
        let key = SearchCache::search_key(&normalized)?;
        self.cache
            .read_through("search", &key, use_cache, || self.run_search(&normalized))
            .await
    }

    async fn run_search(&self, q: &NormalizedSearch) -> Result<SearchPage, EngineError> {
        let now = self.clock.now().naive_utc();
        let states: Vec<_> = self.listings.iter().map(|e| e.value().clone()).collect();
        let mut hits = Vec::new();

        for ls in states {
            let guard = ls.read().await;
            let listing = &guard.listing;
            if !listing.is_searchable() {
                continue;
            }
            if let Some(name) = &q.name
                && !listing.name.to_lowercase().contains(name.as_str())
            {
                continue;
            }
            if let Some(region) = &q.region
                && listing.region.as_deref().map(str::to_lowercase).as_ref() != Some(region)
            {
                continue;
            }
            if q.slug.as_ref().is_some_and(|s| *s != listing.slug) {
                continue;
            }
            if !q.amenities.is_empty() {
                let offered: Vec<String> = listing.amenities.iter().map(|a| a.to_lowercase()).collect();
                if !q.amenities.iter().all(|a| offered.contains(a)) {
                    continue;
                }
            }
            if q.free_cancellation.is_some_and(|f| f != listing.free_cancellation) {
                continue;
            }
            if q.guests.is_some_and(|g| g > listing.guest_capacity) {
                continue;
            }

            let (nightly_price, daily_prices, total_price) = match &q.stay {
                Some(stay) => {
                    if !stay_is_bookable(&guard, stay, now) {
                        continue;
                    }
                    let price = price_stay(listing.default_price, &guard.price_overrides, stay);
                    (price.average_nightly(), price.nights, Some(price.total))
                }
                None => (listing.default_price.unwrap_or(0.0), Vec::new(), None),
            };
            if q.min_price.is_some_and(|min| nightly_price < min)
                || q.max_price.is_some_and(|max| nightly_price > max)
            {
                continue;
            }

            hits.push(SearchHit {
                listing: listing.clone(),
                nightly_price,
                daily_prices,
                total_price,
            });
        }

        hits.sort_by(|a, b| {
            let ord = match q.sort_by {
                SortField::Name => a.listing.name.to_lowercase().cmp(&b.listing.name.to_lowercase()),
                SortField::CreatedAt => a.listing.created_at.cmp(&b.listing.created_at),
                SortField::DefaultPrice => a
                    .listing
                    .default_price
                    .unwrap_or(0.0)
                    .total_cmp(&b.listing.default_price.unwrap_or(0.0)),
                SortField::Price => a.nightly_price.total_cmp(&b.nightly_price),
            }
            .then_with(|| a.listing.id.cmp(&b.listing.id));
            match q.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = hits.len();
        let hits = hits
            .into_iter()
            .skip((q.page - 1).saturating_mul(q.page_size))
            .take(q.page_size)
            .collect();
        Ok(SearchPage { hits, total, page: q.page, page_size: q.page_size })
    }

    /// Live overrides of one kind for a listing, ordered by span start.
    pub async fn list_overrides(
        &self,
        kind: OverrideKind,
        listing_id: Ulid,
    ) -> Result<Vec<(DateSpan, OverrideValue)>, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::listing_not_found(listing_id))?;
        let guard = ls.read().await;
        let mut out: Vec<(DateSpan, OverrideValue)> = match kind {
            OverrideKind::Availability => guard
                .active_availability_overrides()
                .map(|o| (o.span, OverrideValue::Available(o.available)))
                .collect(),
            OverrideKind::Price => guard
                .active_price_overrides()
                .map(|o| (o.span, OverrideValue::Price(o.price)))
                .collect(),
        };
        out.sort_by_key(|(span, _)| (span.start, span.end));
        Ok(out)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let listing_id = self
            .listing_for_reservation(&id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let guard = ls.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    /// Every reservation of a listing, ordered by check-in. Soft-deleted rows are hidden.
    pub async fn listing_reservations(&self, listing_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or_else(|| EngineError::listing_not_found(listing_id))?;
        let guard = ls.read().await;
        Ok(guard
            .reservations
            .iter()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect())
    }

    pub async fn guest_reservations(
        &self,
        guest_id: Ulid,
        category: Option<GuestCategory>,
    ) -> Vec<Reservation> {
        let today = self.clock.now().date_naive();
        let mut out = self
            .collect_reservations(|r| {
                r.guest_id == guest_id && category.is_none_or(|c| c.matches(r, today))
            })
            .await;
        out.sort_by(|a, b| {
            a.stay
                .check_in
                .cmp(&b.stay.check_in)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Today's check-ins and check-outs for a host, plus earnings over paid reservations.
    pub async fn host_summary(&self, host_id: Ulid) -> HostSummary {
        let today = self.clock.now().date_naive();
        let mine = self.collect_reservations(|r| r.host_id == host_id).await;
        let check_ins_today = mine
            .iter()
            .filter(|r| r.stay.check_in == today && r.status.holds_calendar())
            .count();
        let check_outs_today = mine
            .iter()
            .filter(|r| r.stay.check_out == today && r.status.holds_calendar())
            .count();
        let earnings = mine
            .iter()
            .filter(|r| r.status.is_paid())
            .map(|r| r.total_price)
            .sum();
        HostSummary { host_id, date: today, check_ins_today, check_outs_today, earnings }
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let states: Vec<_> = self.listings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ls in states {
            let guard = ls.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.deleted_at.is_none() && keep(*r))
                    .cloned(),
            );
        }
        out
    }
}
