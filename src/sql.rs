use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{
    GuestCategory, ListingInput, OverrideKind, OverrideValue, QuoteTerms, ReservationPatch,
    SearchQuery,
};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug)]
pub enum Command {
    InsertListing(ListingInput),
    /// Columns from `SET`, merged over the stored listing by the caller.
    UpdateListing {
        id: Ulid,
        changes: Row,
    },
    DeleteListing {
        id: Ulid,
    },
    SelectListing {
        id: Ulid,
    },
    SearchListings(SearchRequest),
    InsertOverride {
        listing_id: Ulid,
        span: DateSpan,
        value: OverrideValue,
    },
    UpdateOverride {
        listing_id: Ulid,
        span: DateSpan,
        value: OverrideValue,
    },
    DeleteOverride {
        kind: OverrideKind,
        listing_id: Ulid,
        span: DateSpan,
    },
    SelectOverrides {
        kind: OverrideKind,
        listing_id: Ulid,
    },
    SelectBookHash(QuoteTerms),
    InsertPreReservation(ReservationDraft),
    SelectPreReservation {
        book_hash: String,
    },
    InsertReservation {
        draft: ReservationDraft,
        book_hash: Option<String>,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations(ReservationFilter),
    SelectAvailability {
        slug: String,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: Option<u32>,
        use_cache: bool,
    },
    SelectHostSummary {
        host_id: Ulid,
    },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: SearchQuery,
    pub use_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReservationFilter {
    Id(Ulid),
    Listing(Ulid),
    Guest {
        guest_id: Ulid,
        category: Option<GuestCategory>,
    },
}

/// A literal from the query text. Bound parameters arrive as quoted text.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(String),
    Text(String),
    List(Vec<Literal>),
}

impl Literal {
    fn as_text(&self) -> Option<String> {
        match self {
            Literal::Null | Literal::List(_) => None,
            Literal::Bool(b) => Some(b.to_string()),
            Literal::Number(s) | Literal::Text(s) => Some(s.clone()),
        }
    }
}

/// Column name → literal, collected from INSERT columns, UPDATE SET, or a
/// WHERE chain of `col = value` joined by AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, Literal>);

impl Row {
    fn insert(&mut self, column: String, value: Literal) -> Result<(), SqlError> {
        if self.0.insert(column.clone(), value).is_some() {
            return Err(SqlError::Parse(format!("column given twice: {column}")));
        }
        Ok(())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check_columns(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.keys().find(|c| !allowed.contains(&c.as_str())) {
            Some(c) => Err(SqlError::UnknownColumn { table: table.to_string(), column: c.clone() }),
            None => Ok(()),
        }
    }

    /// `None` when the column is absent or NULL.
    pub fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.0.get(column) {
            None | Some(Literal::Null) => Ok(None),
            Some(Literal::List(_)) => Err(invalid(column, "expected a scalar")),
            Some(lit) => Ok(lit.as_text()),
        }
    }

    pub fn parse<T>(&self, column: &str) -> Result<Option<T>, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.text(column)?
            .map(|s| s.trim().parse::<T>().map_err(|e| invalid(column, e)))
            .transpose()
    }

    fn require<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.parse(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn require_text(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        match self.0.get(column) {
            None | Some(Literal::Null) => Ok(None),
            Some(Literal::Bool(b)) => Ok(Some(*b)),
            Some(Literal::Number(n)) => Ok(Some(n != "0")),
            Some(Literal::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Some(true)),
                "false" | "f" | "0" => Ok(Some(false)),
                _ => Err(invalid(column, format!("bad bool: {s}"))),
            },
            Some(Literal::List(_)) => Err(invalid(column, "expected a bool")),
        }
    }

    /// Array literal, or comma-separated text.
    fn list(&self, column: &str) -> Result<Option<Vec<String>>, SqlError> {
        match self.0.get(column) {
            None => Ok(None),
            Some(Literal::Null) => Ok(Some(Vec::new())),
            Some(Literal::List(items)) => items
                .iter()
                .map(|i| i.as_text().ok_or_else(|| invalid(column, "expected text elements")))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(lit) => Ok(Some(
                lit.as_text()
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }

    /// `HH:MM` or `HH:MM:SS`.
    fn time(&self, column: &str) -> Result<Option<NaiveTime>, SqlError> {
        self.text(column)?
            .map(|s| {
                let s = s.trim();
                NaiveTime::parse_from_str(s, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                    .map_err(|e| invalid(column, e))
            })
            .transpose()
    }
}

fn invalid(column: &str, message: impl Display) -> SqlError {
    SqlError::InvalidValue { column: column.to_string(), message: message.to_string() }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            let table = table_factor_name(&table.relation)?;
            let mut set = Row::default();
            for a in assignments {
                let column = match &a.target {
                    AssignmentTarget::ColumnName(name) => object_name_last(name)
                        .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
                    AssignmentTarget::Tuple(_) => {
                        return Err(SqlError::Unsupported("tuple assignment".into()));
                    }
                };
                set.insert(column, literal(&a.value)?)?;
            }
            parse_update(&table, set, where_row(selection.as_ref())?)
        }
        Statement::Delete(delete) => {
            let table = delete_table_name(delete)?;
            parse_delete(&table, where_row(delete.selection.as_ref())?)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Insert,
    Update,
    Delete,
    Select,
}

/// Statement kind and target table, without reading any literal. Prepared
/// statements are described with their `$n` parameters still unbound.
pub fn statement_target(sql: &str) -> Result<(Verb, String), SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    match stmt {
        Statement::Insert(insert) => Ok((Verb::Insert, insert_table_name(insert)?)),
        Statement::Update { table, .. } => Ok((Verb::Update, table_factor_name(&table.relation)?)),
        Statement::Delete(delete) => Ok((Verb::Delete, delete_table_name(delete)?)),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => match select.from.first() {
                Some(from) => Ok((Verb::Select, table_factor_name(&from.relation)?)),
                None => Err(SqlError::Parse("SELECT without FROM".into())),
            },
            _ => Err(SqlError::Unsupported("non-SELECT query".into())),
        },
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Per-table column sets ─────────────────────────────────────

const LISTING_COLUMNS: &[&str] = &[
    "slug",
    "name",
    "address",
    "host_id",
    "region",
    "amenities",
    "guest_capacity",
    "default_price",
    "default_availability",
    "free_cancellation",
    "status",
    "booking_window",
    "buffer_period",
    "restricted_check_in",
    "restricted_check_out",
    "min_booking_night",
    "max_booking_night",
    "same_day_cutoff",
];

const POLICY_COLUMNS: &[&str] = &[
    "booking_window",
    "buffer_period",
    "restricted_check_in",
    "restricted_check_out",
    "min_booking_night",
    "max_booking_night",
    "same_day_cutoff",
];

const SEARCH_COLUMNS: &[&str] = &[
    "check_in_date",
    "check_out_date",
    "adults",
    "children",
    "name",
    "region",
    "slug",
    "amenities",
    "min_price",
    "max_price",
    "free_cancellation",
    "sort_by",
    "sort_order",
    "page",
    "page_size",
    "use_cache",
];

const DRAFT_COLUMNS: &[&str] = &[
    "listing_id",
    "guest_id",
    "host_id",
    "check_in_date",
    "check_out_date",
    "night_staying",
    "guest_number",
    "base_price",
    "service_fee",
    "tax",
    "guest_deposit",
    "total_price",
    "guest_info",
    "guest_wallet_address",
];

const PATCH_COLUMNS: &[&str] = &[
    "check_in_date",
    "check_out_date",
    "night_staying",
    "guest_number",
    "base_price",
    "service_fee",
    "tax",
    "guest_deposit",
    "total_price",
    "guest_info",
    "guest_wallet_address",
    "status",
    "cancel_reason",
    "cancelled_by",
];

const TERMS_COLUMNS: &[&str] = &[
    "listing_id",
    "check_in_date",
    "check_out_date",
    "night_staying",
    "total_price",
    "guest_number",
];

fn override_kind(table: &str) -> Option<OverrideKind> {
    match table {
        "availability_overrides" => Some(OverrideKind::Availability),
        "price_overrides" => Some(OverrideKind::Price),
        _ => None,
    }
}

fn override_value_column(kind: OverrideKind) -> &'static str {
    match kind {
        OverrideKind::Availability => "available",
        OverrideKind::Price => "price",
    }
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert)?;

    if let Some(kind) = override_kind(&table) {
        let value_col = override_value_column(kind);
        row.check_columns(&table, &["listing_id", "start_date", "end_date", value_col])?;
        let (listing_id, span) = override_key(&row)?;
        return Ok(Command::InsertOverride { listing_id, span, value: override_value(kind, &row)? });
    }

    match table.as_str() {
        "listings" => {
            row.check_columns(&table, LISTING_COLUMNS)?;
            let base = ListingInput {
                slug: row.require_text("slug")?,
                name: row.require_text("name")?,
                address: None,
                host_id: row.require("host_id")?,
                region: None,
                amenities: Vec::new(),
                guest_capacity: row.require("guest_capacity")?,
                default_price: None,
                default_availability: true,
                free_cancellation: false,
                status: ListingStatus::Draft,
                policy: BookingPolicy::default(),
            };
            Ok(Command::InsertListing(apply_listing_changes(base, &row)?))
        }
        "pre_reservations" => {
            row.check_columns(&table, DRAFT_COLUMNS)?;
            Ok(Command::InsertPreReservation(draft_from_row(&row)?))
        }
        "reservations" => {
            let mut allowed = DRAFT_COLUMNS.to_vec();
            allowed.push("book_hash");
            row.check_columns(&table, &allowed)?;
            Ok(Command::InsertReservation {
                draft: draft_from_row(&row)?,
                book_hash: row.text("book_hash")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(table: &str, set: Row, filter: Row) -> Result<Command, SqlError> {
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    if let Some(kind) = override_kind(table) {
        set.check_columns(table, &[override_value_column(kind)])?;
        filter.check_columns(table, &["listing_id", "start_date", "end_date"])?;
        let (listing_id, span) = override_key(&filter)?;
        return Ok(Command::UpdateOverride { listing_id, span, value: override_value(kind, &set)? });
    }

    match table {
        "listings" => {
            set.check_columns(table, LISTING_COLUMNS)?;
            Ok(Command::UpdateListing { id: where_id(table, &filter)?, changes: set })
        }
        "reservations" => {
            set.check_columns(table, PATCH_COLUMNS)?;
            let patch = ReservationPatch {
                check_in_date: set.parse("check_in_date")?,
                check_out_date: set.parse("check_out_date")?,
                night_staying: set.parse("night_staying")?,
                guest_number: set.parse("guest_number")?,
                base_price: set.parse("base_price")?,
                service_fee: set.parse("service_fee")?,
                tax: set.parse("tax")?,
                guest_deposit: set.parse("guest_deposit")?,
                total_price: set.parse("total_price")?,
                guest_info: set.text("guest_info")?,
                guest_wallet_address: set.text("guest_wallet_address")?,
                status: set.parse("status")?,
                cancel_reason: set.text("cancel_reason")?,
                cancelled_by: set.parse("cancelled_by")?,
            };
            Ok(Command::UpdateReservation { id: where_id(table, &filter)?, patch })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_delete(table: &str, filter: Row) -> Result<Command, SqlError> {
    if let Some(kind) = override_kind(table) {
        filter.check_columns(table, &["listing_id", "start_date", "end_date"])?;
        let (listing_id, span) = override_key(&filter)?;
        return Ok(Command::DeleteOverride { kind, listing_id, span });
    }

    match table {
        "listings" => Ok(Command::DeleteListing { id: where_id(table, &filter)? }),
        "reservations" => Ok(Command::DeleteReservation { id: where_id(table, &filter)? }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filter = where_row(select.selection.as_ref())?;

    if let Some(kind) = override_kind(&table) {
        filter.check_columns(&table, &["listing_id"])?;
        return Ok(Command::SelectOverrides { kind, listing_id: filter_ulid(&filter, "listing_id")? });
    }

    match table.as_str() {
        "listings" if filter.contains("id") => {
            filter.check_columns(&table, &["id"])?;
            Ok(Command::SelectListing { id: filter_ulid(&filter, "id")? })
        }
        "listings" => {
            filter.check_columns(&table, SEARCH_COLUMNS)?;
            let query = SearchQuery {
                check_in_date: filter.parse("check_in_date")?,
                check_out_date: filter.parse("check_out_date")?,
                adults: filter.parse("adults")?,
                children: filter.parse("children")?,
                name: filter.text("name")?,
                region: filter.text("region")?,
                slug: filter.text("slug")?,
                amenities: filter.list("amenities")?.unwrap_or_default(),
                min_price: filter.parse("min_price")?,
                max_price: filter.parse("max_price")?,
                free_cancellation: filter.bool("free_cancellation")?,
                sort_by: filter.text("sort_by")?,
                sort_order: filter.text("sort_order")?,
                page: filter.parse("page")?,
                page_size: filter.parse("page_size")?,
            };
            let use_cache = filter.bool("use_cache")?.unwrap_or(true);
            Ok(Command::SearchListings(SearchRequest { query, use_cache }))
        }
        "book_hash" => {
            filter.check_columns(&table, TERMS_COLUMNS)?;
            Ok(Command::SelectBookHash(QuoteTerms {
                listing_id: filter_ulid(&filter, "listing_id")?,
                check_in_date: filter.require("check_in_date")?,
                check_out_date: filter.require("check_out_date")?,
                night_staying: filter.require("night_staying")?,
                total_price: filter.require("total_price")?,
                guest_number: filter.require("guest_number")?,
            }))
        }
        "pre_reservations" => {
            filter.check_columns(&table, &["book_hash"])?;
            let book_hash = filter.text("book_hash")?.ok_or(SqlError::MissingFilter("book_hash"))?;
            Ok(Command::SelectPreReservation { book_hash })
        }
        "reservations" => {
            filter.check_columns(&table, &["id", "listing_id", "guest_id", "category"])?;
            let by = if filter.contains("id") {
                ReservationFilter::Id(filter_ulid(&filter, "id")?)
            } else if filter.contains("listing_id") {
                ReservationFilter::Listing(filter_ulid(&filter, "listing_id")?)
            } else if filter.contains("guest_id") {
                let category = filter
                    .text("category")?
                    .map(|c| c.parse::<GuestCategory>().map_err(|e| invalid("category", e)))
                    .transpose()?;
                ReservationFilter::Guest { guest_id: filter_ulid(&filter, "guest_id")?, category }
            } else {
                return Err(SqlError::MissingFilter("id, listing_id or guest_id"));
            };
            Ok(Command::SelectReservations(by))
        }
        "availability" => {
            filter.check_columns(
                &table,
                &["slug", "check_in_date", "check_out_date", "adults", "children", "use_cache"],
            )?;
            let adults: Option<u32> = filter.parse("adults")?;
            let children: Option<u32> = filter.parse("children")?;
            let guests = match (adults, children) {
                (None, None) => None,
                (a, c) => Some(a.unwrap_or(0).saturating_add(c.unwrap_or(0))),
            };
            Ok(Command::SelectAvailability {
                slug: filter.text("slug")?.ok_or(SqlError::MissingFilter("slug"))?,
                check_in: filter.parse("check_in_date")?.ok_or(SqlError::MissingFilter("check_in_date"))?,
                check_out: filter
                    .parse("check_out_date")?
                    .ok_or(SqlError::MissingFilter("check_out_date"))?,
                guests,
                use_cache: filter.bool("use_cache")?.unwrap_or(true),
            })
        }
        "host_summary" => {
            filter.check_columns(&table, &["host_id"])?;
            Ok(Command::SelectHostSummary { host_id: filter_ulid(&filter, "host_id")? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row → engine inputs ───────────────────────────────────────

/// Overlay the listing columns present in `changes` onto `base`. Any policy
/// column replaces the whole policy; columns left out fall back to defaults.
pub fn apply_listing_changes(mut base: ListingInput, changes: &Row) -> Result<ListingInput, SqlError> {
    if let Some(slug) = changes.text("slug")? {
        base.slug = slug;
    }
    if let Some(name) = changes.text("name")? {
        base.name = name;
    }
    if changes.contains("address") {
        base.address = changes.text("address")?;
    }
    if let Some(host_id) = changes.parse("host_id")? {
        base.host_id = host_id;
    }
    if changes.contains("region") {
        base.region = changes.text("region")?;
    }
    if let Some(amenities) = changes.list("amenities")? {
        base.amenities = amenities;
    }
    if let Some(capacity) = changes.parse("guest_capacity")? {
        base.guest_capacity = capacity;
    }
    if changes.contains("default_price") {
        base.default_price = changes.parse("default_price")?;
    }
    if let Some(open) = changes.bool("default_availability")? {
        base.default_availability = open;
    }
    if let Some(free) = changes.bool("free_cancellation")? {
        base.free_cancellation = free;
    }
    if let Some(status) = changes.parse("status")? {
        base.status = status;
    }
    if POLICY_COLUMNS.iter().any(|c| changes.contains(c)) {
        base.policy = policy_from_row(changes)?;
    }
    Ok(base)
}

fn policy_from_row(row: &Row) -> Result<BookingPolicy, SqlError> {
    Ok(BookingPolicy {
        booking_window: row.parse("booking_window")?.unwrap_or_default(),
        buffer_period: row.parse("buffer_period")?.unwrap_or_default(),
        restricted_check_in: row.parse("restricted_check_in")?.unwrap_or_default(),
        restricted_check_out: row.parse("restricted_check_out")?.unwrap_or_default(),
        min_nights: row.parse("min_booking_night")?,
        max_nights: row.parse("max_booking_night")?,
        same_day_cutoff: row.time("same_day_cutoff")?,
    })
}

fn draft_from_row(row: &Row) -> Result<ReservationDraft, SqlError> {
    Ok(ReservationDraft {
        listing_id: row.require("listing_id")?,
        guest_id: row.require("guest_id")?,
        host_id: row.parse("host_id")?,
        check_in_date: row.require("check_in_date")?,
        check_out_date: row.require("check_out_date")?,
        night_staying: row.require("night_staying")?,
        guest_number: row.require("guest_number")?,
        base_price: row.parse("base_price")?.unwrap_or(0.0),
        service_fee: row.parse("service_fee")?.unwrap_or(0.0),
        tax: row.parse("tax")?.unwrap_or(0.0),
        guest_deposit: row.parse("guest_deposit")?.unwrap_or(0.0),
        total_price: row.require("total_price")?,
        guest_info: row.text("guest_info")?,
        guest_wallet_address: row.text("guest_wallet_address")?,
    })
}

fn override_key(row: &Row) -> Result<(Ulid, DateSpan), SqlError> {
    let listing_id = filter_ulid(row, "listing_id")?;
    let start = row.parse("start_date")?.ok_or(SqlError::MissingFilter("start_date"))?;
    let end = row.parse("end_date")?.ok_or(SqlError::MissingFilter("end_date"))?;
    Ok((listing_id, DateSpan::new(start, end)))
}

fn override_value(kind: OverrideKind, row: &Row) -> Result<OverrideValue, SqlError> {
    match kind {
        OverrideKind::Availability => row
            .bool("available")?
            .map(OverrideValue::Available)
            .ok_or(SqlError::MissingColumn("available")),
        OverrideKind::Price => Ok(OverrideValue::Price(row.require("price")?)),
    }
}

fn filter_ulid(row: &Row, column: &'static str) -> Result<Ulid, SqlError> {
    row.parse(column)?.ok_or(SqlError::MissingFilter(column))
}

fn where_id(table: &str, filter: &Row) -> Result<Ulid, SqlError> {
    filter.check_columns(table, &["id"])?;
    filter_ulid(filter, "id")
}

// ── AST helpers ───────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// Single-row INSERT with an explicit column list, zipped into a `Row`.
fn insert_row(insert: &ast::Insert) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT requires a column list".into()));
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity { columns: insert.columns.len(), values: values.len() });
    }
    let mut row = Row::default();
    for (col, expr) in insert.columns.iter().zip(values) {
        row.insert(col.value.to_lowercase(), literal(expr)?)?;
    }
    Ok(row)
}

/// Flatten `a = 1 AND b = 2 ...` into a `Row`. Any other predicate is rejected.
fn where_row(selection: Option<&Expr>) -> Result<Row, SqlError> {
    let mut row = Row::default();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut row)?;
    }
    Ok(row)
}

fn collect_equalities(expr: &Expr, row: &mut Row) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, row),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_equalities(left, row)?;
            collect_equalities(right, row)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            row.insert(column, literal(right)?)
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Result<Literal, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.clone())),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Ok(Literal::Text(s.clone()))
            }
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => match literal(expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            _ => Err(SqlError::Parse(format!("cannot negate {expr}"))),
        },
        Expr::Nested(inner) => literal(inner),
        Expr::Array(array) => array.elem.iter().map(literal).collect::<Result<_, _>>().map(Literal::List),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {column} for {table}")]
    UnknownColumn { table: String, column: String },
    #[error("{columns} columns but {values} values")]
    WrongArity { columns: usize, values: usize },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value for {column}: {message}")]
    InvalidValue { column: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const GUEST: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn parse_insert_listing_with_policy() {
        let sql = format!(
            "INSERT INTO listings (slug, name, host_id, guest_capacity, default_price, amenities, \
             status, booking_window, buffer_period, restricted_check_in, min_booking_night, same_day_cutoff) \
             VALUES ('sea-view', 'Sea View', '{GUEST}', 4, 120.5, ARRAY['wifi', 'pool'], 'LISTED', \
             '3 months', '1 night', '0,6', 2, '14:00')"
        );
        let cmd = parse_sql(&sql).unwrap();
        let Command::InsertListing(input) = cmd else { panic!("expected InsertListing, got {cmd:?}") };
        assert_eq!(input.slug, "sea-view");
        assert_eq!(input.guest_capacity, 4);
        assert_eq!(input.default_price, Some(120.5));
        assert_eq!(input.amenities, vec!["wifi", "pool"]);
        assert_eq!(input.status, ListingStatus::Listed);
        assert!(input.default_availability);
        assert_eq!(input.policy.buffer_period, BufferPeriod::OneNight);
        assert_eq!(input.policy.min_nights, Some(2));
        assert_eq!(input.policy.max_nights, None);
        assert_eq!(input.policy.same_day_cutoff, NaiveTime::from_hms_opt(14, 0, 0));
        assert!(input.policy.restricted_check_in.contains(chrono::Weekday::Sat));
    }

    #[test]
    fn listing_insert_requires_core_columns() {
        let sql = format!("INSERT INTO listings (slug, host_id, guest_capacity) VALUES ('a', '{GUEST}', 2)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn bad_booking_window_is_rejected_at_parse_time() {
        let sql = format!(
            "INSERT INTO listings (slug, name, host_id, guest_capacity, booking_window) \
             VALUES ('a', 'A', '{GUEST}', 2, 'three months')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue { .. })));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let sql = format!(
            "INSERT INTO listings (slug, name, host_id, guest_capacity, colour) VALUES ('a', 'A', '{GUEST}', 2, 'red')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn { .. })));
    }

    #[test]
    fn listing_update_replaces_policy_as_a_whole() {
        let sql = format!("UPDATE listings SET name = 'Renamed', buffer_period = '2 nights' WHERE id = '{LISTING}'");
        let Command::UpdateListing { id, changes } = parse_sql(&sql).unwrap() else { panic!() };
        assert_eq!(id.to_string(), LISTING);

        let base = ListingInput {
            slug: "s".into(),
            name: "Old".into(),
            address: Some("1 Main St".into()),
            host_id: Ulid::nil(),
            region: None,
            amenities: vec![],
            guest_capacity: 2,
            default_price: Some(10.0),
            default_availability: true,
            free_cancellation: false,
            status: ListingStatus::Listed,
            policy: BookingPolicy { min_nights: Some(3), ..Default::default() },
        };
        let merged = apply_listing_changes(base, &changes).unwrap();
        assert_eq!(merged.name, "Renamed");
        assert_eq!(merged.address.as_deref(), Some("1 Main St"));
        assert_eq!(merged.policy.buffer_period, BufferPeriod::TwoNights);
        assert_eq!(merged.policy.min_nights, None);
    }

    #[test]
    fn parse_override_statements() {
        let sql = format!(
            "INSERT INTO price_overrides (listing_id, start_date, end_date, price) \
             VALUES ('{LISTING}', '2024-12-24', '2024-12-26', 300)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertOverride { span, value, .. } => {
                assert_eq!(span, DateSpan::new(d("2024-12-24"), d("2024-12-26")));
                assert_eq!(value, OverrideValue::Price(300.0));
            }
            other => panic!("expected InsertOverride, got {other:?}"),
        }

        let sql = format!(
            "UPDATE availability_overrides SET available = false \
             WHERE listing_id = '{LISTING}' AND start_date = '2024-12-24' AND end_date = '2024-12-26'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateOverride { value, .. } => assert_eq!(value, OverrideValue::Available(false)),
            other => panic!("expected UpdateOverride, got {other:?}"),
        }

        let sql = format!(
            "DELETE FROM availability_overrides \
             WHERE listing_id = '{LISTING}' AND start_date = '2024-12-24' AND end_date = '2024-12-26'"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::DeleteOverride { kind: OverrideKind::Availability, .. }
        ));

        let sql = format!("SELECT * FROM price_overrides WHERE listing_id = '{LISTING}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectOverrides { kind: OverrideKind::Price, .. }
        ));
    }

    #[test]
    fn parse_reservation_insert_with_hash() {
        let sql = format!(
            "INSERT INTO reservations (listing_id, guest_id, check_in_date, check_out_date, \
             night_staying, guest_number, total_price, book_hash) \
             VALUES ('{LISTING}', '{GUEST}', '2024-12-05', '2024-12-08', 3, 2, 450, 'abc')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { draft, book_hash } => {
                assert_eq!(draft.night_staying, 3);
                assert_eq!(draft.total_price, 450.0);
                assert_eq!(draft.base_price, 0.0);
                assert_eq!(draft.host_id, None);
                assert_eq!(book_hash.as_deref(), Some("abc"));
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn bound_parameters_parse_from_quoted_text() {
        // Extended-protocol parameters are substituted as quoted strings.
        let sql = "SELECT * FROM availability WHERE slug = 'sea-view' AND check_in_date = '2024-12-05' \
                   AND check_out_date = '2024-12-08' AND adults = '2' AND children = '1' AND use_cache = 'false'";
        match parse_sql(sql).unwrap() {
            Command::SelectAvailability { slug, check_in, check_out, guests, use_cache } => {
                assert_eq!(slug, "sea-view");
                assert_eq!(check_in, d("2024-12-05"));
                assert_eq!(check_out, d("2024-12-08"));
                assert_eq!(guests, Some(3));
                assert!(!use_cache);
            }
            other => panic!("expected SelectAvailability, got {other:?}"),
        }
    }

    #[test]
    fn parse_reservation_update_patch() {
        let sql = format!(
            "UPDATE reservations SET status = 'CANCELED', cancel_reason = 'changed plans', \
             cancelled_by = '{GUEST}' WHERE id = '{LISTING}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservation { patch, .. } => {
                assert_eq!(patch.status, Some(ReservationStatus::Canceled));
                assert_eq!(patch.cancel_reason.as_deref(), Some("changed plans"));
                assert!(patch.check_in_date.is_none());
            }
            other => panic!("expected UpdateReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_search_filters() {
        let sql = "SELECT * FROM listings WHERE region = 'Lisbon' AND amenities = 'wifi, parking' \
                   AND max_price = 200 AND sort_by = 'price' AND sort_order = 'asc' AND page = 2";
        match parse_sql(sql).unwrap() {
            Command::SearchListings(SearchRequest { query, use_cache }) => {
                assert!(use_cache);
                assert_eq!(query.region.as_deref(), Some("Lisbon"));
                assert_eq!(query.amenities, vec!["wifi", "parking"]);
                assert_eq!(query.max_price, Some(200.0));
                assert_eq!(query.sort_by.as_deref(), Some("price"));
                assert_eq!(query.page, Some(2));
            }
            other => panic!("expected SearchListings, got {other:?}"),
        }

        assert!(matches!(
            parse_sql("SELECT * FROM listings").unwrap(),
            Command::SearchListings(_)
        ));
    }

    #[test]
    fn parse_reservation_selects() {
        let sql = format!("SELECT * FROM reservations WHERE guest_id = '{GUEST}' AND category = 'upcoming'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations(ReservationFilter::Guest {
                category: Some(GuestCategory::Upcoming),
                ..
            })
        ));
        let sql = format!("SELECT * FROM reservations WHERE listing_id = '{LISTING}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations(ReservationFilter::Listing(_))
        ));
        assert!(parse_sql("SELECT * FROM reservations").is_err());
        let sql = format!("SELECT * FROM reservations WHERE guest_id = '{GUEST}' AND category = 'someday'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue { .. })));
    }

    #[test]
    fn range_predicates_are_unsupported() {
        let sql = "SELECT * FROM listings WHERE min_price > 10";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM foobar WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn statement_target_ignores_placeholders() {
        let (verb, table) =
            statement_target("SELECT * FROM availability WHERE slug = $1 AND check_in_date = $2").unwrap();
        assert_eq!(verb, Verb::Select);
        assert_eq!(table, "availability");
        let (verb, table) = statement_target("UPDATE reservations SET status = $1 WHERE id = $2").unwrap();
        assert_eq!((verb, table.as_str()), (Verb::Update, "reservations"));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
