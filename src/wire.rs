use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::StaybookAuthSource;
use crate::engine::{
    AvailabilityQuote, Engine, EngineError, ListingInput, OverrideKind, OverrideValue, SearchHit,
    book_hash,
};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter, SearchRequest, SqlError, Verb};
use crate::tenant::TenantManager;

pub struct StaybookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StaybookQueryParser>,
}

impl StaybookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StaybookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertListing(input) => {
                let listing = engine.create_listing(input).await.map_err(engine_err)?;
                Ok(listing_response(&listing))
            }
            Command::UpdateListing { id, changes } => {
                let current = engine.get_listing(id).await.map_err(engine_err)?;
                let input = sql::apply_listing_changes(ListingInput::from(&current), &changes)
                    .map_err(sql_err)?;
                engine.update_listing(id, input).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteListing { id } => {
                engine.delete_listing(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectListing { id } => {
                let listing = engine.get_listing(id).await.map_err(engine_err)?;
                let hit = SearchHit {
                    nightly_price: listing.default_price.unwrap_or(0.0),
                    listing,
                    daily_prices: Vec::new(),
                    total_price: None,
                };
                search_response(vec![hit], 1)
            }
            Command::SearchListings(SearchRequest { query, use_cache }) => {
                let page = engine.search(&query, use_cache).await.map_err(engine_err)?;
                search_response(page.hits, page.total)
            }
            Command::InsertOverride { listing_id, span, value } => {
                engine
                    .create_override(listing_id, span, value)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateOverride { listing_id, span, value } => {
                engine
                    .update_override(listing_id, span, value)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteOverride { kind, listing_id, span } => {
                engine
                    .delete_override(kind, listing_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectOverrides { kind, listing_id } => {
                let overrides = engine
                    .list_overrides(kind, listing_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(override_schema(kind));
                let id = listing_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = overrides
                    .into_iter()
                    .map(|(span, value)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id)?;
                        encoder.encode_field(&span.start.to_string())?;
                        encoder.encode_field(&span.end.to_string())?;
                        match value {
                            OverrideValue::Available(open) => encoder.encode_field(&open)?,
                            OverrideValue::Price(price) => encoder.encode_field(&price)?,
                        }
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookHash(terms) => Ok(book_hash_response(&book_hash(&terms))),
            Command::InsertPreReservation(draft) => {
                let hash = engine.stage_pre_booking(&draft).await.map_err(engine_err)?;
                Ok(book_hash_response(&hash))
            }
            Command::SelectPreReservation { book_hash } => {
                let draft = engine.get_pre_booking(&book_hash).await.map_err(engine_err)?;
                let schema = Arc::new(draft_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encode_draft(&mut encoder, &draft, &book_hash)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertReservation { draft, book_hash } => {
                let reservation = engine
                    .create_reservation(draft, book_hash.as_deref())
                    .await
                    .map_err(engine_err)?;
                reservation_response(vec![reservation])
            }
            Command::UpdateReservation { id, patch } => {
                engine.update_reservation(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations(filter) => {
                let reservations = match filter {
                    ReservationFilter::Id(id) => {
                        vec![engine.get_reservation(id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::Listing(listing_id) => engine
                        .listing_reservations(listing_id)
                        .await
                        .map_err(engine_err)?,
                    ReservationFilter::Guest { guest_id, category } => {
                        engine.guest_reservations(guest_id, category).await
                    }
                };
                reservation_response(reservations)
            }
            Command::SelectAvailability { slug, check_in, check_out, guests, use_cache } => {
                let quote = engine
                    .check_availability(&slug, check_in, check_out, guests, use_cache)
                    .await
                    .map_err(engine_err)?;
                Ok(availability_response(&quote))
            }
            Command::SelectHostSummary { host_id } => {
                let summary = engine.host_summary(host_id).await;
                let schema = Arc::new(host_summary_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&summary.host_id.to_string())?;
                encoder.encode_field(&summary.date.to_string())?;
                encoder.encode_field(&(summary.check_ins_today as i64))?;
                encoder.encode_field(&(summary.check_outs_today as i64))?;
                encoder.encode_field(&summary.earnings)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn listing_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slug", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("region", Type::VARCHAR),
        field("amenities", Type::VARCHAR),
        field("guest_capacity", Type::INT8),
        field("default_price", Type::FLOAT8),
        field("default_availability", Type::BOOL),
        field("free_cancellation", Type::BOOL),
        field("status", Type::VARCHAR),
        field("booking_window", Type::VARCHAR),
        field("buffer_period", Type::VARCHAR),
        field("restricted_check_in", Type::VARCHAR),
        field("restricted_check_out", Type::VARCHAR),
        field("min_booking_night", Type::INT8),
        field("max_booking_night", Type::INT8),
        field("same_day_cutoff", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn search_schema() -> Vec<FieldInfo> {
    let mut schema = listing_schema();
    schema.extend([
        field("nightly_price", Type::FLOAT8),
        field("total_price", Type::FLOAT8),
        field("daily_prices", Type::VARCHAR),
        field("total_hits", Type::INT8),
    ]);
    schema
}

fn encode_listing(encoder: &mut DataRowEncoder, l: &Listing) -> PgWireResult<()> {
    encoder.encode_field(&l.id.to_string())?;
    encoder.encode_field(&l.slug)?;
    encoder.encode_field(&l.name)?;
    encoder.encode_field(&l.address)?;
    encoder.encode_field(&l.host_id.to_string())?;
    encoder.encode_field(&l.region)?;
    encoder.encode_field(&l.amenities.join(","))?;
    encoder.encode_field(&i64::from(l.guest_capacity))?;
    encoder.encode_field(&l.default_price)?;
    encoder.encode_field(&l.default_availability)?;
    encoder.encode_field(&l.free_cancellation)?;
    encoder.encode_field(&l.status.as_str())?;
    encoder.encode_field(&l.policy.booking_window.to_string())?;
    encoder.encode_field(&l.policy.buffer_period.to_string())?;
    encoder.encode_field(&l.policy.restricted_check_in.to_string())?;
    encoder.encode_field(&l.policy.restricted_check_out.to_string())?;
    encoder.encode_field(&l.policy.min_nights.map(i64::from))?;
    encoder.encode_field(&l.policy.max_nights.map(i64::from))?;
    encoder.encode_field(&l.policy.same_day_cutoff.map(|t| t.format("%H:%M").to_string()))?;
    encoder.encode_field(&l.created_at)?;
    Ok(())
}

fn listing_response(listing: &Listing) -> Response {
    let schema = Arc::new(listing_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode_listing(&mut encoder, listing).map(|_| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn search_response(hits: Vec<SearchHit>, total: usize) -> PgWireResult<Response> {
    let schema = Arc::new(search_schema());
    let mut rows: Vec<PgWireResult<DataRow>> = Vec::with_capacity(hits.len());
    for hit in &hits {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encode_listing(&mut encoder, &hit.listing)?;
        encoder.encode_field(&hit.nightly_price)?;
        encoder.encode_field(&hit.total_price)?;
        let daily = if hit.daily_prices.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&hit.daily_prices).map_err(|e| user_error("XX000", e.to_string()))?)
        };
        encoder.encode_field(&daily)?;
        encoder.encode_field(&(total as i64))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn override_schema(kind: OverrideKind) -> Vec<FieldInfo> {
    let value = match kind {
        OverrideKind::Availability => field("available", Type::BOOL),
        OverrideKind::Price => field("price", Type::FLOAT8),
    };
    vec![
        field("listing_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        value,
    ]
}

fn book_hash_schema() -> Vec<FieldInfo> {
    vec![field("book_hash", Type::VARCHAR)]
}

fn book_hash_response(hash: &str) -> Response {
    let schema = Arc::new(book_hash_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&hash).map(|_| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn draft_schema() -> Vec<FieldInfo> {
    vec![
        field("listing_id", Type::VARCHAR),
        field("guest_id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("check_in_date", Type::VARCHAR),
        field("check_out_date", Type::VARCHAR),
        field("night_staying", Type::INT8),
        field("guest_number", Type::INT8),
        field("base_price", Type::FLOAT8),
        field("service_fee", Type::FLOAT8),
        field("tax", Type::FLOAT8),
        field("guest_deposit", Type::FLOAT8),
        field("total_price", Type::FLOAT8),
        field("guest_info", Type::VARCHAR),
        field("guest_wallet_address", Type::VARCHAR),
        field("book_hash", Type::VARCHAR),
    ]
}

fn encode_draft(encoder: &mut DataRowEncoder, d: &ReservationDraft, hash: &str) -> PgWireResult<()> {
    encoder.encode_field(&d.listing_id.to_string())?;
    encoder.encode_field(&d.guest_id.to_string())?;
    encoder.encode_field(&d.host_id.map(|h| h.to_string()))?;
    encoder.encode_field(&d.check_in_date.to_string())?;
    encoder.encode_field(&d.check_out_date.to_string())?;
    encoder.encode_field(&i64::from(d.night_staying))?;
    encoder.encode_field(&i64::from(d.guest_number))?;
    encoder.encode_field(&d.base_price)?;
    encoder.encode_field(&d.service_fee)?;
    encoder.encode_field(&d.tax)?;
    encoder.encode_field(&d.guest_deposit)?;
    encoder.encode_field(&d.total_price)?;
    encoder.encode_field(&d.guest_info)?;
    encoder.encode_field(&d.guest_wallet_address)?;
    encoder.encode_field(&hash)?;
    Ok(())
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_number", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("guest_id", Type::VARCHAR),
        field("host_id", Type::VARCHAR),
        field("listing_name", Type::VARCHAR),
        field("listing_address", Type::VARCHAR),
        field("check_in_date", Type::VARCHAR),
        field("check_out_date", Type::VARCHAR),
        field("night_staying", Type::INT8),
        field("guest_number", Type::INT8),
        field("base_price", Type::FLOAT8),
        field("service_fee", Type::FLOAT8),
        field("tax", Type::FLOAT8),
        field("guest_deposit", Type::FLOAT8),
        field("total_price", Type::FLOAT8),
        field("guest_info", Type::VARCHAR),
        field("guest_wallet_address", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("book_hash", Type::VARCHAR),
        field("cancel_reason", Type::VARCHAR),
        field("cancelled_by", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn reservation_response(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let mut rows: Vec<PgWireResult<DataRow>> = Vec::with_capacity(reservations.len());
    for r in &reservations {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&r.id.to_string())?;
        encoder.encode_field(&r.booking_number)?;
        encoder.encode_field(&r.listing_id.to_string())?;
        encoder.encode_field(&r.guest_id.to_string())?;
        encoder.encode_field(&r.host_id.to_string())?;
        encoder.encode_field(&r.listing_name)?;
        encoder.encode_field(&r.listing_address)?;
        encoder.encode_field(&r.stay.check_in.to_string())?;
        encoder.encode_field(&r.stay.check_out.to_string())?;
        encoder.encode_field(&i64::from(r.night_staying))?;
        encoder.encode_field(&i64::from(r.guest_number))?;
        encoder.encode_field(&r.base_price)?;
        encoder.encode_field(&r.service_fee)?;
        encoder.encode_field(&r.tax)?;
        encoder.encode_field(&r.guest_deposit)?;
        encoder.encode_field(&r.total_price)?;
        encoder.encode_field(&r.guest_info)?;
        encoder.encode_field(&r.guest_wallet_address)?;
        encoder.encode_field(&r.status.as_str())?;
        encoder.encode_field(&r.book_hash)?;
        encoder.encode_field(&r.cancel_reason)?;
        encoder.encode_field(&r.cancelled_by.map(|u| u.to_string()))?;
        encoder.encode_field(&r.created_at)?;
        encoder.encode_field(&r.updated_at)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("listing_id", Type::VARCHAR),
        field("slug", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("price", Type::FLOAT8),
        field("total_price", Type::FLOAT8),
        field("nights", Type::INT8),
    ]
}

/// One row per night of the quoted stay.
fn availability_response(quote: &AvailabilityQuote) -> Response {
    let schema = Arc::new(availability_schema());
    let id = quote.listing_id.to_string();
    let nights = quote.daily_prices.len() as i64;
    let rows: Vec<PgWireResult<DataRow>> = quote
        .daily_prices
        .iter()
        .map(|night| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&id)?;
            encoder.encode_field(&quote.slug)?;
            encoder.encode_field(&night.date.to_string())?;
            encoder.encode_field(&night.price)?;
            encoder.encode_field(&quote.total_price)?;
            encoder.encode_field(&nights)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn host_summary_schema() -> Vec<FieldInfo> {
    vec![
        field("host_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("check_ins_today", Type::INT8),
        field("check_outs_today", Type::INT8),
        field("earnings", Type::FLOAT8),
    ]
}

/// Columns a statement will return, judged from its verb and table alone.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    let Ok((verb, table)) = sql::statement_target(sql_text) else {
        return vec![];
    };
    match (verb, table.as_str()) {
        (Verb::Insert, "listings") => listing_schema(),
        (Verb::Select, "listings") => search_schema(),
        (Verb::Select, "availability_overrides") => override_schema(OverrideKind::Availability),
        (Verb::Select, "price_overrides") => override_schema(OverrideKind::Price),
        (Verb::Select, "book_hash") | (Verb::Insert, "pre_reservations") => book_hash_schema(),
        (Verb::Select, "pre_reservations") => draft_schema(),
        (Verb::Insert, "reservations") | (Verb::Select, "reservations") => reservation_schema(),
        (Verb::Select, "availability") => availability_schema(),
        (Verb::Select, "host_summary") => host_summary_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaybookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaybookQueryParser;

#[async_trait]
impl QueryParser for StaybookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaybookHandler {
    type Statement = String;
    type QueryParser = StaybookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StaybookFactory {
    handler: Arc<StaybookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<StaybookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StaybookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = StaybookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaybookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaybookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: StaybookFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::AlreadyExists { .. } => "23505",
        EngineError::Validation(_) | EngineError::NotAvailable => "22023",
        EngineError::IntegrityViolation => "P0004",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Scheduling(_) | EngineError::Store(_) | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM listings"), 0);
        assert_eq!(count_params("SELECT * FROM availability WHERE slug = $1 AND check_in_date = $3"), 3);
        assert_eq!(count_params("UPDATE reservations SET status = $12 WHERE id = $2"), 12);
    }

    #[test]
    fn conflict_and_not_found_map_to_distinct_codes() {
        let conflict = sqlstate(&EngineError::Conflict(ulid::Ulid::nil()));
        let missing = sqlstate(&EngineError::NotFound { kind: "reservation", key: "x".into() });
        assert_eq!(conflict, "23P01");
        assert_eq!(missing, "P0002");
        assert_eq!(sqlstate(&EngineError::IntegrityViolation), "P0004");
        assert_eq!(sqlstate(&EngineError::NotAvailable), "22023");
    }

    #[test]
    fn describes_result_columns_from_statement_shape() {
        let schema = result_schema("SELECT * FROM availability WHERE slug = $1");
        assert_eq!(schema.len(), 6);
        let schema = result_schema("INSERT INTO pre_reservations (listing_id) VALUES ($1)");
        assert_eq!(schema.len(), 1);
        assert!(result_schema("DELETE FROM reservations WHERE id = $1").is_empty());
        assert!(result_schema("not sql at all").is_empty());
    }
}
