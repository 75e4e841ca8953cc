use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use staybook::cache::InMemoryKv;
use staybook::clock::SystemClock;
use staybook::engine::EngineSettings;
use staybook::tenant::TenantManager;
use staybook::wire::{self, StaybookFactory};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("staybook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        Arc::new(InMemoryKv::new()),
        Arc::new(SystemClock),
        EngineSettings::default(),
    ));
    let factory = StaybookFactory::new(tm, "staybook".to_string());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("staybook")
        .password("staybook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Result<Vec<SimpleQueryRow>, tokio_postgres::Error> {
    Ok(client
        .simple_query(sql)
        .await?
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect())
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<String> {
    err.as_db_error().map(|e| e.code().code().to_string())
}

fn stay() -> (NaiveDate, NaiveDate) {
    let check_in = Utc::now().date_naive() + Days::new(30);
    (check_in, check_in + Days::new(3))
}

async fn create_listing(client: &Client, slug: &str) -> String {
    let host = Ulid::new();
    let sql = format!(
        "INSERT INTO listings (slug, name, host_id, guest_capacity, default_price, status) \
         VALUES ('{slug}', 'Harbour Loft', '{host}', 4, 100, 'LISTED')"
    );
    let created = rows(client, &sql).await.unwrap();
    created[0].get("id").unwrap().to_string()
}

async fn quote_hash(client: &Client, listing_id: &str, total: &str) -> String {
    let (check_in, check_out) = stay();
    let sql = format!(
        "SELECT * FROM book_hash WHERE listing_id = '{listing_id}' AND check_in_date = '{check_in}' \
         AND check_out_date = '{check_out}' AND night_staying = 3 AND total_price = {total} AND guest_number = 2"
    );
    rows(client, &sql).await.unwrap()[0].get("book_hash").unwrap().to_string()
}

fn reservation_sql(listing_id: &str, guest: Ulid, total: &str, hash: &str) -> String {
    let (check_in, check_out) = stay();
    format!(
        "INSERT INTO reservations (listing_id, guest_id, check_in_date, check_out_date, night_staying, \
         guest_number, base_price, total_price, book_hash) \
         VALUES ('{listing_id}', '{guest}', '{check_in}', '{check_out}', 3, 2, 300, {total}, '{hash}')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn availability_quote_lists_each_night() {
    let addr = start_test_server().await;
    let client = connect(addr, "avail").await;
    create_listing(&client, "harbour-loft").await;

    let (check_in, check_out) = stay();
    let sql = format!(
        "SELECT * FROM availability WHERE slug = 'harbour-loft' \
         AND check_in_date = '{check_in}' AND check_out_date = '{check_out}' AND adults = 2"
    );
    let nights = rows(&client, &sql).await.unwrap();
    assert_eq!(nights.len(), 3);
    assert_eq!(nights[0].get("date"), Some(check_in.to_string().as_str()));
    assert_eq!(nights[0].get("total_price"), Some("300"));

    // Over capacity is the uniform "not available" answer.
    let sql = format!(
        "SELECT * FROM availability WHERE slug = 'harbour-loft' \
         AND check_in_date = '{check_in}' AND check_out_date = '{check_out}' AND adults = 5"
    );
    let err = rows(&client, &sql).await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("22023"));
}

#[tokio::test]
async fn reservation_flow_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "flow").await;
    let listing_id = create_listing(&client, "flow-loft").await;

    let hash = quote_hash(&client, &listing_id, "300").await;
    let created = rows(&client, &reservation_sql(&listing_id, Ulid::new(), "300", &hash))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert!(created[0].get("booking_number").unwrap().starts_with("SH-"));
    assert_eq!(created[0].get("status"), Some("CREATED"));
    let reservation_id = created[0].get("id").unwrap().to_string();

    // Same range again: conflict, not "not found".
    let err = rows(&client, &reservation_sql(&listing_id, Ulid::new(), "300", &hash))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("23P01"));

    // Cancelling frees the range.
    client
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'CANCELED', cancel_reason = 'plans changed' \
             WHERE id = '{reservation_id}'"
        ))
        .await
        .unwrap();
    let again = rows(&client, &reservation_sql(&listing_id, Ulid::new(), "300", &hash))
        .await
        .unwrap();
    assert_eq!(again.len(), 1);

    let listed = rows(&client, &format!("SELECT * FROM reservations WHERE listing_id = '{listing_id}'"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn altered_terms_fail_integrity_check() {
    let addr = start_test_server().await;
    let client = connect(addr, "integrity").await;
    let listing_id = create_listing(&client, "tamper-loft").await;

    let hash = quote_hash(&client, &listing_id, "300").await;
    let err = rows(&client, &reservation_sql(&listing_id, Ulid::new(), "30", &hash))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("P0004"));
}

#[tokio::test]
async fn pre_reservation_round_trip() {
    let addr = start_test_server().await;
    let client = connect(addr, "prebook").await;
    let listing_id = create_listing(&client, "prebook-loft").await;
    let (check_in, check_out) = stay();
    let guest = Ulid::new();

    let staged = rows(
        &client,
        &format!(
            "INSERT INTO pre_reservations (listing_id, guest_id, check_in_date, check_out_date, \
             night_staying, guest_number, total_price) \
             VALUES ('{listing_id}', '{guest}', '{check_in}', '{check_out}', 3, 2, 300)"
        ),
    )
    .await
    .unwrap();
    let hash = staged[0].get("book_hash").unwrap().to_string();
    assert_eq!(hash, quote_hash(&client, &listing_id, "300").await);

    let fetched = rows(&client, &format!("SELECT * FROM pre_reservations WHERE book_hash = '{hash}'"))
        .await
        .unwrap();
    assert_eq!(fetched[0].get("guest_id"), Some(guest.to_string().as_str()));

    let err = rows(&client, "SELECT * FROM pre_reservations WHERE book_hash = 'nope'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("P0002"));
}

#[tokio::test]
async fn prepared_statement_binds_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "prepared").await;
    create_listing(&client, "prepared-loft").await;
    let (check_in, check_out) = stay();

    let nights = client
        .query(
            "SELECT * FROM availability WHERE slug = $1 AND check_in_date = $2 AND check_out_date = $3",
            &[&"prepared-loft", &check_in.to_string(), &check_out.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(nights.len(), 3);
    let slug: String = nights[0].get("slug");
    assert_eq!(slug, "prepared-loft");
}

#[tokio::test]
async fn tenants_do_not_share_listings() {
    let addr = start_test_server().await;
    let a = connect(addr, "tenant_a").await;
    let b = connect(addr, "tenant_b").await;
    let listing_id = create_listing(&a, "shared-slug").await;

    // Slugs are per tenant, so B can reuse it.
    create_listing(&b, "shared-slug").await;

    let err = rows(&b, &format!("SELECT * FROM listings WHERE id = '{listing_id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("P0002"));
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "syntax").await;
    let err = rows(&client, "SELEKT nothing").await.unwrap_err();
    assert_eq!(sqlstate(&err).as_deref(), Some("42601"));
}
