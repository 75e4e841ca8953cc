use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const NIGHTLY: u32 = 100;

async fn connect(host: &str, port: u16, tenant: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(tenant)
        .user("staybook")
        .password("staybook");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn first_field(client: &Client, sql: &str, column: &str) -> Result<String, tokio_postgres::Error> {
    for msg in client.simple_query(sql).await? {
        if let SimpleQueryMessage::Row(row) = msg {
            return Ok(row.get(column).unwrap_or_default().to_string());
        }
    }
    Ok(String::new())
}

async fn create_listing(client: &Client, slug: &str, region: &str) -> String {
    let host_id = Ulid::new();
    first_field(
        client,
        &format!(
            "INSERT INTO listings (slug, name, host_id, region, guest_capacity, default_price, status) \
             VALUES ('{slug}', 'Bench {slug}', '{host_id}', '{region}', 6, {NIGHTLY}, 'LISTED')"
        ),
        "id",
    )
    .await
    .expect("create listing")
}

/// Stay starting `offset` days from tomorrow.
fn stay(offset: u64, nights: u64) -> (NaiveDate, NaiveDate) {
    let check_in = Utc::now().date_naive() + Days::new(1 + offset);
    (check_in, check_in + Days::new(nights))
}

/// Quote a hash for the stay and book it. Returns the SQLSTATE on failure.
async fn book(client: &Client, listing_id: &str, (check_in, check_out): (NaiveDate, NaiveDate)) -> Result<(), String> {
    let nights = (check_out - check_in).num_days();
    let total = nights * NIGHTLY as i64;
    let hash = first_field(
        client,
        &format!(
            "SELECT * FROM book_hash WHERE listing_id = '{listing_id}' AND check_in_date = '{check_in}' \
             AND check_out_date = '{check_out}' AND night_staying = {nights} AND total_price = {total} \
             AND guest_number = 2"
        ),
        "book_hash",
    )
    .await
    .map_err(|e| e.to_string())?;

    let guest_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (listing_id, guest_id, check_in_date, check_out_date, night_staying, \
             guest_number, base_price, total_price, book_hash) VALUES ('{listing_id}', '{guest_id}', \
             '{check_in}', '{check_out}', {nights}, 2, {total}, {total}, '{hash}')"
        ))
        .await
        .map_err(|e| e.as_db_error().map_or_else(|| e.to_string(), |db| db.code().code().to_string()))
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let listing_id = create_listing(&client, "sequential", "bench").await;

    let n = 300;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, &listing_id, stay(i as u64 * 2, 2)).await.expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("quote + book latency", &mut latencies);
}

/// Many clients race for the same nights on one listing. Exactly one may win.
async fn phase2_contended(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let listing_id = create_listing(&setup, "contended", "bench").await;
    drop(setup);

    let rounds = 20;
    let racers = 16;
    let mut double_booked = 0;
    let start = Instant::now();

    for round in 0..rounds {
        let wins = Arc::new(AtomicUsize::new(0));
        let conflicts = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..racers {
            let host = host.to_string();
            let tenant = tenant.clone();
            let listing_id = listing_id.clone();
            let wins = wins.clone();
            let conflicts = conflicts.clone();
            handles.push(tokio::spawn(async move {
                let client = connect(&host, port, &tenant).await;
                match book(&client, &listing_id, stay(round * 3, 3)).await {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(code) if code == "23P01" => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(other) => panic!("unexpected error: {other}"),
                };
            }));
        }
        for h in handles {
            h.await.expect("racer panicked");
        }
        if wins.load(Ordering::Relaxed) != 1 {
            double_booked += 1;
        }
        assert_eq!(
            wins.load(Ordering::Relaxed) + conflicts.load(Ordering::Relaxed),
            racers
        );
    }

    println!(
        "  {rounds} rounds x {racers} racers in {:.2}s, rounds without exactly one winner: {double_booked}",
        start.elapsed().as_secs_f64()
    );
}

/// Search latency, cached and uncached, while writers keep booking.
async fn phase3_search_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    for i in 0..100 {
        create_listing(&setup, &format!("search-{i}"), "coast").await;
    }
    let writer_listings: Vec<String> = {
        let mut ids = Vec::new();
        for w in 0..5 {
            ids.push(create_listing(&setup, &format!("writer-{w}"), "inland").await);
        }
        ids
    };
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for listing_id in writer_listings {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, &listing_id, stay(i, 1)).await;
                i += 1;
            }
        }));
    }

    let (check_in, check_out) = stay(400, 3);
    let mut all = Vec::new();
    for use_cache in [false, true] {
        let mut handles = Vec::new();
        for _ in 0..10 {
            let host = host.to_string();
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                let client = connect(&host, port, &tenant).await;
                let mut latencies = Vec::with_capacity(200);
                for _ in 0..200 {
                    let t = Instant::now();
                    client
                        .batch_execute(&format!(
                            "SELECT * FROM listings WHERE region = 'coast' AND check_in_date = '{check_in}' \
                             AND check_out_date = '{check_out}' AND adults = 2 AND use_cache = {use_cache}"
                        ))
                        .await
                        .expect("search");
                    latencies.push(t.elapsed());
                }
                latencies
            }));
        }
        let mut latencies = Vec::new();
        for h in handles {
            latencies.extend(h.await.expect("reader panicked"));
        }
        all.push((use_cache, latencies));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    for (use_cache, mut latencies) in all {
        let label = if use_cache { "search (cached)" } else { "search (uncached)" };
        print_latency(label, &mut latencies);
    }
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let listing_id = create_listing(&client, "storm", "bench").await;
            for i in 0..ops_per_conn {
                if book(&client, &listing_id, stay(i * 2, 2)).await.is_err() {
                    return;
                }
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} reservations each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("STAYBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid STAYBOOK_PORT");

    println!("=== staybook stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended double-booking");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] search latency under write load");
    phase3_search_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
