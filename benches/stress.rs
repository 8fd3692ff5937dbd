//! Load test against a running server. Start it with `ROOMBOOK_ADMINS=admin`
//! so the bench user may create rooms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;

struct Target {
    host: String,
    port: u16,
    user: String,
    password: String,
}

async fn connect(target: &Target, db: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(db)
        .user(user)
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

/// Hour-aligned instant a day from now, so every booking is in the future.
fn base_time() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    now - now.rem_euclid(HOUR) + 24 * HOUR
}

async fn create_room(client: &tokio_postgres::Client, name: &str, capacity: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, capacity) VALUES ('{id}', '{name}', {capacity})"
        ))
        .await
        .expect("room insert failed (is the bench user listed in ROOMBOOK_ADMINS?)");
    id
}

fn booking_sql(room: Ulid, start: i64) -> String {
    format!(
        r#"INSERT INTO reservations (id, room_id, title, start, "end", participants)
           VALUES ('{}', '{room}', 'bench', {start}, {}, 2)"#,
        Ulid::new(),
        start + HOUR
    )
}

async fn phase1_sequential(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let client = connect(target, &db, &target.user).await;
    let room = create_room(&client, "sequential", 10).await;
    let base = base_time();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(room, base + i as i64 * HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots of one room. Exactly one booking
/// per slot may win.
async fn phase2_contention(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let admin = connect(target, &db, &target.user).await;
    let room = create_room(&admin, "contended", 10).await;
    let base = base_time();

    let n_tasks = 16;
    let n_slots = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let client = connect(target, &db, &format!("user{task}")).await;
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_slots);
            for slot in 0..n_slots {
                let t = Instant::now();
                match client.batch_execute(&booking_sql(room, base + slot as i64 * HOUR)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        let conflict = e.code().map(|c| c.code()) == Some("23P01");
                        assert!(conflict, "unexpected error: {e}");
                        lost.fetch_add(1, Ordering::Relaxed)
                    }
                };
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();

    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {n_slots} slots in {:.2}s: {won} booked, {lost} conflicts",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots, "every slot must be booked exactly once");
    print_latency("write latency", &mut latencies);
}

async fn phase3_read_under_load(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let admin = connect(target, &db, &target.user).await;
    let mut rooms = Vec::new();
    for i in 0..20 {
        rooms.push(create_room(&admin, &format!("room-{i}"), 10).await);
    }
    let base = base_time();
    let rooms = Arc::new(rooms);

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let rooms = rooms.clone();
            let host = target.host.clone();
            let port = target.port;
            let password = target.password.clone();
            let db = db.clone();
            tokio::spawn(async move {
                let target = Target { host, port, user: String::new(), password };
                let client = connect(&target, &db, &format!("writer{w}")).await;
                for i in 0..500 {
                    let room = rooms[(w * 5 + i) % rooms.len()];
                    let _ = client.batch_execute(&booking_sql(room, base + i as i64 * HOUR)).await;
                }
            })
        })
        .collect();

    let reader = connect(target, &db, "reader").await;
    let mut latencies = Vec::new();
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) && !writers.iter().all(|w| w.is_finished()) {
        let slot = base + (latencies.len() as i64 % 500) * HOUR;
        let t = Instant::now();
        reader
            .simple_query(&format!(
                r#"SELECT * FROM available_rooms WHERE start >= {slot} AND "end" <= {}"#,
                slot + HOUR
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    for w in writers {
        w.await.unwrap();
    }
    print_latency("available_rooms latency", &mut latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let admin = connect(target, &db, &target.user).await;
    let room = create_room(&admin, "storm", 10).await;
    let base = base_time();

    let n_conns = 100;
    let ops_per_conn = 10;
    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..n_conns {
        let client = connect(target, &db, &format!("guest{c}")).await;
        handles.push(tokio::spawn(async move {
            for i in 0..ops_per_conn {
                let slot = base + ((c * ops_per_conn + i) as i64) * HOUR;
                if client.batch_execute(&booking_sql(room, slot)).await.is_err() {
                    return false;
                }
            }
            true
        }));
    }

    let mut ok = 0;
    for h in handles {
        if h.await.unwrap_or(false) {
            ok += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("ROOMBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("ROOMBOOK_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5433),
        user: std::env::var("ROOMBOOK_USER").unwrap_or_else(|_| "admin".into()),
        password: std::env::var("ROOMBOOK_PASSWORD").unwrap_or_else(|_| "roombook".into()),
    };

    println!("=== roombook stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    // Each phase uses its own organization (unique dbname) to avoid interference.

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] same-slot contention");
    phase2_contention(&target).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
