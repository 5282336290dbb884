use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{
    AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow,
};

use venuebook::engine::{Scheduler, PLACEHOLDER_IMAGE_URL};
use venuebook::model::TimeRange;
use venuebook::notify::NotifyHub;
use venuebook::seed;
use venuebook::store::MemoryStore;
use venuebook::wire::{self, VenueBookFactory};

// ── Test infrastructure ──────────────────────────────────────

const PASSWORD: &str = "venuebook";

async fn start_test_server() -> (SocketAddr, Arc<Scheduler>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hub = Arc::new(NotifyHub::new());
    let scheduler = Arc::new(
        Scheduler::open(Arc::new(MemoryStore::new()), hub.clone())
            .await
            .unwrap(),
    );
    seed::bootstrap_admins(&scheduler, &["admin".to_string()])
        .await
        .unwrap();

    let window = TimeRange::parse("08:00", "22:00").unwrap();
    let factory = VenueBookFactory::new(scheduler.clone(), hub, window, PASSWORD.to_string());
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

    (addr, scheduler)
}

fn config(addr: SocketAddr, user: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("venuebook")
        .user(user)
        .password(PASSWORD);
    config
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let (client, connection) = config(addr, user).connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Client whose asynchronous notifications are forwarded to the receiver.
async fn connect_listening(
    addr: SocketAddr,
    user: &str,
) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let (client, mut connection) = config(addr, user).connect(NoTls).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    (client, rx)
}

async fn recv_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn affected(client: &Client, sql: &str) -> u64 {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(n),
            _ => None,
        })
        .unwrap()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|e| e.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a server error, got {err}"))
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap_or_else(|| panic!("{name} is NULL"))
}

async fn add_venue(admin: &Client, name: &str, capacity: u32) -> String {
    assert_eq!(
        affected(
            admin,
            &format!("INSERT INTO venues (name, capacity) VALUES ('{name}', {capacity})"),
        )
        .await,
        1
    );
    let venues = rows(admin, "SELECT * FROM venues").await;
    let venue = venues.iter().find(|v| col(v, "name") == name).unwrap();
    col(venue, "id").to_string()
}

async fn submit(client: &Client, venue_id: &str, event: &str, start: &str, end: &str) -> String {
    let created = rows(
        client,
        &format!(
            r#"INSERT INTO bookings (venue_id, event_name, "date", start_time, end_time)
               VALUES ('{venue_id}', '{event}', '2024-06-01', '{start}', '{end}')"#
        ),
    )
    .await;
    assert_eq!(created.len(), 1);
    assert_eq!(col(&created[0], "status"), "pending");
    col(&created[0], "id").to_string()
}

fn decision(booking_id: &str, verdict: &str) -> String {
    format!("INSERT INTO decisions (booking_id, decision) VALUES ('{booking_id}', '{verdict}')")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn venue_catalog_roundtrip() {
    let (addr, _) = start_test_server().await;
    let admin = connect(addr, "admin").await;

    let id = add_venue(&admin, "Main Auditorium", 200).await;
    let venues = rows(&admin, "SELECT * FROM venues").await;
    assert_eq!(venues.len(), 1);
    assert_eq!(col(&venues[0], "capacity"), "200");
    assert_eq!(col(&venues[0], "image_url"), PLACEHOLDER_IMAGE_URL);

    // Same id edits in place.
    affected(
        &admin,
        &format!("INSERT INTO venues (id, name, capacity) VALUES ('{id}', 'Main Auditorium', 250)"),
    )
    .await;
    let venues = rows(&admin, "SELECT * FROM venues").await;
    assert_eq!(venues.len(), 1);
    assert_eq!(col(&venues[0], "capacity"), "250");

    assert_eq!(
        affected(&admin, &format!("DELETE FROM venues WHERE id = '{id}'")).await,
        1
    );
    assert!(rows(&admin, "SELECT * FROM venues").await.is_empty());
}

#[tokio::test]
async fn overlapping_approval_is_refused_with_slot_taken() {
    let (addr, scheduler) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let bob = connect(addr, "bob").await;

    let venue = add_venue(&admin, "Seminar Hall A", 50).await;
    affected(
        &alice,
        "INSERT INTO users (id, name, email) VALUES ('alice', 'Alice', 'alice@campus.edu')",
    )
    .await;

    let a = submit(&alice, &venue, "Robotics Demo", "09:00", "10:00").await;
    let b = submit(&bob, &venue, "Chess Club", "09:30", "10:30").await;

    let pending = rows(&admin, "SELECT * FROM pending").await;
    assert_eq!(pending.len(), 2);
    let name_of = |id: &str| {
        let row = pending.iter().find(|r| col(r, "id") == id).unwrap();
        col(row, "user_name").to_string()
    };
    assert_eq!(name_of(&a), "alice@campus.edu");
    assert_eq!(name_of(&b), "bob");

    let approved = rows(&admin, &decision(&a, "approved")).await;
    assert_eq!(col(&approved[0], "status"), "approved");
    assert_eq!(col(&approved[0], "decided_by"), "admin");

    assert_eq!(sqlstate(&admin, &decision(&b, "approved")).await, "23P01");
    let still = rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{b}'")).await;
    assert_eq!(col(&still[0], "status"), "pending");

    let rejected = rows(&admin, &decision(&b, "rejected")).await;
    assert_eq!(col(&rejected[0], "status"), "rejected");
    assert_eq!(sqlstate(&admin, &decision(&b, "approved")).await, "55000");

    let schedule = rows(
        &admin,
        &format!(r#"SELECT * FROM schedule WHERE venue_id = '{venue}' AND "date" = '2024-06-01'"#),
    )
    .await;
    assert_eq!(schedule.len(), 1);
    assert_eq!(col(&schedule[0], "start_time"), "09:00:00");
    assert_eq!(scheduler.index().day_count(), 1);
}

#[tokio::test]
async fn availability_reflects_approvals() {
    let (addr, _) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let venue = add_venue(&admin, "Computer Lab 3", 30).await;

    let id = submit(&admin, &venue, "Workshop", "09:00", "10:00").await;
    rows(&admin, &decision(&id, "approve")).await;

    let query = format!(
        r#"SELECT * FROM availability WHERE venue_id = '{venue}' AND "date" = '2024-06-01'"#
    );
    let slots = rows(&admin, &query).await;
    let spans: Vec<(&str, &str)> = slots
        .iter()
        .map(|s| (col(s, "start_time"), col(s, "end_time")))
        .collect();
    assert_eq!(spans, vec![("08:00:00", "09:00:00"), ("10:00:00", "22:00:00")]);
    assert_eq!(col(&slots[0], "duration_minutes"), "60");

    let long_only = rows(&admin, &format!("{query} AND min_duration = 90")).await;
    assert_eq!(long_only.len(), 1);

    rows(&admin, &decision(&id, "rescinded")).await;
    assert_eq!(rows(&admin, &query).await.len(), 1);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let venue = add_venue(&admin, "Conference Room", 25).await;

    // Non-admins cannot decide or edit the catalog.
    let id = submit(&alice, &venue, "Study Group", "13:00", "14:00").await;
    assert_eq!(sqlstate(&alice, &decision(&id, "approved")).await, "42501");
    assert_eq!(
        sqlstate(&alice, "INSERT INTO venues (name, capacity) VALUES ('Roof', 5)").await,
        "42501"
    );

    // Backwards range.
    assert_eq!(
        sqlstate(
            &alice,
            &format!(
                r#"INSERT INTO bookings (venue_id, event_name, "date", start_time, end_time)
                   VALUES ('{venue}', 'Late', '2024-06-01', '15:00', '14:00')"#
            ),
        )
        .await,
        "22023"
    );

    // Pending bookings block venue deletion.
    assert_eq!(
        sqlstate(&admin, &format!("DELETE FROM venues WHERE id = '{venue}'")).await,
        "23503"
    );

    assert_eq!(
        sqlstate(&admin, &decision("01ARZ3NDEKTSV4RRFFQ69G5FAV", "approved")).await,
        "P0002"
    );
    assert_eq!(sqlstate(&admin, "SELEC * FROM venues").await, "42601");
    assert_eq!(sqlstate(&admin, "SELECT * FROM rooms").await, "42601");
}

#[tokio::test]
async fn prepared_values_are_bound_verbatim() {
    let (addr, _) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let alice = connect(addr, "alice").await;
    let venue = add_venue(&admin, "Sports Complex", 300).await;

    let description = "tickets $1 each, don't forget '$2'";
    let n = alice
        .execute(
            r#"INSERT INTO bookings (venue_id, event_name, "date", start_time, end_time, description)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
            &[&venue, &"O'Brien's Bake Sale", &"2024-06-01", &"11:00", &"12:00", &description],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);

    let mine = rows(&alice, "SELECT * FROM bookings WHERE user_id = 'alice'").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(col(&mine[0], "event_name"), "O'Brien's Bake Sale");
    assert_eq!(col(&mine[0], "description"), description);

    // A value that tries to close its literal stays a value.
    alice
        .execute(
            "INSERT INTO users (id, name) VALUES ($1, $2)",
            &[&"alice", &"x'); DELETE FROM venues; --"],
        )
        .await
        .unwrap();
    assert_eq!(rows(&admin, "SELECT * FROM venues").await.len(), 1);
}

#[tokio::test]
async fn listen_delivers_venue_notifications() {
    let (addr, _) = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let (watcher, mut notes) = connect_listening(addr, "admin").await;
    let hall = add_venue(&admin, "Main Auditorium", 200).await;
    let lab = add_venue(&admin, "Computer Lab 3", 30).await;

    watcher.batch_execute(&format!("LISTEN venue_{hall}")).await.unwrap();
    let id = submit(&admin, &hall, "Orientation", "09:00", "10:00").await;
    submit(&admin, &lab, "Hackathon", "09:00", "10:00").await;
    rows(&admin, &decision(&id, "approved")).await;

    // Pending notifications ride along with the listener's next statement.
    rows(&watcher, "SELECT * FROM venues").await;
    let channel = format!("venue_{hall}");
    let mut events = Vec::new();
    for _ in 0..2 {
        let n = recv_notification(&mut notes).await.expect("expected notification");
        assert_eq!(n.channel(), channel);
        let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
        events.push(payload["event"].as_str().unwrap().to_string());
    }
    assert_eq!(events, ["booking_submitted", "booking_approved"]);

    watcher.batch_execute("UNLISTEN *").await.unwrap();
    submit(&admin, &hall, "Closing", "12:00", "13:00").await;
    rows(&watcher, "SELECT * FROM venues").await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), notes.recv())
            .await
            .is_err()
    );

    assert_eq!(sqlstate(&watcher, "LISTEN lobby").await, "42000");
}
