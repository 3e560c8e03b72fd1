use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use spot_scheduler::clock::SystemClock;
use spot_scheduler::notify::{LogMailer, NotificationQueue};
use spot_scheduler::scheduler::{Scheduler, SchedulerSettings};
use spot_scheduler::store::InMemoryStore;
use spot_scheduler::wire::{self, SpotFactory};

const PASSWORD: &str = "spot";
/// A Monday far enough ahead that the system clock never passes it.
const DATE: &str = "2030-01-07";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("spot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = InMemoryStore::open(dir.join("spot.wal")).unwrap();

    let settings = SchedulerSettings::default();
    let (queue, _worker) = NotificationQueue::start(16, Arc::new(LogMailer), settings.calendar);
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(queue),
        settings,
    ));
    let factory = Arc::new(SpotFactory::new(scheduler, PASSWORD.to_string()));

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

async fn connect(addr: SocketAddr, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("spot")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

struct Fixture {
    business: Ulid,
    staff: Ulid,
    service: Ulid,
    client: Ulid,
}

/// Open salon: Monday 09:00-17:00, a 60 minute service, one client.
async fn seed(admin: &tokio_postgres::Client) -> Fixture {
    let fx = Fixture {
        business: Ulid::new(),
        staff: Ulid::new(),
        service: Ulid::new(),
        client: Ulid::new(),
    };
    admin
        .simple_query(&format!(
            "INSERT INTO businesses VALUES ('{}', 'Salon Uno')",
            fx.business
        ))
        .await
        .unwrap();
    admin
        .simple_query(&format!(
            "INSERT INTO services VALUES ('{}', '{}', 'Haircut', 60)",
            fx.service, fx.business
        ))
        .await
        .unwrap();
    admin
        .simple_query(&format!(
            "INSERT INTO clients VALUES ('{}', 'ana@example.com', 'Ana')",
            fx.client
        ))
        .await
        .unwrap();
    admin
        .simple_query(&format!(
            "INSERT INTO working_hours VALUES ('{}', '{}', 1, '09:00', '17:00')",
            Ulid::new(),
            fx.staff
        ))
        .await
        .unwrap();
    fx
}

fn slots_sql(fx: &Fixture) -> String {
    format!(
        "SELECT * FROM slots WHERE business_id = '{}' AND staff_id = '{}' AND service_id = '{}' AND date = '{DATE}'",
        fx.business, fx.staff, fx.service
    )
}

fn booking_sql(fx: &Fixture, start: &str) -> String {
    format!(
        "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{DATE}T{start}:00Z')",
        fx.business, fx.staff, fx.service
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_list_and_cancel_over_the_wire() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let fx = seed(&admin).await;
    let client = connect(addr, &fx.client.to_string()).await;

    let slots = rows(client.simple_query(&slots_sql(&fx)).await.unwrap());
    assert_eq!(slots.len(), 15);
    assert_eq!(slots[0].get("start_at"), Some("2030-01-07T09:00:00.000Z"));
    assert_eq!(slots[0].get("end_at"), Some("2030-01-07T10:00:00.000Z"));
    assert_eq!(slots[14].get("start_at"), Some("2030-01-07T16:00:00.000Z"));

    let booked = rows(client.simple_query(&booking_sql(&fx, "10:00")).await.unwrap());
    assert_eq!(booked.len(), 1);
    let booking_id = booked[0].get("id").unwrap().to_string();
    assert_eq!(booked[0].get("client_id"), Some(fx.client.to_string().as_str()));
    assert_eq!(booked[0].get("end_at"), Some("2030-01-07T11:00:00.000Z"));
    assert_eq!(booked[0].get("status"), Some("CONFIRMED"));

    let slots = rows(client.simple_query(&slots_sql(&fx)).await.unwrap());
    assert_eq!(slots.len(), 12);
    assert!(slots.iter().all(|r| r.get("start_at") != Some("2030-01-07T10:00:00.000Z")));

    let mine = rows(client.simple_query("SELECT * FROM my_bookings").await.unwrap());
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(booking_id.as_str()));

    let day = rows(
        admin
            .simple_query(&format!(
                "SELECT * FROM bookings WHERE business_id = '{}' AND start_at >= '{DATE}T00:00:00Z' AND end_at <= '2030-01-08T00:00:00Z'",
                fx.business
            ))
            .await
            .unwrap(),
    );
    assert_eq!(day.len(), 1);

    admin
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    let slots = rows(client.simple_query(&slots_sql(&fx)).await.unwrap());
    assert_eq!(slots.len(), 15);

    let mine = rows(client.simple_query("SELECT * FROM my_bookings").await.unwrap());
    assert_eq!(mine[0].get("status"), Some("CANCELLED"));
}

#[tokio::test]
async fn rejections_carry_distinct_sqlstates() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let fx = seed(&admin).await;
    let client = connect(addr, &fx.client.to_string()).await;

    client.simple_query(&booking_sql(&fx, "10:00")).await.unwrap();

    let err = client
        .simple_query(&booking_sql(&fx, "10:30"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = client
        .simple_query(&booking_sql(&fx, "16:30"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SP005"));

    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '2030-01-08T10:00:00Z')",
            fx.business, fx.staff, fx.service
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SP003"));

    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '2020-01-06T10:00:00Z')",
            fx.business, fx.staff, fx.service
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SP001"));

    let err = client
        .simple_query(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{DATE}T10:00:00Z')",
            fx.business,
            fx.staff,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SP002"));

    // Admin login is not a client id, so it cannot book.
    let err = admin
        .simple_query(&booking_sql(&fx, "12:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("28000"));

    let err = client.simple_query("SELECT * FROM nowhere").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42P01"));
}

#[tokio::test]
async fn break_rules_are_enforced() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let fx = seed(&admin).await;
    admin
        .simple_query(&format!(
            "INSERT INTO working_hours VALUES ('{}', '{}', 1, '12:00', '13:00', true)",
            Ulid::new(),
            fx.staff
        ))
        .await
        .unwrap();
    let client = connect(addr, &fx.client.to_string()).await;

    let err = client
        .simple_query(&booking_sql(&fx, "12:30"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("SP004"));

    let slots = rows(client.simple_query(&slots_sql(&fx)).await.unwrap());
    // 11:30, 12:00 and 12:30 starts overlap the break.
    assert_eq!(slots.len(), 12);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr, "admin").await;
    let fx = seed(&admin).await;
    let client = connect(addr, &fx.client.to_string()).await;

    let rows = client
        .query(
            "SELECT * FROM slots WHERE business_id = $1 AND staff_id = $2 AND service_id = $3 AND date = $4",
            &[
                &fx.business.to_string(),
                &fx.staff.to_string(),
                &fx.service.to_string(),
                &DATE,
            ],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 15);
    let first: &str = rows[0].get("start_at");
    assert_eq!(first, "2030-01-07T09:00:00.000Z");
}
