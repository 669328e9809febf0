use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use agenda::engine::Engine;
use agenda::wire;

const PASSWORD: &str = "agenda";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("agenda_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("agenda.wal"), chrono_tz::Europe::Madrid).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

/// Log in as `user`; the login name is the caller identity.
async fn connect(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("agenda")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
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

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a database error, got {err}"))
}

const SERVICES: &str = r#"[{"nombre": "Corte", "duracion": 30, "precio": 15}, {"nombre": "Tinte", "duracion": 60, "precio": "40.50"}]"#;
const CORTE: &str = r#"[{"nombre": "Corte", "duracion": 30, "precio": 15}]"#;

/// Salon open 09:00-20:00 on weekdays, plus clients ana and luis.
async fn seed(addr: SocketAddr) -> (Client, Client, Client) {
    let salon = connect(addr, "salon").await;
    salon
        .simple_query(
            "INSERT INTO users (name, surname, age, phone, email, role, business_name, business_location) \
             VALUES ('Eva', 'Ruiz', 41, '600111222', 'eva@example.com', 'profesional', 'Salón Luna', 'Madrid')",
        )
        .await
        .unwrap();
    let schedule = r#"{"monday": {"open": "09:00", "close": "20:00"}, "tuesday": {"open": "09:00", "close": "20:00"}, "miercoles": {"horaInicio": "09:00", "horaFin": "20:00"}}"#;
    salon
        .simple_query(&format!(
            "INSERT INTO businesses (id, name, location, schedule, services, blocked_dates, slot_interval, cancel_notice_hours) \
             VALUES ('salon', 'Salón Luna', 'Madrid', '{schedule}', '{SERVICES}', '[\"2030-06-04\"]', 30, 24)"
        ))
        .await
        .unwrap();

    let mut clients = Vec::new();
    for name in ["ana", "luis"] {
        let client = connect(addr, name).await;
        client
            .simple_query(&format!(
                "INSERT INTO users (name, surname, age, phone, email, role) \
                 VALUES ('{name}', 'García', 30, NULL, '{name}@example.com', 'cliente')"
            ))
            .await
            .unwrap();
        clients.push(client);
    }
    let luis = clients.pop().unwrap();
    let ana = clients.pop().unwrap();
    (salon, ana, luis)
}

fn insert_booking(client: &str, start: &str) -> String {
    format!(
        "INSERT INTO bookings (business_id, client_id, services, start) VALUES ('salon', '{client}', '{CORTE}', '{start}')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let addr = start_test_server().await;
    let (salon, ana, luis) = seed(addr).await;

    let avail = rows(
        &ana,
        r#"SELECT * FROM availability WHERE business_id = 'salon' AND duration = 30 AND "date" >= '2030-06-03' AND "date" <= '2030-06-05'"#,
    )
    .await;
    // Monday and Wednesday; Tuesday is blocked.
    assert_eq!(avail.len(), 2 * 22);
    assert_eq!(avail[0].get("date"), Some("2030-06-03"));
    assert_eq!(avail[0].get("start"), Some("09:00"));
    assert_eq!(avail.last().unwrap().get("date"), Some("2030-06-05"));
    assert_eq!(avail.last().unwrap().get("start"), Some("19:30"));

    let created = rows(&ana, &insert_booking("ana", "2030-06-03 10:00")).await;
    assert_eq!(created.len(), 1);
    let id = created[0].get("id").unwrap().to_string();
    assert_eq!(created[0].get("seq"), Some("1"));

    assert_eq!(sqlstate(&luis, &insert_booking("luis", "2030-06-03 10:15")).await, "23P01");

    let mine = rows(&ana, "SELECT * FROM bookings WHERE client_id = 'ana'").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(id.as_str()));
    assert_eq!(mine[0].get("start"), Some("2030-06-03 10:00"));
    assert_eq!(mine[0].get("state"), Some("confirmada"));
    assert_eq!(mine[0].get("total_cost"), Some("15"));

    let avail = rows(
        &luis,
        r#"SELECT * FROM availability WHERE business_id = 'salon' AND duration = 30 AND "date" = '2030-06-03'"#,
    )
    .await;
    assert!(avail.iter().all(|r| r.get("start") != Some("10:00")));

    salon
        .simple_query(&format!("INSERT INTO transitions (booking_id, state) VALUES ('{id}', 'completada')"))
        .await
        .unwrap();
    let again = format!("INSERT INTO transitions (booking_id, state) VALUES ('{id}', 'completada')");
    assert_eq!(sqlstate(&salon, &again).await, "23P01");
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let addr = start_test_server().await;
    let (salon, ana, luis) = seed(addr).await;

    assert_eq!(sqlstate(&ana, "SELECT * FROM bookings WHERE business_id = 'salon'").await, "42501");
    assert_eq!(sqlstate(&ana, "SELECT * FROM businesses WHERE id = 'nowhere'").await, "P0002");
    assert_eq!(sqlstate(&ana, &insert_booking("ana", "2030-06-04 10:00")).await, "55000");
    assert_eq!(sqlstate(&ana, &insert_booking("ana", "someday")).await, "22023");
    assert_eq!(sqlstate(&ana, "SELEC nonsense").await, "42601");
    assert_eq!(sqlstate(&luis, "DELETE FROM users WHERE id = 'ana'").await, "42501");

    // Inside the 24h notice window only the business may cancel.
    let soon = chrono::Utc::now().with_timezone(&chrono_tz::Europe::Madrid) + chrono::Duration::hours(2);
    let start = soon.format("%Y-%m-%d %H:%M").to_string();
    let created = rows(&salon, &insert_booking("ana", &start)).await;
    let id = created[0].get("id").unwrap().to_string();
    let cancel = format!("DELETE FROM bookings WHERE id = '{id}'");
    assert_eq!(sqlstate(&ana, &cancel).await, "55000");
    salon.simple_query(&cancel).await.unwrap();
}

#[tokio::test]
async fn profile_and_business_reads() {
    let addr = start_test_server().await;
    let (salon, ana, _luis) = seed(addr).await;

    ana.simple_query("INSERT INTO push_tokens (token) VALUES ('fcm-ana')")
        .await
        .unwrap();
    let me = rows(&ana, "SELECT * FROM users").await;
    assert_eq!(me.len(), 1);
    assert_eq!(me[0].get("id"), Some("ana"));
    assert_eq!(me[0].get("role"), Some("cliente"));
    assert_eq!(me[0].get("push_tokens"), Some("1"));

    let business = rows(&ana, "SELECT * FROM businesses WHERE id = 'salon'").await;
    assert_eq!(business[0].get("name"), Some("Salón Luna"));
    assert_eq!(business[0].get("slot_interval"), Some("30"));
    assert_eq!(business[0].get("blocked_dates"), Some(r#"["2030-06-04"]"#));
    let schedule: serde_json::Value = serde_json::from_str(business[0].get("schedule").unwrap()).unwrap();
    assert_eq!(schedule["wednesday"]["open"], "09:00");
    assert!(schedule.get("sunday").is_none());

    salon.simple_query("DELETE FROM users WHERE id = 'salon'").await.unwrap();
    assert_eq!(sqlstate(&ana, "SELECT * FROM businesses WHERE id = 'salon'").await, "P0002");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let (_salon, ana, _luis) = seed(addr).await;

    ana.simple_query(&insert_booking("ana", "2030-06-03T11:00"))
        .await
        .unwrap();
    let rows = ana
        .query("SELECT * FROM bookings WHERE client_id = $1", &[&"ana"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let state: String = rows[0].get("state");
    assert_eq!(state, "confirmada");
    let business: String = rows[0].get("business_id");
    assert_eq!(business, "salon");
}
