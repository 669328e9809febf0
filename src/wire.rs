use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{AgendaAuthSource, Caller};
use crate::calendar::{self, Weekday};
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultSet, SqlError};

pub struct AgendaHandler {
    engine: Arc<Engine>,
    query_parser: Arc<AgendaQueryParser>,
}

impl AgendaHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(AgendaQueryParser),
        }
    }

    fn caller<C: ClientInfo>(client: &C) -> Caller {
        Caller::new(client.metadata().get("user").cloned().unwrap_or_default())
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let caller = Self::caller(client);
        let started = Instant::now();

        let result = self.execute_command(&caller, cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        if let Err(e) = &result {
            debug!(command = label, caller = %caller.uid, error = %e, "statement failed");
        }
        result.map_err(engine_err)
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::SelectAvailability {
                business_id,
                duration,
                from,
                to,
            } => {
                let avail = engine.availability(&business_id, duration, from, to)?;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = avail
                    .iter()
                    .flat_map(|(date, starts)| starts.iter().map(move |start| (date.to_string(), start)))
                    .map(|(date, start)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date)?;
                        encoder.encode_field(start)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking(req) => {
                let created = engine.create_booking(caller, req).await?;
                let schema = Arc::new(created_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                let row = encode_created(&mut encoder, &created).map(|_| encoder.take_row());
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(caller, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::TransitionBooking { id, state } => {
                engine.transition_booking(caller, id, state).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(caller, &filter)?;
                let tz = engine.tz();
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let start = calendar::local_datetime(tz, b.start)
                            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default();
                        let services = serde_json::to_string(&b.services).unwrap_or_default();
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&(b.seq as i64))?;
                        encoder.encode_field(&b.business_id)?;
                        encoder.encode_field(&b.client_id)?;
                        encoder.encode_field(&services)?;
                        encoder.encode_field(&start)?;
                        encoder.encode_field(&(b.total_duration as i64))?;
                        encoder.encode_field(&b.total_cost.to_string())?;
                        encoder.encode_field(&b.state.as_str().to_string())?;
                        encoder.encode_field(&b.notes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertUser(new) => {
                engine.register_user(caller, new).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectUser => {
                let user = engine.get_user(caller)?;
                let schema = Arc::new(user_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                let row = encode_user(&mut encoder, &user).map(|_| encoder.take_row());
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
            Command::DeleteUser { id } => {
                engine.delete_account(caller, &id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertPushToken { token } => {
                engine.add_push_token(caller, &token).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpsertBusiness(config) => {
                engine.update_business(caller, config).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectBusiness { id } => {
                let business = engine.get_business(&id)?;
                let schema = Arc::new(business_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                let row = encode_business(&mut encoder, &business).map(|_| encoder.take_row());
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(vec![row]))))
            }
        }
    }
}

fn encode_created(encoder: &mut DataRowEncoder, created: &CreatedBooking) -> PgWireResult<()> {
    encoder.encode_field(&created.id.to_string())?;
    encoder.encode_field(&(created.seq as i64))
}

fn encode_user(encoder: &mut DataRowEncoder, user: &User) -> PgWireResult<()> {
    encoder.encode_field(&user.id)?;
    encoder.encode_field(&user.profile.name)?;
    encoder.encode_field(&user.profile.surname)?;
    encoder.encode_field(&(user.profile.age as i64))?;
    encoder.encode_field(&user.profile.phone)?;
    encoder.encode_field(&user.profile.email)?;
    encoder.encode_field(&user.role.as_str().to_string())?;
    encoder.encode_field(&(user.push_tokens.len() as i64))
}

fn encode_business(encoder: &mut DataRowEncoder, business: &Business) -> PgWireResult<()> {
    let services = serde_json::to_string(&business.services).unwrap_or_default();
    let blocked: Vec<String> = business.blocked_dates.iter().map(|d| d.to_string()).collect();
    let blocked = serde_json::to_string(&blocked).unwrap_or_default();
    encoder.encode_field(&business.id)?;
    encoder.encode_field(&business.name)?;
    encoder.encode_field(&business.location)?;
    encoder.encode_field(&business.description)?;
    encoder.encode_field(&business.terms)?;
    encoder.encode_field(&schedule_json(&business.schedule))?;
    encoder.encode_field(&services)?;
    encoder.encode_field(&blocked)?;
    encoder.encode_field(&(business.granularity() as i64))?;
    encoder.encode_field(&(business.cancel_notice_hours as i64))
}

/// Open days only, keyed by English weekday name.
fn schedule_json(schedule: &WeeklySchedule) -> String {
    let days: serde_json::Map<String, serde_json::Value> = Weekday::ALL
        .iter()
        .filter(|day| !schedule.slot(**day).is_closed())
        .map(|day| {
            let slot = schedule.slot(*day);
            (
                day.as_str().to_string(),
                serde_json::json!({
                    "open": calendar::format_time_of_day(slot.open),
                    "close": calendar::format_time_of_day(slot.close),
                }),
            )
        })
        .collect();
    serde_json::Value::Object(days).to_string()
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("date", Type::VARCHAR), text_field("start", Type::VARCHAR)]
}

fn created_schema() -> Vec<FieldInfo> {
    vec![text_field("id", Type::VARCHAR), text_field("seq", Type::INT8)]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("seq", Type::INT8),
        text_field("business_id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("services", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("duration", Type::INT8),
        text_field("total_cost", Type::VARCHAR),
        text_field("state", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
    ]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("surname", Type::VARCHAR),
        text_field("age", Type::INT8),
        text_field("phone", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("role", Type::VARCHAR),
        text_field("push_tokens", Type::INT8),
    ]
}

fn business_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("location", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("terms", Type::VARCHAR),
        text_field("schedule", Type::VARCHAR),
        text_field("services", Type::VARCHAR),
        text_field("blocked_dates", Type::VARCHAR),
        text_field("slot_interval", Type::INT8),
        text_field("cancel_notice_hours", Type::INT8),
    ]
}

/// Result columns of a statement, for Describe.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::result_set(sql) {
        Some(ResultSet::Availability) => availability_schema(),
        Some(ResultSet::Created) => created_schema(),
        Some(ResultSet::Bookings) => bookings_schema(),
        Some(ResultSet::User) => user_schema(),
        Some(ResultSet::Business) => business_schema(),
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Replace `$N` placeholders with quoted text values in one left-to-right
/// pass; substituted text is never rescanned.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<AgendaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(AgendaHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                AgendaAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, AgendaFactory::new(engine, password)).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine error kind.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Unauthorized => "42501",
        ErrorKind::NotFound => "P0002",
        ErrorKind::InvalidInput => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::Serialization => "40001",
        ErrorKind::PreconditionFailed => "55000",
        ErrorKind::Upstream => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(e.kind()).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_invalid_value() { "22023" } else { "42601" };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}
