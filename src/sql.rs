use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{self, Weekday};
use crate::model::*;

/// Parsed command from SQL input. Values are positional, in the column order
/// of each virtual table.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `SELECT * FROM availability WHERE business_id = .. AND duration = ..
    /// AND "date" >= .. AND "date" <= ..`
    SelectAvailability {
        business_id: String,
        duration: u32,
        from: NaiveDate,
        to: NaiveDate,
    },
    /// `INSERT INTO bookings (business_id, client_id, services, start[, notes])`
    InsertBooking(NewBooking),
    /// `DELETE FROM bookings WHERE id = ..`
    CancelBooking { id: Ulid },
    /// `INSERT INTO transitions (booking_id, state)`
    TransitionBooking { id: Ulid, state: BookingState },
    SelectBookings { filter: BookingFilter },
    /// `INSERT INTO users (name, surname, age, phone, email, role[, business_name, business_location])`
    InsertUser(NewUser),
    /// `SELECT * FROM users`: the caller's own profile.
    SelectUser,
    DeleteUser { id: String },
    /// `INSERT INTO push_tokens (token)`
    InsertPushToken { token: String },
    /// `INSERT INTO businesses (id, name, location, schedule, services,
    /// blocked_dates, slot_interval, cancel_notice_hours[, description, terms])`
    UpsertBusiness(BusinessConfig),
    SelectBusiness { id: String },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape a statement returns, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Availability,
    Created,
    Bookings,
    User,
    Business,
}

/// Result shape from the statement kind and table alone, so statements with
/// unbound `$N` placeholders can be described.
pub fn result_set(sql: &str) -> Option<ResultSet> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => match insert_table_name(insert).ok()?.as_str() {
            "bookings" => Some(ResultSet::Created),
            _ => None,
        },
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "availability" => Some(ResultSet::Availability),
                "bookings" => Some(ResultSet::Bookings),
                "users" => Some(ResultSet::User),
                "businesses" => Some(ResultSet::Business),
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "bookings" => {
            require_arity("bookings", &values, 4)?;
            Ok(Command::InsertBooking(NewBooking {
                business_id: parse_string(&values[0])?,
                client_id: parse_string(&values[1])?,
                services: parse_services_json(&parse_string(&values[2])?)?,
                start: parse_local_datetime_expr(&values[3])?,
                notes: values.get(4).map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        "transitions" => {
            require_arity("transitions", &values, 2)?;
            let state = parse_string(&values[1])?;
            Ok(Command::TransitionBooking {
                id: parse_ulid_expr(&values[0])?,
                state: state.parse().map_err(SqlError::InvalidValue)?,
            })
        }
        "users" => {
            require_arity("users", &values, 6)?;
            let role: Role = parse_string(&values[5])?.parse().map_err(SqlError::InvalidValue)?;
            let business = match (values.get(6), values.get(7)) {
                (Some(name), Some(location)) => match (parse_string_or_null(name)?, parse_string_or_null(location)?) {
                    (Some(name), Some(location)) => Some(NewBusiness { name, location }),
                    _ => None,
                },
                _ => None,
            };
            Ok(Command::InsertUser(NewUser {
                profile: Profile {
                    name: parse_string(&values[0])?,
                    surname: parse_string(&values[1])?,
                    age: parse_u32(&values[2])?,
                    phone: parse_string_or_null(&values[3])?.unwrap_or_default(),
                    email: parse_string(&values[4])?,
                },
                role,
                business,
            }))
        }
        "push_tokens" => {
            require_arity("push_tokens", &values, 1)?;
            Ok(Command::InsertPushToken {
                token: parse_string(&values[0])?,
            })
        }
        "businesses" => {
            require_arity("businesses", &values, 8)?;
            Ok(Command::UpsertBusiness(BusinessConfig {
                id: parse_string(&values[0])?,
                name: parse_string(&values[1])?,
                location: parse_string(&values[2])?,
                schedule: parse_schedule_json(&parse_string(&values[3])?)?,
                services: parse_services_json(&parse_string(&values[4])?)?,
                blocked_dates: parse_dates_json(&parse_string(&values[5])?)?,
                slot_interval: parse_u16(&values[6])?,
                cancel_notice_hours: parse_u32(&values[7])?,
                description: values.get(8).map(parse_string_or_null).transpose()?.flatten(),
                terms: values.get(9).map(parse_string_or_null).transpose()?.flatten(),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;
    let id = find_filter(&filters, "id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: parse_ulid_expr(id)?,
        }),
        "users" => Ok(Command::DeleteUser { id: parse_string(id)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let business_id =
                find_filter(&filters, "business_id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("business_id"))?;
            let duration =
                find_filter(&filters, "duration", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("duration"))?;
            let exact = find_filter(&filters, "date", BinaryOperator::Eq);
            let from = find_filter(&filters, "date", BinaryOperator::GtEq)
                .or_else(|| find_filter(&filters, "date_from", BinaryOperator::Eq))
                .or(exact)
                .ok_or(SqlError::MissingFilter("date >="))?;
            let to = find_filter(&filters, "date", BinaryOperator::LtEq)
                .or_else(|| find_filter(&filters, "date_to", BinaryOperator::Eq))
                .or(exact)
                .ok_or(SqlError::MissingFilter("date <="))?;
            Ok(Command::SelectAvailability {
                business_id: parse_string(business_id)?,
                duration: parse_u32(duration)?,
                from: parse_date_expr(from)?,
                to: parse_date_expr(to)?,
            })
        }
        "bookings" => {
            let filter = if let Some(id) = find_filter(&filters, "id", BinaryOperator::Eq) {
                BookingFilter::Id(parse_ulid_expr(id)?)
            } else if let Some(b) = find_filter(&filters, "business_id", BinaryOperator::Eq) {
                BookingFilter::Business(parse_string(b)?)
            } else if let Some(c) = find_filter(&filters, "client_id", BinaryOperator::Eq) {
                BookingFilter::Client(parse_string(c)?)
            } else {
                return Err(SqlError::MissingFilter("id, business_id or client_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "users" => Ok(Command::SelectUser),
        "businesses" => {
            let id = find_filter(&filters, "id", BinaryOperator::Eq).ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::SelectBusiness { id: parse_string(id)? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `col OP value` comparisons of an AND chain.
type Filter<'a> = (String, BinaryOperator, &'a Expr);

fn collect_filters(selection: Option<&Expr>) -> Result<Vec<Filter<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_into(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_into<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_into(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_into(left, out)?;
            collect_into(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_filter<'a>(filters: &[Filter<'a>], col: &str, op: BinaryOperator) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, o, _)| c == col && *o == op)
        .map(|(_, _, e)| *e)
}

// ── JSON columns ──────────────────────────────────────────────

#[derive(Deserialize)]
struct SlotInput {
    #[serde(alias = "horaInicio")]
    open: String,
    #[serde(alias = "horaFin")]
    close: String,
}

#[derive(Deserialize)]
struct ServiceInput {
    #[serde(alias = "nombre")]
    name: String,
    #[serde(alias = "duracion")]
    duration: u32,
    #[serde(alias = "precio")]
    price: serde_json::Value,
}

/// `{"monday": {"open": "10:00", "close": "14:00"}, ...}`. Weekday keys may be
/// English or Spanish; days left out are closed.
pub fn parse_schedule_json(json: &str) -> Result<WeeklySchedule, SqlError> {
    let days: HashMap<String, SlotInput> = serde_json::from_str(json).map_err(|e| SqlError::Json(e.to_string()))?;
    let mut schedule = WeeklySchedule::default();
    for (key, slot) in days {
        let day = Weekday::from_token(&key).ok_or_else(|| SqlError::InvalidValue(format!("unknown weekday {key:?}")))?;
        let open = calendar::parse_time_of_day(&slot.open).map_err(|e| SqlError::InvalidValue(e.to_string()))?;
        let close = calendar::parse_time_of_day(&slot.close).map_err(|e| SqlError::InvalidValue(e.to_string()))?;
        schedule.set(day, DaySlot::new(open, close));
    }
    Ok(schedule)
}

/// `[{"name": "Corte", "duration": 30, "price": 15.5}, ...]`. Prices may be
/// JSON numbers or decimal strings.
pub fn parse_services_json(json: &str) -> Result<Vec<Service>, SqlError> {
    let inputs: Vec<ServiceInput> = serde_json::from_str(json).map_err(|e| SqlError::Json(e.to_string()))?;
    inputs
        .into_iter()
        .map(|s| {
            let raw = match &s.price {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(text) => text.trim().to_string(),
                other => return Err(SqlError::InvalidValue(format!("price of {:?} is not a number: {other}", s.name))),
            };
            let price: Decimal = raw
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("price of {:?}: {e}", s.name)))?;
            Ok(Service {
                name: s.name,
                duration: s.duration,
                price: price.normalize(),
            })
        })
        .collect()
}

pub fn parse_dates_json(json: &str) -> Result<Vec<NaiveDate>, SqlError> {
    let raw: Vec<String> = serde_json::from_str(json).map_err(|e| SqlError::Json(e.to_string()))?;
    raw.iter()
        .map(|s| calendar::parse_date(s).map_err(|e| SqlError::InvalidValue(e.to_string())))
        .collect()
}

// ── Helpers ───────────────────────────────────────────────────

fn require_arity(table: &'static str, values: &[Expr], expected: usize) -> Result<(), SqlError> {
    if values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, values.len()));
    }
    Ok(())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
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
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    calendar::parse_date(&parse_string(expr)?).map_err(|e| SqlError::InvalidValue(e.to_string()))
}

fn parse_local_datetime_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    calendar::parse_local_datetime(&parse_string(expr)?).map_err(|e| SqlError::InvalidValue(e.to_string()))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.trim().parse().map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64_expr(expr)?;
    u16::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    /// Well-formed SQL carrying a bad value, as opposed to a syntax problem.
    pub fn is_invalid_value(&self) -> bool {
        matches!(self, SqlError::Json(_) | SqlError::InvalidValue(_))
    }
}
