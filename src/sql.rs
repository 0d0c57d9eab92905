use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::RoomFilter;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom(NewRoom),
    UpdateRoom { id: Ulid, patch: RoomPatch },
    DeleteRoom { id: Ulid },
    InsertTimeSlot(NewTimeSlot),
    UpdateTimeSlot { id: Ulid, patch: TimeSlotPatch },
    DeleteTimeSlot { id: Ulid },
    InsertBooking(NewBooking),
    UpdateBooking { id: Ulid, patch: BookingPatch },
    DeleteBooking { id: Ulid },
    InsertUser(NewUser),
    UpdateUser { id: Ulid, patch: UserPatch },
    DeleteUser { id: Ulid },
    /// `UPDATE profile SET password = …`: the caller changes their own password.
    UpdateProfile { password: String },
    SelectRooms { id: Option<Ulid>, filter: RoomFilter },
    SelectTimeSlots { id: Option<Ulid> },
    SelectBookings { id: Option<Ulid>, room_id: Option<Ulid> },
    SelectProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Rooms,
    TimeSlots,
    Bookings,
    Users,
    Profile,
}

// Canonical column name, then every accepted spelling.
const ROOM_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id"]),
    ("name", &["name", "nombre"]),
    ("capacity", &["capacity", "capacidad"]),
    ("has_computers", &["has_computers", "es_ordenadores", "esordenadores"]),
];

const TIME_SLOT_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id"]),
    ("day_of_week", &["day_of_week", "day", "dia_semana", "diasemana"]),
    ("start_time", &["start_time", "hora_inicio", "horainicio"]),
    ("end_time", &["end_time", "hora_fin", "horafin"]),
];

const BOOKING_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id"]),
    ("date", &["date", "fecha"]),
    ("reason", &["reason", "motivo"]),
    ("attendees", &["attendees", "asistentes"]),
    ("room_id", &["room_id", "aula_id", "aula"]),
    ("time_slot_id", &["time_slot_id", "horario_id", "horario"]),
];

const USER_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id"]),
    ("name", &["name", "nombre"]),
    ("email", &["email"]),
    ("password", &["password"]),
    ("role", &["role", "rol", "roles"]),
    ("enabled", &["enabled"]),
];

impl Table {
    fn resolve(name: &str) -> Result<Table, SqlError> {
        match name {
            "rooms" | "aulas" => Ok(Table::Rooms),
            "time_slots" | "horarios" => Ok(Table::TimeSlots),
            "bookings" | "reservas" => Ok(Table::Bookings),
            "users" | "usuarios" => Ok(Table::Users),
            "profile" | "perfil" => Ok(Table::Profile),
            _ => Err(SqlError::UnknownTable(name.to_string())),
        }
    }

    fn columns(self) -> &'static [(&'static str, &'static [&'static str])] {
        match self {
            Table::Rooms => ROOM_COLUMNS,
            Table::TimeSlots => TIME_SLOT_COLUMNS,
            Table::Bookings => BOOKING_COLUMNS,
            Table::Users | Table::Profile => USER_COLUMNS,
        }
    }

    fn column(self, name: &str) -> Result<&'static str, SqlError> {
        self.columns()
            .iter()
            .find(|(_, spellings)| spellings.contains(&name))
            .map(|(canonical, _)| *canonical)
            .ok_or_else(|| SqlError::UnknownColumn(name.to_string()))
    }

    /// Name of the single JSON column returned for rows of this table.
    fn result_column(self) -> &'static str {
        match self {
            Table::Rooms => "room",
            Table::TimeSlots => "time_slot",
            Table::Bookings => "booking",
            Table::Users | Table::Profile => "user",
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_one(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Name of the JSON column a statement returns, for describing a prepared
/// statement before it runs. `None` for statements that return no rows.
pub fn result_column(sql: &str) -> Option<&'static str> {
    let name = match parse_one(sql).ok()? {
        Statement::Insert(insert) => insert_table_name(&insert).ok()?,
        Statement::Update { table, .. } => table_factor_name(&table.relation).ok()?,
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        _ => return None,
    };
    Table::resolve(&name).ok().map(Table::result_column)
}

fn parse_one(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

// ── Rows ──────────────────────────────────────────────────────

/// Column → literal for one INSERT row or one UPDATE's assignments.
struct Row {
    table: Table,
    values: BTreeMap<&'static str, Option<String>>,
}

impl Row {
    fn new(table: Table) -> Self {
        Self {
            table,
            values: BTreeMap::new(),
        }
    }

    fn set(&mut self, column: &str, expr: &Expr) -> Result<(), SqlError> {
        let canonical = self.table.column(&column.to_lowercase())?;
        let literal = literal(expr)?;
        if self.values.insert(canonical, literal).is_some() {
            return Err(SqlError::Parse(format!("column {canonical} given twice")));
        }
        Ok(())
    }

    /// Parsed value, `None` when absent or NULL.
    fn get<T>(&self, column: &'static str, parse: fn(&str) -> Result<T, String>) -> Result<Option<T>, SqlError> {
        match self.values.get(column) {
            Some(Some(raw)) => parse(raw)
                .map(Some)
                .map_err(|message| SqlError::BadValue { column, message }),
            _ => Ok(None),
        }
    }

    fn required<T>(&self, column: &'static str, parse: fn(&str) -> Result<T, String>) -> Result<T, SqlError> {
        self.get(column, parse)?.ok_or(SqlError::MissingColumn(column))
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.values.keys().find(|c| !allowed.contains(c)) {
            Some(c) => Err(SqlError::Unsupported(format!("column {c} cannot be set here"))),
            None => Ok(()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = Table::resolve(&insert_table_name(insert)?)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
    }
    let mut row = Row::new(table);
    for (column, expr) in insert.columns.iter().zip(values) {
        row.set(&column.value, expr)?;
    }

    match table {
        Table::Rooms => Ok(Command::InsertRoom(NewRoom {
            id: row.get("id", parse_ulid)?,
            name: row.required("name", parse_text)?,
            capacity: row.required("capacity", parse_u32)?,
            has_computers: row.get("has_computers", parse_bool)?.unwrap_or(false),
        })),
        Table::TimeSlots => Ok(Command::InsertTimeSlot(NewTimeSlot {
            id: row.get("id", parse_ulid)?,
            day: row.required("day_of_week", parse_day)?,
            start: row.required("start_time", parse_time)?,
            end: row.required("end_time", parse_time)?,
        })),
        Table::Bookings => Ok(Command::InsertBooking(NewBooking {
            id: row.get("id", parse_ulid)?,
            date: row.required("date", parse_date)?,
            reason: row.get("reason", parse_text)?,
            attendees: row.required("attendees", parse_u32)?,
            room_id: row.required("room_id", parse_ulid)?,
            time_slot_id: row.required("time_slot_id", parse_ulid)?,
        })),
        Table::Users => {
            row.only(&["id", "name", "email", "password", "role"])?;
            Ok(Command::InsertUser(NewUser {
                id: row.get("id", parse_ulid)?,
                name: row.get("name", parse_text)?,
                email: row.get("email", parse_text)?,
                password: row.get("password", parse_text)?,
                roles: row.get("role", parse_roles)?,
            }))
        }
        Table::Profile => Err(SqlError::Unsupported("INSERT into profile".into())),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = Table::resolve(&table_factor_name(relation)?)?;
    let mut row = Row::new(table);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        row.set(&column, &assignment.value)?;
    }
    if row.values.contains_key("id") {
        return Err(SqlError::Unsupported("id cannot be changed".into()));
    }

    let id = || extract_where_id(selection);
    match table {
        Table::Rooms => Ok(Command::UpdateRoom {
            id: id()?,
            patch: RoomPatch {
                name: row.get("name", parse_text)?,
                capacity: row.get("capacity", parse_u32)?,
                has_computers: row.get("has_computers", parse_bool)?,
            },
        }),
        Table::TimeSlots => Ok(Command::UpdateTimeSlot {
            id: id()?,
            patch: TimeSlotPatch {
                day: row.get("day_of_week", parse_day)?,
                start: row.get("start_time", parse_time)?,
                end: row.get("end_time", parse_time)?,
            },
        }),
        Table::Bookings => Ok(Command::UpdateBooking {
            id: id()?,
            patch: BookingPatch {
                date: row.get("date", parse_date)?,
                reason: row.get("reason", parse_text)?,
                attendees: row.get("attendees", parse_u32)?,
                room_id: row.get("room_id", parse_ulid)?,
                time_slot_id: row.get("time_slot_id", parse_ulid)?,
            },
        }),
        Table::Users => Ok(Command::UpdateUser {
            id: id()?,
            patch: UserPatch {
                name: row.get("name", parse_text)?,
                email: row.get("email", parse_text)?,
                password: row.get("password", parse_text)?,
                roles: row.get("role", parse_roles)?,
                enabled: row.get("enabled", parse_bool)?,
            },
        }),
        Table::Profile => {
            if selection.is_some() {
                return Err(SqlError::Unsupported("profile updates take no WHERE clause".into()));
            }
            row.only(&["password"])?;
            Ok(Command::UpdateProfile {
                password: row.required("password", parse_text)?,
            })
        }
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = Table::resolve(&delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table {
        Table::Rooms => Ok(Command::DeleteRoom { id }),
        Table::TimeSlots => Ok(Command::DeleteTimeSlot { id }),
        Table::Bookings => Ok(Command::DeleteBooking { id }),
        Table::Users => Ok(Command::DeleteUser { id }),
        Table::Profile => Err(SqlError::Unsupported("DELETE from profile".into())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = Table::resolve(&table_factor_name(&first.relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(table, selection, &mut filters)?;
    }
    let mut id = None;

    match table {
        Table::Rooms => {
            let mut filter = RoomFilter::default();
            for (column, op, value) in filters {
                match (column, &op) {
                    ("id", ast::BinaryOperator::Eq) => id = Some(parse_filter(column, value, parse_ulid)?),
                    ("capacity", ast::BinaryOperator::GtEq) => {
                        filter.min_capacity = Some(parse_filter(column, value, parse_u32)?)
                    }
                    ("has_computers", ast::BinaryOperator::Eq) => {
                        filter.has_computers = Some(parse_filter(column, value, parse_bool)?)
                    }
                    _ => return Err(unsupported_filter(column, &op)),
                }
            }
            Ok(Command::SelectRooms { id, filter })
        }
        Table::TimeSlots => {
            for (column, op, value) in filters {
                match (column, &op) {
                    ("id", ast::BinaryOperator::Eq) => id = Some(parse_filter(column, value, parse_ulid)?),
                    _ => return Err(unsupported_filter(column, &op)),
                }
            }
            Ok(Command::SelectTimeSlots { id })
        }
        Table::Bookings => {
            let mut room_id = None;
            for (column, op, value) in filters {
                match (column, &op) {
                    ("id", ast::BinaryOperator::Eq) => id = Some(parse_filter(column, value, parse_ulid)?),
                    ("room_id", ast::BinaryOperator::Eq) => {
                        room_id = Some(parse_filter(column, value, parse_ulid)?)
                    }
                    _ => return Err(unsupported_filter(column, &op)),
                }
            }
            Ok(Command::SelectBookings { id, room_id })
        }
        Table::Profile if filters.is_empty() => Ok(Command::SelectProfile),
        Table::Profile => Err(SqlError::Unsupported("profile takes no WHERE clause".into())),
        Table::Users => Err(SqlError::Unsupported("SELECT from users; use profile".into())),
    }
}

/// Flatten `a AND b AND …` into `(column, op, value)` triples.
fn collect_filters<'a>(
    table: Table,
    expr: &'a Expr,
    out: &mut Vec<(&'static str, ast::BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(table, left, out)?;
            collect_filters(table, right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((table.column(&column)?, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(table, inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn parse_filter<T>(column: &'static str, expr: &Expr, parse: fn(&str) -> Result<T, String>) -> Result<T, SqlError> {
    let raw = literal(expr)?.ok_or(SqlError::BadValue {
        column,
        message: "NULL is not a valid filter value".into(),
    })?;
    parse(&raw).map_err(|message| SqlError::BadValue { column, message })
}

fn unsupported_filter(column: &str, op: &ast::BinaryOperator) -> SqlError {
    SqlError::Unsupported(format!("filter {column} {op}"))
}

// ── Helpers ───────────────────────────────────────────────────

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => Err(SqlError::Parse("empty VALUES".into())),
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_filter("id", right, parse_ulid),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Text of a literal, `None` for NULL.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn parse_text(s: &str) -> Result<String, String> {
    Ok(s.to_string())
}

fn parse_ulid(s: &str) -> Result<Ulid, String> {
    Ulid::from_string(s.trim()).map_err(|e| format!("bad ULID {s:?}: {e}"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.trim().parse().map_err(|_| format!("{s} is not a non-negative integer"))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(format!("bad bool: {s}")),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("bad date {s:?}: {e}"))
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| format!("bad time {s:?}: {e}"))
}

fn parse_day(s: &str) -> Result<DayOfWeek, String> {
    DayOfWeek::from_str(s)
}

fn parse_roles(s: &str) -> Result<Roles, String> {
    Ok(Roles::parse(s))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    BadValue { column: &'static str, message: String },
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue { column, message } => write!(f, "{column}: {message}"),
        }
    }
}

impl std::error::Error for SqlError {}
