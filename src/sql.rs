use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

const ROOM_COLUMNS: &[&str] = &["id", "name", "capacity", "resources", "location", "description"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "room_id",
    "title",
    "start",
    "end",
    "participants",
    "description",
];
const ROOM_UPDATE_COLUMNS: &[&str] = &[
    "name",
    "capacity",
    "resources",
    "location",
    "description",
    "active",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        draft: RoomDraft,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
        active_only: bool,
    },
    InsertReservation {
        id: Ulid,
        draft: ReservationDraft,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    /// `DELETE FROM reservations` cancels; history is never erased.
    CancelReservation {
        id: Ulid,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectAgenda {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectFreeSlots {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailableRooms {
        start: Ms,
        end: Ms,
        min_capacity: u32,
    },
    SelectOccupancy {
        at: Option<Ms>,
    },
    SelectDashboard {
        at: Option<Ms>,
        upcoming_limit: Option<usize>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without evaluating its filters. Placeholders
/// are fine here, so this also serves statement description.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let row = Fields::from_insert(insert, "rooms", ROOM_COLUMNS)?;
            let draft = RoomDraft {
                name: parse_string(row.require("name")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
                resources: row.get("resources").map(parse_resources).transpose()?.unwrap_or_default(),
                location: row.get("location").map(parse_opt_string).transpose()?.flatten().unwrap_or_default(),
                description: row
                    .get("description")
                    .map(parse_opt_string)
                    .transpose()?
                    .flatten()
                    .unwrap_or_default(),
            };
            Ok(Command::InsertRoom {
                id: parse_ulid(row.require("id")?)?,
                draft,
            })
        }
        "reservations" => {
            let row = Fields::from_insert(insert, "reservations", RESERVATION_COLUMNS)?;
            let draft = ReservationDraft {
                room_id: parse_ulid(row.require("room_id")?)?,
                title: parse_string(row.require("title")?)?,
                description: row.get("description").map(parse_opt_string).transpose()?.flatten(),
                start: parse_time(row.require("start")?)?,
                end: parse_time(row.require("end")?)?,
                participants: row.get("participants").map(parse_u32).transpose()?.unwrap_or(1),
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(row.require("id")?)?,
                draft,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, assignment.value.clone()));
    }

    match table.as_str() {
        "rooms" => {
            let fields = Fields::checked(set, "rooms", ROOM_UPDATE_COLUMNS)?;
            let patch = RoomPatch {
                name: fields.get("name").map(parse_string).transpose()?,
                capacity: fields.get("capacity").map(parse_u32).transpose()?,
                resources: fields.get("resources").map(parse_resources).transpose()?,
                location: fields
                    .get("location")
                    .map(parse_opt_string)
                    .transpose()?
                    .map(Option::unwrap_or_default),
                description: fields
                    .get("description")
                    .map(parse_opt_string)
                    .transpose()?
                    .map(Option::unwrap_or_default),
                active: fields.get("active").map(parse_bool).transpose()?,
            };
            Ok(Command::UpdateRoom { id, patch })
        }
        "reservations" => {
            let fields = Fields::checked(set, "reservations", &RESERVATION_COLUMNS[1..])?;
            let patch = ReservationPatch {
                room_id: fields.get("room_id").map(parse_ulid).transpose()?,
                title: fields.get("title").map(parse_string).transpose()?,
                description: fields.get("description").map(parse_opt_string).transpose()?,
                start: fields.get("start").map(parse_time).transpose()?,
                end: fields.get("end").map(parse_time).transpose()?,
                participants: fields.get("participants").map(parse_u32).transpose()?,
            };
            Ok(Command::UpdateReservation { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }
    let preds = Predicates(preds);

    match table.as_str() {
        "rooms" => {
            preds.only(&table, &["id", "active"])?;
            Ok(Command::SelectRooms {
                id: preds.eq("id").map(parse_ulid).transpose()?,
                active_only: preds.eq("active").map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "reservations" => {
            preds.only(
                &table,
                &["id", "room_id", "owner", "start", "end", "include_cancelled"],
            )?;
            let filter = ReservationFilter {
                room_id: preds.eq("room_id").map(parse_ulid).transpose()?,
                owner: preds.eq("owner").map(parse_string).transpose()?,
                from: preds.ge("start").map(parse_time).transpose()?,
                until: preds.le("end").map(parse_time).transpose()?,
                include_cancelled: preds
                    .eq("include_cancelled")
                    .map(parse_bool)
                    .transpose()?
                    .unwrap_or(false),
            };
            Ok(Command::SelectReservations {
                id: preds.eq("id").map(parse_ulid).transpose()?,
                filter,
            })
        }
        "agenda" | "free_slots" => {
            preds.only(&table, &["room_id", "start", "end"])?;
            let room_id = parse_ulid(preds.eq("room_id").ok_or(SqlError::MissingFilter("room_id"))?)?;
            let start = parse_time(preds.ge("start").ok_or(SqlError::MissingFilter("start"))?)?;
            let end = parse_time(preds.le("end").ok_or(SqlError::MissingFilter("end"))?)?;
            if table == "agenda" {
                Ok(Command::SelectAgenda { room_id, start, end })
            } else {
                Ok(Command::SelectFreeSlots { room_id, start, end })
            }
        }
        "available_rooms" => {
            preds.only(&table, &["start", "end", "capacity"])?;
            Ok(Command::SelectAvailableRooms {
                start: parse_time(preds.ge("start").ok_or(SqlError::MissingFilter("start"))?)?,
                end: parse_time(preds.le("end").ok_or(SqlError::MissingFilter("end"))?)?,
                min_capacity: preds.ge("capacity").map(parse_u32).transpose()?.unwrap_or(0),
            })
        }
        "occupancy" => {
            preds.only(&table, &["at"])?;
            Ok(Command::SelectOccupancy {
                at: preds.eq("at").map(parse_time).transpose()?,
            })
        }
        "dashboard" => {
            preds.only(&table, &["at", "upcoming_limit"])?;
            Ok(Command::SelectDashboard {
                at: preds.eq("at").map(parse_time).transpose()?,
                upcoming_limit: preds
                    .eq("upcoming_limit")
                    .map(parse_u32)
                    .transpose()?
                    .map(|n| n as usize),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

struct Predicate {
    column: String,
    op: BinaryOperator,
    value: Expr,
}

struct Predicates(Vec<Predicate>);

impl Predicates {
    fn find(&self, column: &str, op: BinaryOperator) -> Option<&Expr> {
        self.0
            .iter()
            .find(|p| p.column == column && p.op == op)
            .map(|p| &p.value)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.find(column, BinaryOperator::Eq)
    }

    fn ge(&self, column: &str) -> Option<&Expr> {
        self.find(column, BinaryOperator::GtEq)
    }

    fn le(&self, column: &str) -> Option<&Expr> {
        self.find(column, BinaryOperator::LtEq)
    }

    fn only(&self, table: &str, columns: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|p| !columns.contains(&p.column.as_str())) {
            Some(p) => Err(SqlError::UnknownColumn(table.to_string(), p.column.clone())),
            None => Ok(()),
        }
    }
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            match op {
                BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq => {
                    out.push(Predicate {
                        column,
                        op: op.clone(),
                        value: right.as_ref().clone(),
                    });
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator {op} on {column}"))),
            }
        }
        _ => Err(SqlError::Unsupported(format!("predicate {expr}"))),
    }
}

// ── Column/value rows ─────────────────────────────────────────

/// Named values of one INSERT row or one UPDATE's SET list.
struct Fields(Vec<(String, Expr)>);

impl Fields {
    fn from_insert(
        insert: &ast::Insert,
        table: &str,
        positional: &[&str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            positional.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() != columns.len() && !(insert.columns.is_empty() && values.len() < columns.len())
        {
            return Err(SqlError::WrongArity(columns.len(), values.len()));
        }
        Self::checked(columns.into_iter().zip(values).collect(), table, positional)
    }

    fn checked(pairs: Vec<(String, Expr)>, table: &str, allowed: &[&str]) -> Result<Self, SqlError> {
        if let Some((column, _)) = pairs.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table.to_string(), column.clone()));
        }
        Ok(Self(pairs))
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Unix milliseconds, or an RFC 3339 string with offset.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return chrono::DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_opt_string(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::DoubleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Null) => Ok(None),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'["Projector","TV"]'` or `'Projector, TV'`.
fn parse_resources(expr: &Expr) -> Result<Vec<String>, SqlError> {
    let Some(text) = parse_opt_string(expr)? else {
        return Ok(Vec::new());
    };
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .map_err(|e| SqlError::Parse(format!("bad resources list: {e}")));
    }
    Ok(text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {1} on {0}")]
    UnknownColumn(String, String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
