use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Creates a venue, or edits it when the id already exists.
    InsertVenue { draft: VenueDraft },
    DeleteVenue { id: Ulid },
    InsertUser { user: User },
    InsertBooking { request: BookingRequest },
    Decide { booking_id: Ulid, decision: Decision },
    Rescind { booking_id: Ulid },
    SelectVenues,
    SelectBookings { filter: BookingFilter },
    SelectPending,
    SelectSchedule { venue_id: Ulid, date: NaiveDate },
    SelectAvailability {
        venue_id: Ulid,
        date: NaiveDate,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        min_duration: Option<i64>,
    },
    Listen { channel: String },
    /// `None` is `UNLISTEN *`.
    Unlisten { channel: Option<String> },
}

/// Row layout a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Empty,
    Venues,
    Bookings,
    Availability,
}

impl Command {
    pub fn result_shape(&self) -> ResultShape {
        match self {
            Command::InsertBooking { .. }
            | Command::Decide { .. }
            | Command::Rescind { .. }
            | Command::SelectBookings { .. }
            | Command::SelectPending
            | Command::SelectSchedule { .. } => ResultShape::Bookings,
            Command::SelectVenues => ResultShape::Venues,
            Command::SelectAvailability { .. } => ResultShape::Availability,
            Command::InsertVenue { .. }
            | Command::DeleteVenue { .. }
            | Command::InsertUser { .. }
            | Command::Listen { .. }
            | Command::Unlisten { .. } => ResultShape::Empty,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_listen(sql)? {
        return Ok(cmd);
    }
    match first_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape from the statement kind and target table alone, so a
/// statement still holding `$N` placeholders can be described before its
/// parameters are bound.
pub fn result_shape(sql: &str) -> Result<ResultShape, SqlError> {
    if parse_listen(sql)?.is_some() {
        return Ok(ResultShape::Empty);
    }
    match first_statement(sql)? {
        Statement::Insert(insert) => match insert_table_name(&insert)?.as_str() {
            "bookings" | "decisions" => Ok(ResultShape::Bookings),
            "venues" | "users" => Ok(ResultShape::Empty),
            other => Err(SqlError::UnknownTable(other.to_string())),
        },
        Statement::Delete(_) => Ok(ResultShape::Empty),
        Statement::Query(query) => match select_table(&query)?.1.as_str() {
            "venues" => Ok(ResultShape::Venues),
            "availability" => Ok(ResultShape::Availability),
            "bookings" | "pending" | "schedule" => Ok(ResultShape::Bookings),
            other => Err(SqlError::UnknownTable(other.to_string())),
        },
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn first_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    stmts.into_iter().next().ok_or(SqlError::Empty)
}

/// `LISTEN <channel>` and `UNLISTEN <channel | *>`, matched before the SQL
/// parser sees the text.
fn parse_listen(sql: &str) -> Result<Option<Command>, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let Some((keyword, rest)) = trimmed.split_once(char::is_whitespace) else {
        return Ok(None);
    };
    let channel = rest.trim().trim_matches('"');
    if keyword.eq_ignore_ascii_case("LISTEN") {
        if channel.is_empty() {
            return Err(SqlError::Parse("LISTEN without channel".into()));
        }
        Ok(Some(Command::Listen {
            channel: channel.to_string(),
        }))
    } else if keyword.eq_ignore_ascii_case("UNLISTEN") {
        if channel.is_empty() {
            return Err(SqlError::Parse("UNLISTEN without channel".into()));
        }
        Ok(Some(Command::Unlisten {
            channel: (channel != "*").then(|| channel.to_string()),
        }))
    } else {
        Ok(None)
    }
}

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    /// `defaults` is the column order assumed when the INSERT names none.
    fn new(
        table: &'static str,
        insert: &ast::Insert,
        values: &'a [Expr],
        defaults: &[&str],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(ident_name).collect()
        };
        if values.len() != columns.len() && !(insert.columns.is_empty() && values.len() <= columns.len()) {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    /// `None` when the column is absent or NULL.
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let idx = self.columns.iter().position(|c| c == column)?;
        let expr = self.values.get(idx)?;
        match extract_value(expr) {
            Some(Value::Null) => None,
            _ => Some(expr),
        }
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_string_expr).transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "venues" => {
            let row = Row::new("venues", insert, &values, &["id", "name", "capacity", "image_url"])?;
            Ok(Command::InsertVenue {
                draft: VenueDraft {
                    id: row.get("id").map(parse_ulid_expr).transpose()?,
                    name: row.string("name")?.unwrap_or_default(),
                    capacity: parse_u32(row.require("capacity")?)?,
                    image_url: row.string("image_url")?,
                },
            })
        }
        "users" => {
            let row = Row::new("users", insert, &values, &["id", "name", "email", "role"])?;
            let role = match row.string("role")? {
                Some(r) => r.parse::<Role>().map_err(SqlError::Parse)?,
                None => Role::User,
            };
            Ok(Command::InsertUser {
                user: User {
                    id: row.string("id")?.unwrap_or_default(),
                    name: row.string("name")?.unwrap_or_default(),
                    email: row.string("email")?,
                    role,
                },
            })
        }
        "bookings" => {
            let row = Row::new(
                "bookings",
                insert,
                &values,
                &["venue_id", "event_name", "date", "start_time", "end_time", "description"],
            )?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    venue_id: row.get("venue_id").map(parse_ulid_expr).transpose()?,
                    event_name: row.string("event_name")?.unwrap_or_default(),
                    date: row.get("date").map(parse_date_expr).transpose()?,
                    start_time: row.get("start_time").map(parse_time_expr).transpose()?,
                    end_time: row.get("end_time").map(parse_time_expr).transpose()?,
                    description: row.string("description")?,
                },
            })
        }
        "decisions" => {
            let row = Row::new("decisions", insert, &values, &["booking_id", "decision"])?;
            let booking_id = parse_ulid_expr(row.require("booking_id")?)?;
            let decision = parse_string_expr(row.require("decision")?)?;
            match decision.trim().to_lowercase().as_str() {
                "approve" | "approved" => Ok(Command::Decide {
                    booking_id,
                    decision: Decision::Approve,
                }),
                "reject" | "rejected" => Ok(Command::Decide {
                    booking_id,
                    decision: Decision::Reject,
                }),
                "rescind" | "rescinded" => Ok(Command::Rescind { booking_id }),
                other => Err(SqlError::Parse(format!("unknown decision: {other}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "venues" => Ok(Command::DeleteVenue { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn select_table(query: &ast::Query) -> Result<(&ast::Select, String), SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    Ok((select, table_factor_name(&from.relation)?))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (select, table) = select_table(query)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let find = |column: &str| filters.iter().find(|f| f.column == column && f.op == FilterOp::Eq);

    match table.as_str() {
        "venues" => Ok(Command::SelectVenues),
        "pending" => Ok(Command::SelectPending),
        "bookings" => {
            let mut filter = BookingFilter::default();
            for f in &filters {
                if f.op != FilterOp::Eq {
                    return Err(SqlError::Unsupported(format!("{} filter on bookings", f.op)));
                }
                match f.column.as_str() {
                    "id" => filter.id = Some(parse_ulid_expr(f.value)?),
                    "user_id" => filter.user_id = Some(parse_string_expr(f.value)?),
                    "venue_id" => filter.venue_id = Some(parse_ulid_expr(f.value)?),
                    "date" => filter.date = Some(parse_date_expr(f.value)?),
                    "status" => {
                        let status = parse_string_expr(f.value)?;
                        filter.status = Some(status.parse().map_err(SqlError::Parse)?);
                    }
                    other => return Err(SqlError::UnknownColumn("bookings", other.to_string())),
                }
            }
            Ok(Command::SelectBookings { filter })
        }
        "schedule" => Ok(Command::SelectSchedule {
            venue_id: parse_ulid_expr(find("venue_id").ok_or(SqlError::MissingFilter("venue_id"))?.value)?,
            date: parse_date_expr(find("date").ok_or(SqlError::MissingFilter("date"))?.value)?,
        }),
        "availability" => {
            let bound = |column: &str, op: FilterOp| {
                filters
                    .iter()
                    .find(|f| f.column == column && f.op == op)
                    .map(|f| parse_time_expr(f.value))
                    .transpose()
            };
            Ok(Command::SelectAvailability {
                venue_id: parse_ulid_expr(
                    find("venue_id").ok_or(SqlError::MissingFilter("venue_id"))?.value,
                )?,
                date: parse_date_expr(find("date").ok_or(SqlError::MissingFilter("date"))?.value)?,
                start: bound("start_time", FilterOp::GtEq)?,
                end: bound("end_time", FilterOp::LtEq)?,
                min_duration: find("min_duration").map(|f| parse_i64_expr(f.value)).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FilterOp::Eq => "=",
            FilterOp::GtEq => ">=",
            FilterOp::LtEq => "<=",
        })
    }
}

struct Filter<'a> {
    column: String,
    op: FilterOp,
    value: &'a Expr,
}

/// Flatten `col op value AND ...` into a list.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn ident_name(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident_name(ident)),
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
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string_expr(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_clock(&parse_string_expr(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = parse_string_expr(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
