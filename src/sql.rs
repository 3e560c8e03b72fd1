use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::{parse_date, parse_instant, parse_time};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBusiness {
        id: Ulid,
        name: String,
    },
    InsertService {
        id: Ulid,
        business_id: Ulid,
        name: String,
        duration_min: u32,
    },
    InsertClient {
        id: Ulid,
        email: String,
        first_name: String,
    },
    InsertWorkingHours {
        id: Ulid,
        staff_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        is_break: bool,
    },
    DeleteWorkingHours {
        id: Ulid,
    },
    InsertBooking {
        business_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        start_at: Ms,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectSlots {
        business_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectMyBookings,
    SelectBookings {
        business_id: Ulid,
        from: Ms,
        to: Ms,
    },
}

impl Command {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Command::InsertBusiness { .. } => "insert_business",
            Command::InsertService { .. } => "insert_service",
            Command::InsertClient { .. } => "insert_client",
            Command::InsertWorkingHours { .. } => "insert_working_hours",
            Command::DeleteWorkingHours { .. } => "delete_working_hours",
            Command::InsertBooking { .. } => "insert_booking",
            Command::DeleteBooking { .. } => "delete_booking",
            Command::SelectSlots { .. } => "select_slots",
            Command::SelectMyBookings => "select_my_bookings",
            Command::SelectBookings { .. } => "select_bookings",
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |name: &'static str, expected: usize| {
        if values.len() < expected {
            Err(SqlError::WrongArity(name, expected, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "businesses" => {
            arity("businesses", 2)?;
            Ok(Command::InsertBusiness {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "services" => {
            arity("services", 4)?;
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                duration_min: parse_u32(&values[3])?,
            })
        }
        "clients" => {
            arity("clients", 3)?;
            Ok(Command::InsertClient {
                id: parse_ulid(&values[0])?,
                email: parse_string(&values[1])?,
                first_name: parse_string(&values[2])?,
            })
        }
        "working_hours" => {
            arity("working_hours", 5)?;
            let is_break = match values.get(5) {
                Some(expr) => parse_bool(expr)?,
                None => false,
            };
            Ok(Command::InsertWorkingHours {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                day_of_week: parse_u8(&values[2])?,
                start_time: parse_time_expr(&values[3])?,
                end_time: parse_time_expr(&values[4])?,
                is_break,
            })
        }
        "bookings" => {
            if extract_row_count(insert)? > 1 {
                return Err(SqlError::Unsupported("multi-row booking insert".into()));
            }
            arity("bookings", 4)?;
            Ok(Command::InsertBooking {
                business_id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                start_at: parse_instant_expr(&values[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "working_hours" => Ok(Command::DeleteWorkingHours { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column filters collected from a WHERE clause of `col = v` / `col >= v` / `col <= v` terms.
#[derive(Default)]
struct Filters {
    business_id: Option<Ulid>,
    staff_id: Option<Ulid>,
    service_id: Option<Ulid>,
    date: Option<NaiveDate>,
    start_at_from: Option<Ms>,
    end_at_to: Option<Ms>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            business_id: filters
                .business_id
                .ok_or(SqlError::MissingFilter("business_id"))?,
            staff_id: filters.staff_id.ok_or(SqlError::MissingFilter("staff_id"))?,
            service_id: filters
                .service_id
                .ok_or(SqlError::MissingFilter("service_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
        }),
        "my_bookings" => Ok(Command::SelectMyBookings),
        "bookings" => Ok(Command::SelectBookings {
            business_id: filters
                .business_id
                .ok_or(SqlError::MissingFilter("business_id"))?,
            from: filters
                .start_at_from
                .ok_or(SqlError::MissingFilter("start_at"))?,
            to: filters.end_at_to.ok_or(SqlError::MissingFilter("end_at"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Ok(());
    };
    let col = expr_column_name(left);
    match (op, col.as_deref()) {
        (ast::BinaryOperator::And, _) => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)?;
        }
        (ast::BinaryOperator::Eq, Some("business_id")) => {
            filters.business_id = Some(parse_ulid(right)?)
        }
        (ast::BinaryOperator::Eq, Some("staff_id")) => filters.staff_id = Some(parse_ulid(right)?),
        (ast::BinaryOperator::Eq, Some("service_id")) => {
            filters.service_id = Some(parse_ulid(right)?)
        }
        (ast::BinaryOperator::Eq, Some("date")) => {
            let s = parse_string(right)?;
            filters.date = Some(parse_date(&s).map_err(|e| SqlError::Parse(e.to_string()))?);
        }
        (ast::BinaryOperator::GtEq, Some("start_at")) => {
            filters.start_at_from = Some(parse_instant_expr(right)?)
        }
        (ast::BinaryOperator::LtEq, Some("end_at")) => {
            filters.end_at_to = Some(parse_instant_expr(right)?)
        }
        _ => {}
    }
    Ok(())
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    Ok(insert_rows(insert)?[0].clone())
}

fn extract_row_count(insert: &ast::Insert) -> Result<usize, SqlError> {
    Ok(insert_rows(insert)?.len())
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

/// Unix milliseconds, or an RFC 3339 string.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            parse_instant(s).map_err(|e| SqlError::Parse(e.to_string()))
        }
        _ => parse_i64(expr),
    }
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    parse_time(&s).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_business() {
        let sql = format!("INSERT INTO businesses (id, name) VALUES ('{A}', 'Salon Lumière')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBusiness {
                id: ulid(A),
                name: "Salon Lumière".into()
            }
        );
    }

    #[test]
    fn parse_insert_service() {
        let sql = format!(
            "INSERT INTO services (id, business_id, name, duration_minutes) VALUES ('{A}', '{B}', 'Haircut', 30)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertService {
                business_id,
                duration_min,
                ..
            } => {
                assert_eq!(business_id, ulid(B));
                assert_eq!(duration_min, 30);
            }
            cmd => panic!("expected InsertService, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_client() {
        let sql = format!(
            "INSERT INTO clients (id, email, first_name) VALUES ('{A}', 'ana@example.com', 'Ana')"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertClient { ref email, .. } if email == "ana@example.com"
        ));
    }

    #[test]
    fn parse_insert_working_hours_defaults_to_non_break() {
        let sql = format!(
            "INSERT INTO working_hours (id, staff_id, day_of_week, start_time, end_time) VALUES ('{A}', '{B}', 1, '09:00', '17:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkingHours {
                day_of_week,
                start_time,
                end_time,
                is_break,
                ..
            } => {
                assert_eq!(day_of_week, 1);
                assert_eq!(start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
                assert_eq!(end_time, NaiveTime::from_hms_opt(17, 0, 0).unwrap());
                assert!(!is_break);
            }
            cmd => panic!("expected InsertWorkingHours, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_break() {
        let sql = format!(
            "INSERT INTO working_hours (id, staff_id, day_of_week, start_time, end_time, is_break) VALUES ('{A}', '{B}', 1, '12:00', '13:00', true)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertWorkingHours { is_break: true, .. }
        ));
    }

    #[test]
    fn parse_insert_booking_with_iso_instant() {
        let sql = format!(
            "INSERT INTO bookings (business_id, staff_id, service_id, start_at) VALUES ('{A}', '{B}', '{C}', '2026-03-02T09:00:00Z')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                business_id: ulid(A),
                staff_id: ulid(B),
                service_id: ulid(C),
                start_at: 1_772_442_000_000,
            }
        );
    }

    #[test]
    fn parse_insert_booking_with_millis() {
        let sql = format!(
            "INSERT INTO bookings (business_id, staff_id, service_id, start_at) VALUES ('{A}', '{B}', '{C}', 1772442000000)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                start_at: 1_772_442_000_000,
                ..
            }
        ));
    }

    #[test]
    fn multi_row_booking_insert_rejected() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{A}', '{B}', '{C}', 1772442000000), ('{A}', '{B}', '{C}', 1772443800000)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn booking_insert_arity_checked() {
        let sql = format!("INSERT INTO bookings VALUES ('{A}', '{B}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("bookings", 4, 2))
        ));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!(
            "SELECT * FROM slots WHERE business_id = '{A}' AND staff_id = '{B}' AND service_id = '{C}' AND date = '2026-03-02'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots {
                business_id: ulid(A),
                staff_id: ulid(B),
                service_id: ulid(C),
                date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            }
        );
    }

    #[test]
    fn select_slots_requires_date() {
        let sql = format!(
            "SELECT * FROM slots WHERE business_id = '{A}' AND staff_id = '{B}' AND service_id = '{C}'"
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_my_bookings() {
        assert_eq!(
            parse_sql("SELECT * FROM my_bookings").unwrap(),
            Command::SelectMyBookings
        );
    }

    #[test]
    fn parse_select_business_range() {
        let sql = format!(
            "SELECT * FROM bookings WHERE business_id = '{A}' AND start_at >= '2026-03-02T00:00:00Z' AND end_at <= '2026-03-03T00:00:00Z'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                business_id: ulid(A),
                from: 1_772_409_600_000,
                to: 1_772_496_000_000,
            }
        );
    }

    #[test]
    fn parse_deletes() {
        let sql = format!("DELETE FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
        let sql = format!("DELETE FROM working_hours WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteWorkingHours { id: ulid(A) }
        );
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_time_errors() {
        let sql = format!(
            "INSERT INTO working_hours VALUES ('{A}', '{B}', 1, '9am', '17:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
