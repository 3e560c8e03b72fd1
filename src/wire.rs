use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SpotAuthSource;
use crate::calendar::format_instant;
use crate::model::*;
use crate::scheduler::{Scheduler, SchedulingError};
use crate::sql::{self, Command, SqlError};
use crate::store::{InMemoryStore, Store, StoreError};

pub type SpotScheduler = Scheduler<InMemoryStore>;

pub struct SpotHandler {
    scheduler: Arc<SpotScheduler>,
    query_parser: Arc<SpotQueryParser>,
}

impl SpotHandler {
    pub fn new(scheduler: Arc<SpotScheduler>) -> Self {
        Self {
            scheduler,
            query_parser: Arc::new(SpotQueryParser),
        }
    }

    async fn execute(&self, login: Option<&str>, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = cmd.label();
        let started = std::time::Instant::now();
        let result = self.execute_command(login, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        login: Option<&str>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let store = self.scheduler.store();
        match cmd {
            Command::InsertBusiness { id, name } => {
                store
                    .register_business(Business { id, name })
                    .await
                    .map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertService {
                id,
                business_id,
                name,
                duration_min,
            } => {
                store
                    .define_service(ServiceDefinition {
                        id,
                        business_id,
                        name,
                        duration_min,
                    })
                    .await
                    .map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertClient {
                id,
                email,
                first_name,
            } => {
                store
                    .register_client(Client {
                        id,
                        email,
                        first_name,
                    })
                    .await
                    .map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertWorkingHours {
                id,
                staff_id,
                day_of_week,
                start_time,
                end_time,
                is_break,
            } => {
                store
                    .set_working_hours(WorkingHoursRule {
                        id,
                        staff_id,
                        day_of_week,
                        start_time,
                        end_time,
                        is_break,
                    })
                    .await
                    .map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteWorkingHours { id } => {
                store.remove_working_hours(id).await.map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                store.cancel_booking(id).await.map_err(store_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                business_id,
                staff_id,
                service_id,
                start_at,
            } => {
                let client_id = client_id(login)?;
                let request = BookingRequest {
                    business_id,
                    staff_id,
                    service_id,
                    start_at,
                };
                let booking = self
                    .scheduler
                    .admit(request, client_id)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(vec![booking])])
            }
            Command::SelectSlots {
                business_id,
                staff_id,
                service_id,
                date,
            } => {
                let slots = self
                    .scheduler
                    .available_slots(business_id, staff_id, service_id, date)
                    .await
                    .map_err(scheduling_err)?;
                let duration = store
                    .service(service_id)
                    .await
                    .map_err(store_err)?
                    .map_or(0, |svc| svc.duration_ms());

                let schema = Arc::new(slots_schema());
                let staff = staff_id.to_string();
                let service = service_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|start| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&staff)?;
                        encoder.encode_field(&service)?;
                        encoder.encode_field(&format_instant(start))?;
                        encoder.encode_field(&format_instant(start + duration))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectMyBookings => {
                let client_id = client_id(login)?;
                let bookings = self
                    .scheduler
                    .client_bookings(client_id)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(bookings)])
            }
            Command::SelectBookings {
                business_id,
                from,
                to,
            } => {
                let bookings = self
                    .scheduler
                    .business_bookings(business_id, from, to)
                    .await
                    .map_err(scheduling_err)?;
                Ok(vec![booking_rows(bookings)])
            }
        }
    }
}

fn login_user<C: ClientInfo>(client: &C) -> Option<String> {
    client.metadata().get("user").cloned()
}

/// The authenticated login user, read as a client id.
fn client_id(login: Option<&str>) -> PgWireResult<Ulid> {
    let user = login.ok_or_else(|| user_error("28000", "no login user".into()))?;
    Ulid::from_string(user).map_err(|_| {
        user_error(
            "28000",
            format!("login user {user:?} is not a client id"),
        )
    })
}

fn slots_schema() -> Vec<FieldInfo> {
    ["staff_id", "service_id", "start_at", "end_at"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn booking_schema() -> Vec<FieldInfo> {
    [
        "id",
        "business_id",
        "staff_id",
        "service_id",
        "client_id",
        "start_at",
        "end_at",
        "status",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.business_id.to_string())?;
            encoder.encode_field(&b.staff_id.to_string())?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.client_id.to_string())?;
            encoder.encode_field(&format_instant(b.span.start))?;
            encoder.encode_field(&format_instant(b.span.end))?;
            encoder.encode_field(&b.status.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row description for a statement, decided from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        vec![]
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SpotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let login = login_user(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute(login.as_deref(), cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotQueryParser;

#[async_trait]
impl QueryParser for SpotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpotHandler {
    type Statement = String;
    type QueryParser = SpotQueryParser;

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
        let login = login_user(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute(login.as_deref(), cmd).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so text inside a bound value is never rescanned.
fn substitute(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
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

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotFactory {
    handler: Arc<SpotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SpotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SpotFactory {
    pub fn new(scheduler: Arc<SpotScheduler>, password: String) -> Self {
        let auth_source = SpotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotHandler::new(scheduler)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotFactory {
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
    factory: Arc<SpotFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each scheduling outcome. Validation kinds use the `SP` class.
pub fn scheduling_sqlstate(e: &SchedulingError) -> &'static str {
    match e {
        SchedulingError::PastBooking => "SP001",
        SchedulingError::UnknownService(_) => "SP002",
        SchedulingError::StaffNotWorking => "SP003",
        SchedulingError::StaffOnBreak => "SP004",
        SchedulingError::OutsideWorkingHours => "SP005",
        SchedulingError::SlotCollision => "23P01",
        SchedulingError::InvalidRequest(_) => "22023",
        SchedulingError::Store(e) => store_sqlstate(e),
    }
}

pub fn store_sqlstate(e: &StoreError) -> &'static str {
    match e {
        StoreError::Conflict(_) => "23P01",
        StoreError::NotFound(_) => "P0002",
        StoreError::AlreadyExists(_) => "23505",
        StoreError::Invalid(_) => "22023",
        StoreError::LimitExceeded(_) => "54000",
        StoreError::Wal(_) | StoreError::Aborted(_) => "58000",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) | SqlError::MissingFilter(_) => {
            "42601"
        }
    }
}

fn scheduling_err(e: SchedulingError) -> PgWireError {
    user_error(scheduling_sqlstate(&e), e.to_string())
}

fn store_err(e: StoreError) -> PgWireError {
    user_error(store_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_scheduling_kind_has_its_own_sqlstate() {
        let kinds = [
            SchedulingError::PastBooking,
            SchedulingError::UnknownService(Ulid::nil()),
            SchedulingError::StaffNotWorking,
            SchedulingError::StaffOnBreak,
            SchedulingError::OutsideWorkingHours,
            SchedulingError::SlotCollision,
            SchedulingError::InvalidRequest("x".into()),
            SchedulingError::Store(StoreError::Wal("disk".into())),
        ];
        let codes: HashSet<_> = kinds.iter().map(scheduling_sqlstate).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| c.len() == 5));
    }

    #[test]
    fn login_must_be_a_client_id() {
        let id = Ulid::new();
        assert_eq!(client_id(Some(&id.to_string())).unwrap(), id);
        assert!(client_id(Some("postgres")).is_err());
        assert!(client_id(None).is_err());
    }

    #[test]
    fn schema_follows_statement_text() {
        assert_eq!(
            result_schema("SELECT * FROM slots WHERE date = $1").len(),
            4
        );
        assert_eq!(result_schema("select * from my_bookings").len(), 8);
        assert_eq!(
            result_schema("INSERT INTO bookings VALUES ($1, $2, $3, $4)").len(),
            8
        );
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO businesses VALUES ($1, $2)").is_empty());
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = vec![
            Some(bytes::Bytes::from_static(b"cost $2")),
            Some(bytes::Bytes::from_static(b"O'Neil")),
            None,
        ];
        assert_eq!(
            substitute("VALUES ($1, $2, $3, $9, $)", &params),
            "VALUES ('cost $2', 'O''Neil', NULL, $9, $)"
        );
        let many: Vec<_> = (1..=10)
            .map(|i| Some(bytes::Bytes::from(format!("v{i}"))))
            .collect();
        assert_eq!(substitute("$10 $1", &many), "'v10' 'v1'");
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
        assert_eq!(count_params("$ alone"), 0);
    }
}
