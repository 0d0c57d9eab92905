use std::fmt::Debug;
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
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::auth::RoomBookAuthSource;
use crate::authz::{Principal, RequestContext};
use crate::engine::{Engine, EngineError};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::view::{self, BookingView, RoomView, TimeSlotView, UserView};

/// Query handler for one client connection.
pub struct RoomBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RoomBookQueryParser>,
    /// Cancelled when the connection ends or the server shuts down.
    cancel: CancellationToken,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RoomBookQueryParser),
            cancel,
        }
    }

    /// Resolve the login to a principal. Unknown or disabled logins are anonymous.
    fn context<C: ClientInfo>(&self, client: &C) -> RequestContext {
        let principal = client
            .metadata()
            .get("user")
            .map(|email| self.engine.resolve_principal(email))
            .unwrap_or_else(Principal::anonymous);
        RequestContext::with_cancel(principal, self.cancel.clone())
    }

    async fn run(&self, ctx: &RequestContext, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(ctx, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, ctx: &RequestContext, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom(input) => {
                let room = engine.create_room(ctx, input).await?;
                json_response("room", [RoomView::from(&room)])
            }
            Command::UpdateRoom { id, patch } => {
                let room = engine.update_room(ctx, id, patch).await?;
                json_response("room", [RoomView::from(&room)])
            }
            Command::DeleteRoom { id } => {
                let report = engine.delete_room(ctx, id).await?;
                Ok(deleted(1 + report.bookings.len()))
            }
            Command::InsertTimeSlot(input) => {
                let slot = engine.create_time_slot(ctx, input).await?;
                json_response("time_slot", [TimeSlotView::from(&slot)])
            }
            Command::UpdateTimeSlot { id, patch } => {
                let slot = engine.update_time_slot(ctx, id, patch).await?;
                json_response("time_slot", [TimeSlotView::from(&slot)])
            }
            Command::DeleteTimeSlot { id } => {
                let report = engine.delete_time_slot(ctx, id).await?;
                Ok(deleted(1 + report.bookings.len()))
            }
            Command::InsertBooking(input) => {
                let detail = engine.create_booking(ctx, input).await?;
                json_response("booking", [BookingView::from(&detail)])
            }
            Command::UpdateBooking { id, patch } => {
                let detail = engine.update_booking(ctx, id, patch).await?;
                json_response("booking", [BookingView::from(&detail)])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(ctx, id).await?;
                Ok(deleted(1))
            }
            Command::InsertUser(input) => {
                let user = engine.register_user(ctx, input).await?;
                json_response("user", [UserView::from(&user)])
            }
            Command::UpdateUser { id, patch } => {
                let user = engine.update_user(ctx, id, patch).await?;
                json_response("user", [UserView::from(&user)])
            }
            Command::DeleteUser { id } => {
                let report = engine.delete_user(ctx, id).await?;
                Ok(deleted(1 + report.bookings.len()))
            }
            Command::UpdateProfile { password } => {
                let user = engine.change_password(ctx, password).await?;
                json_response("user", [UserView::from(&user)])
            }
            Command::SelectRooms { id: Some(id), filter } => {
                let room = engine.get_room(ctx, id).await?;
                let matching = filter.matches(&room).then(|| RoomView::from(&room));
                json_response("room", matching)
            }
            Command::SelectRooms { id: None, filter } => {
                let rooms = engine.list_rooms(ctx, filter).await?;
                json_response("room", rooms.iter().map(RoomView::from))
            }
            Command::SelectTimeSlots { id: Some(id) } => {
                let slot = engine.get_time_slot(ctx, id).await?;
                json_response("time_slot", [TimeSlotView::from(&slot)])
            }
            Command::SelectTimeSlots { id: None } => {
                let slots = engine.list_time_slots(ctx).await?;
                json_response("time_slot", slots.iter().map(TimeSlotView::from))
            }
            Command::SelectBookings { id: Some(id), room_id } => {
                let detail = engine.get_booking(ctx, id).await?;
                let matching = room_id
                    .is_none_or(|room| detail.booking.room_id == room)
                    .then(|| BookingView::from(&detail));
                json_response("booking", matching)
            }
            Command::SelectBookings { id: None, room_id: Some(room_id) } => {
                let details = engine.room_bookings(ctx, room_id).await?;
                json_response("booking", details.iter().map(BookingView::from))
            }
            Command::SelectBookings { id: None, room_id: None } => {
                let details = engine.list_bookings(ctx).await?;
                json_response("booking", details.iter().map(BookingView::from))
            }
            Command::SelectProfile => {
                let user = engine.profile(ctx).await?;
                json_response("user", [UserView::from(&user)])
            }
        }
    }
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn json_field(column: &'static str) -> FieldInfo {
    FieldInfo::new(column.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    sql::result_column(stmt).map(json_field).into_iter().collect()
}

/// One VARCHAR column named `column`, one JSON document per row.
fn json_response<T, I>(column: &'static str, items: I) -> Result<Response, EngineError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let schema = Arc::new(vec![json_field(column)]);
    let mut rows: Vec<PgWireResult<_>> = Vec::new();
    for item in items {
        let json = view::to_json(&item).map_err(|e| EngineError::Internal(format!("encode {column}: {e}")))?;
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder
            .encode_field(&json)
            .map_err(|e| EngineError::Internal(format!("encode {column}: {e}")))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let ctx = self.context(client);
        Ok(vec![self.run(&ctx, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let ctx = self.context(client);
        let sql = substitute_params(portal);
        self.run(&ctx, &sql).await
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

/// Substitute `$1`, `$2`, … with bound text parameters, quoted as string literals.
fn substitute_params(portal: &Portal<String>) -> String {
    expand_placeholders(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass, so text inside a substituted value is never
/// taken for a placeholder. `$n` with no bound parameter stays as written.
fn expand_placeholders<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let param = sql[start + 1..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        let Some(param) = param else { continue };
        out.push_str(&sql[copied..start]);
        match param {
            Some(value) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = i;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<RoomBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(engine: Arc<Engine>, password: String, cancel: CancellationToken) -> Self {
        let auth_source = RoomBookAuthSource::new(engine.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomBookHandler::new(engine, cancel)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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

/// Serve one client until it disconnects. In-flight work is cancelled when
/// `shutdown` fires or the connection ends.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let cancel = shutdown.child_token();
    let _cancel_on_exit = cancel.clone().drop_guard();
    let factory = Arc::new(RoomBookFactory::new(engine, password, cancel));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
