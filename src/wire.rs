use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::VenueBookAuthSource;
use crate::engine::{EngineError, Scheduler};
use crate::model::*;
use crate::notify::{Notification, NotifyHub, Subscriptions};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape};

pub struct VenueBookHandler {
    scheduler: Arc<Scheduler>,
    hub: Arc<NotifyHub>,
    /// LISTEN state per connection, keyed by peer address.
    sessions: DashMap<SocketAddr, Subscriptions>,
    /// Operating hours used for availability queries.
    window: TimeRange,
    query_parser: Arc<VenueBookQueryParser>,
}

impl VenueBookHandler {
    pub fn new(scheduler: Arc<Scheduler>, hub: Arc<NotifyHub>, window: TimeRange) -> Self {
        Self {
            scheduler,
            hub,
            sessions: DashMap::new(),
            window,
            query_parser: Arc::new(VenueBookQueryParser),
        }
    }

    /// Drop a closed connection's subscriptions.
    pub fn end_session(&self, peer: &SocketAddr) {
        self.sessions.remove(peer);
    }

    /// The session user is the acting identity for every statement.
    fn acting_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user in startup parameters".into()))
    }

    /// Execute one statement, then flush any notifications queued for the
    /// session ahead of its response.
    async fn run<C>(&self, client: &mut C, sql: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = self.acting_user(client)?;
        let peer = client.socket_addr();
        let result = match sql::parse_sql(sql) {
            Ok(cmd) => {
                let label = command_label(&cmd);
                let started = Instant::now();
                let result = self.execute_command(&user, peer, cmd).await;
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status)
                    .increment(1);
                metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
                    .record(started.elapsed().as_secs_f64());
                result
            }
            Err(e) => Err(sql_err(e)),
        };
        self.deliver_notifications(client, peer).await?;
        result
    }

    async fn deliver_notifications<C>(&self, client: &mut C, peer: SocketAddr) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = match self.sessions.get_mut(&peer) {
            Some(mut subs) => subs.drain(),
            None => return Ok(()),
        };
        if pending.is_empty() {
            return Ok(());
        }
        let (pid, _) = client.pid_and_secret_key();
        for n in pending {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, n.channel, n.payload),
                ))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }

    fn listen(&self, peer: SocketAddr, channel: &str) -> PgWireResult<Response> {
        if Notification::venue_of(channel).is_none() {
            return Err(user_error(
                "42000",
                format!("invalid channel: {channel} (expected venue_{{id}})"),
            ));
        }
        self.sessions
            .entry(peer)
            .or_default()
            .listen(&self.hub, channel);
        tracing::debug!("{peer} listening on {channel}");
        Ok(Response::Execution(Tag::new("LISTEN")))
    }

    fn unlisten(&self, peer: SocketAddr, channel: Option<&str>) -> Response {
        if let Some(mut subs) = self.sessions.get_mut(&peer) {
            subs.unlisten(channel);
        }
        self.sessions.remove_if(&peer, |_, subs| subs.is_empty());
        Response::Execution(Tag::new("UNLISTEN"))
    }

    async fn execute_command(
        &self,
        user: &str,
        peer: SocketAddr,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let scheduler = &self.scheduler;
        match cmd {
            Command::Listen { channel } => self.listen(peer, &channel),
            Command::Unlisten { channel } => Ok(self.unlisten(peer, channel.as_deref())),
            Command::InsertVenue { draft } => {
                scheduler.add_venue(user, draft).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteVenue { id } => {
                scheduler.delete_venue(user, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUser { user: new_user } => {
                scheduler
                    .register_user(user, new_user)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking { request } => {
                let booking = scheduler.submit(user, &request).await.map_err(engine_err)?;
                booking_response(vec![booking])
            }
            Command::Decide {
                booking_id,
                decision,
            } => {
                let booking = scheduler
                    .decide(booking_id, decision, user)
                    .await
                    .map_err(engine_err)?;
                booking_response(vec![booking])
            }
            Command::Rescind { booking_id } => {
                let booking = scheduler
                    .rescind(booking_id, user)
                    .await
                    .map_err(engine_err)?;
                booking_response(vec![booking])
            }
            Command::SelectVenues => {
                let venues = scheduler.list_venues().await.map_err(engine_err)?;
                let schema = Arc::new(venue_schema());
                let rows = venues
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.name)?;
                        encoder.encode_field(&(v.capacity.min(i32::MAX as u32) as i32))?;
                        encoder.encode_field(&v.image_url)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookings { filter } => {
                let bookings = scheduler.list_bookings(&filter).await.map_err(engine_err)?;
                booking_response(bookings)
            }
            Command::SelectPending => {
                let bookings = scheduler.pending_bookings().await.map_err(engine_err)?;
                booking_response(bookings)
            }
            Command::SelectSchedule { venue_id, date } => {
                let bookings = scheduler
                    .approved_schedule(venue_id, date)
                    .await
                    .map_err(engine_err)?;
                booking_response(bookings)
            }
            Command::SelectAvailability {
                venue_id,
                date,
                start,
                end,
                min_duration,
            } => {
                let window = TimeRange::new(
                    start.unwrap_or(self.window.start()),
                    end.unwrap_or(self.window.end()),
                )
                .map_err(|e| engine_err(e.into()))?;
                let slots = scheduler
                    .free_slots(venue_id, date, &window, min_duration.unwrap_or(0).max(0))
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let vid = venue_id.to_string();
                let day = date.to_string();
                let rows = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vid)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&slot.start().to_string())?;
                        encoder.encode_field(&slot.end().to_string())?;
                        encoder.encode_field(&slot.duration_minutes())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_response(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.user_name)?;
            encoder.encode_field(&b.event_name)?;
            encoder.encode_field(&b.venue_id.to_string())?;
            encoder.encode_field(&b.venue_name)?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&b.start_time().to_string())?;
            encoder.encode_field(&b.end_time().to_string())?;
            encoder.encode_field(&b.description)?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            encoder.encode_field(&b.decided_by)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(query_response(schema, rows))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn venue_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("image_url"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("user_name"),
        text_field("event_name"),
        text_field("venue_id"),
        text_field("venue_name"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("description"),
        text_field("status"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("updated_at".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("decided_by"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("venue_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        FieldInfo::new(
            "duration_minutes".into(),
            None,
            None,
            Type::INT8,
            FieldFormat::Text,
        ),
    ]
}

/// Result columns a statement will produce. Statements that do not parse
/// describe as no rows; executing them reports the error.
fn schema_for(stmt: &str) -> Vec<FieldInfo> {
    match sql::result_shape(stmt) {
        Ok(ResultShape::Venues) => venue_schema(),
        Ok(ResultShape::Bookings) => booking_schema(),
        Ok(ResultShape::Availability) => availability_schema(),
        Ok(ResultShape::Empty) | Err(_) => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for VenueBookHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VenueBookQueryParser;

#[async_trait]
impl QueryParser for VenueBookQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VenueBookHandler {
    type Statement = String;
    type QueryParser = VenueBookQueryParser;

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
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// A `$N` placeholder: byte span in the statement and its number.
struct Placeholder {
    start: usize,
    end: usize,
    n: usize,
}

/// `$N` placeholders outside quoted literals and quoted identifiers. A
/// doubled quote inside a literal closes and reopens it, which leaves the
/// scan inside.
fn placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    found.push(Placeholder {
                        start: digits - 1,
                        end: i,
                        n,
                    });
                }
            }
            None => {}
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|p| p.n).max().unwrap_or(0)
}

/// Substitute bound parameter values (text format) in one pass, so a value
/// is never rescanned for placeholders.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &values)
}

/// Placeholders without a bound value are left as written.
fn bind_params(sql: &str, values: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for p in placeholders(sql) {
        let Some(value) = p.n.checked_sub(1).and_then(|i| values.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..p.start]);
        match value {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = p.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct VenueBookFactory {
    handler: Arc<VenueBookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<VenueBookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl VenueBookFactory {
    /// `hub` must be the sink `scheduler` notifies, or LISTEN hears nothing.
    pub fn new(
        scheduler: Arc<Scheduler>,
        hub: Arc<NotifyHub>,
        window: TimeRange,
        password: String,
    ) -> Self {
        let auth_source = VenueBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VenueBookHandler::new(scheduler, hub, window)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VenueBookFactory {
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
    factory: VenueBookFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let peer = socket.peer_addr()?;
    let handler = factory.handler.clone();
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    handler.end_session(&peer);
    result
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::SlotTaken(_) => "23P01",
        EngineError::InvalidTransition(_) => "55000",
        EngineError::NotFound { .. } => "P0002",
        EngineError::NotAuthorized(_) => "42501",
        EngineError::VenueInUse { .. } => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Store(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Store(store) = &e {
        tracing::error!("store failure: {store}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
