use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::auth::RoombookAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::DEFAULT_UPCOMING;
use crate::model::*;
use crate::notify::LifecycleEvent;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::organization::Organizations;

/// LISTEN channel carrying every reservation event of the organization.
pub const ALL_RESERVATIONS_CHANNEL: &str = "reservations";
/// Prefix of per-room LISTEN channels: `room_<ulid>`.
pub const ROOM_CHANNEL_PREFIX: &str = "room_";

/// One handler per connection: it owns that session's LISTEN subscriptions.
pub struct RoombookHandler {
    organizations: Arc<Organizations>,
    admins: Arc<HashSet<String>>,
    query_parser: Arc<RoombookQueryParser>,
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<LifecycleEvent>>>,
}

impl RoombookHandler {
    pub fn new(organizations: Arc<Organizations>, admins: Arc<HashSet<String>>) -> Self {
        Self {
            organizations,
            admins,
            query_parser: Arc::new(RoombookQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.organizations
            .engine(&db)
            .map_err(|e| user_error("08006", format!("organization error: {e}")))
    }

    /// The startup user is the actor; configured admins get every capability.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Actor {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        if self.admins.contains(&user) {
            Actor::admin(user)
        } else {
            Actor::member(user)
        }
    }

    /// Parse, execute and meter one statement, then flush pending
    /// notifications so they precede the command's own response.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertRoom { id, draft } => {
                require(actor, Capability::ManageRooms)?;
                engine.create_room(id, draft).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom { id, patch } => {
                require(actor, Capability::ManageRooms)?;
                engine.update_room(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                require(actor, Capability::ManageRooms)?;
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRooms { id, active_only } => {
                let rooms = match id {
                    Some(id) => vec![engine.get_room(id).await.map_err(engine_err)?],
                    None => engine.list_rooms(active_only).await,
                };
                Ok(vec![room_rows(rooms)])
            }
            Command::InsertReservation { id, draft } => {
                engine
                    .create_reservation(id, draft, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateReservation { id, patch } => {
                engine
                    .update_reservation(id, patch, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations { id, filter } => {
                let reservations = match id {
                    Some(id) => vec![engine.get_reservation(id).await.map_err(engine_err)?],
                    None => engine.list_reservations(&filter).await.map_err(engine_err)?,
                };
                Ok(vec![reservation_rows(reservations)])
            }
            Command::SelectAgenda { room_id, start, end } => {
                let agenda = engine.agenda(room_id, start, end).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(agenda)])
            }
            Command::SelectFreeSlots { room_id, start, end } => {
                let slots = engine
                    .free_slots(room_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![slot_rows(room_id, slots)])
            }
            Command::SelectAvailableRooms {
                start,
                end,
                min_capacity,
            } => {
                let rooms = engine
                    .available_rooms(start, end, min_capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![room_rows(rooms)])
            }
            Command::SelectOccupancy { at } => {
                let snapshot = engine
                    .occupancy_snapshot(at.unwrap_or_else(now_ms))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![occupancy_rows(snapshot)])
            }
            Command::SelectDashboard { at, upcoming_limit } => {
                let dashboard = engine
                    .dashboard(
                        &actor.id,
                        at.unwrap_or_else(now_ms),
                        upcoming_limit.unwrap_or(DEFAULT_UPCOMING),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![dashboard_rows(dashboard)?])
            }
            Command::Listen { channel } => {
                let mut subscriptions = self.subscriptions.lock().await;
                if !subscriptions.contains_key(&channel) {
                    let rx = if channel == ALL_RESERVATIONS_CHANNEL {
                        engine.notify.subscribe_all()
                    } else {
                        let room_id = parse_room_channel(&channel)?;
                        engine.get_room(room_id).await.map_err(engine_err)?;
                        engine.notify.subscribe(room_id)
                    };
                    subscriptions.insert(channel, rx);
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.subscriptions.lock().await.remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions.lock().await.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Send every buffered lifecycle event as a NotificationResponse.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut subscriptions = self.subscriptions.lock().await;
            let mut pending = Vec::new();
            subscriptions.retain(|channel, rx| loop {
                match rx.try_recv() {
                    Ok(event) => pending.push((channel.clone(), event)),
                    Err(TryRecvError::Empty) => break true,
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!("LISTEN {channel} lagged, {skipped} events dropped");
                    }
                    Err(TryRecvError::Closed) => break false,
                }
            });
            pending
        };

        for (channel, event) in pending {
            let payload =
                serde_json::to_string(&event).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

fn require(actor: &Actor, capability: Capability) -> PgWireResult<()> {
    if actor.can(capability) {
        Ok(())
    } else {
        Err(engine_err(EngineError::PermissionDenied(format!(
            "{} lacks {capability:?}",
            actor.id
        ))))
    }
}

fn parse_room_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(ROOM_CHANNEL_PREFIX).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected {ALL_RESERVATIONS_CHANNEL} or room_{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("resources", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("active", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("owner", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("participants", Type::INT8),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("room_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        field("at", Type::INT8),
        field("total_rooms", Type::INT8),
        field("occupied_rooms", Type::INT8),
        field("free_rooms", Type::INT8),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    let mut schema = occupancy_schema();
    schema.push(field("reservations_today", Type::INT8));
    schema.push(field("upcoming", Type::VARCHAR));
    schema
}

/// Result columns of a SELECT, keyed by the table it reads.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("rooms" | "available_rooms") => room_schema(),
        Some("reservations" | "agenda") => reservation_schema(),
        Some("free_slots") => slot_schema(),
        Some("occupancy") => occupancy_schema(),
        Some("dashboard") => dashboard_schema(),
        _ => vec![],
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn room_rows(rooms: Vec<Room>) -> Response {
    let schema = Arc::new(room_schema());
    let rows = rooms
        .into_iter()
        .map(|room| {
            let resources = serde_json::to_string(&room.resources)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&i64::from(room.capacity))?;
            encoder.encode_field(&resources)?;
            encoder.encode_field(&room.location)?;
            encoder.encode_field(&room.description)?;
            encoder.encode_field(&room.active)?;
            encoder.encode_field(&room.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn reservation_rows(reservations: Vec<ReservationInfo>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&r.owner)?;
            encoder.encode_field(&r.title)?;
            encoder.encode_field(&r.description)?;
            encoder.encode_field(&r.start)?;
            encoder.encode_field(&r.end)?;
            encoder.encode_field(&i64::from(r.participants))?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn slot_rows(room_id: Ulid, slots: Vec<Span>) -> Response {
    let schema = Arc::new(slot_schema());
    let rid = room_id.to_string();
    let rows = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rid)?;
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn encode_occupancy(encoder: &mut DataRowEncoder, o: &Occupancy) -> PgWireResult<()> {
    encoder.encode_field(&o.at)?;
    encoder.encode_field(&(o.total_rooms as i64))?;
    encoder.encode_field(&(o.occupied_rooms as i64))?;
    encoder.encode_field(&(o.free_rooms as i64))
}

fn occupancy_rows(occupancy: Occupancy) -> Response {
    let schema = Arc::new(occupancy_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode_occupancy(&mut encoder, &occupancy).map(|_| encoder.take_row());
    query_response(schema, vec![row])
}

fn dashboard_rows(dashboard: Dashboard) -> PgWireResult<Response> {
    let schema = Arc::new(dashboard_schema());
    let upcoming = serde_json::to_string(&dashboard.upcoming)
        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_occupancy(&mut encoder, &dashboard.occupancy)?;
    encoder.encode_field(&(dashboard.reservations_today as i64))?;
    encoder.encode_field(&upcoming)?;
    Ok(query_response(schema, vec![Ok(encoder.take_row())]))
}

#[async_trait]
impl SimpleQueryHandler for RoombookHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoombookQueryParser;

#[async_trait]
impl QueryParser for RoombookQueryParser {
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
impl ExtendedQueryHandler for RoombookHandler {
    type Statement = String;
    type QueryParser = RoombookQueryParser;

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
        let mut responses = self.run(client, &sql).await?;
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

/// Count the highest $N parameter placeholder in the SQL string.
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

fn param_literal(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Replace `$n` placeholders in `sql` with quoted parameter values in a single
/// left-to-right pass. Only placeholders in the statement text itself are
/// touched: quoted strings and identifiers, and the substituted values, are
/// copied through verbatim.
fn bind_params(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                // A doubled quote is an escape and just reopens the literal.
                for (_, inner) in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '$' => {
                let digits_start = i + 1;
                let mut digits_end = digits_start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits_end = j + 1;
                    chars.next();
                }
                let index = sql[digits_start..digits_end].parse::<usize>().ok();
                match index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
                    Some(param) => out.push_str(&param_literal(*param)),
                    None => out.push_str(&sql[i..digits_end]),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|b| &b[..]))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoombookFactory {
    handler: Arc<RoombookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<RoombookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl RoombookFactory {
    pub fn new(
        organizations: Arc<Organizations>,
        password: String,
        admins: Arc<HashSet<String>>,
    ) -> Self {
        let auth_source = RoombookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoombookHandler::new(organizations, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoombookFactory {
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

/// Serve one client socket until it disconnects. Subscriptions die with it.
pub async fn process_connection(
    socket: TcpStream,
    organizations: Arc<Organizations>,
    password: String,
    admins: Arc<HashSet<String>>,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(RoombookFactory::new(organizations, password, admins));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE per error class.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Permission => "42501",
        ErrorKind::Storage => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM rooms"), 0);
        assert_eq!(count_params("SELECT * FROM agenda WHERE room_id = $1 AND start >= $3 AND \"end\" <= $2"), 3);
        assert_eq!(count_params("SELECT $12"), 12);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let id: &[u8] = b"01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let title: &[u8] = b"Review $1 and $100 budget";
        let sql = bind_params(
            "INSERT INTO reservations (id, title) VALUES ($1, $2)",
            &[Some(id), Some(title)],
        );
        assert_eq!(
            sql,
            "INSERT INTO reservations (id, title) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Review $1 and $100 budget')"
        );
    }

    #[test]
    fn placeholders_inside_quotes_and_out_of_range_stay_put() {
        let v: &[u8] = b"it's";
        assert_eq!(
            bind_params("SELECT '$1', \"$1\", $1, $2, $10 FROM t", &[Some(v), None]),
            "SELECT '$1', \"$1\", 'it''s', NULL, $10 FROM t"
        );
        assert_eq!(bind_params("SELECT 'a''$1' , $1", &[Some(v)]), "SELECT 'a''$1' , 'it''s'");
        assert_eq!(bind_params("SELECT $0, $", &[Some(v)]), "SELECT $0, $");
    }

    #[test]
    fn schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            schema_for(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM free_slots WHERE room_id = $1"), ["room_id", "start", "end"]);
        assert_eq!(names("SELECT * FROM available_rooms")[1], "name");
        assert_eq!(names("SELECT * FROM agenda")[8], "status");
        assert_eq!(names("SELECT * FROM dashboard").last().map(String::as_str), Some("upcoming"));
        assert!(names("INSERT INTO rooms (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn sqlstate_per_kind() {
        assert_eq!(sqlstate(EngineError::Conflict(Ulid::new()).kind()), "23P01");
        assert_eq!(sqlstate(EngineError::NotFound(Ulid::new()).kind()), "P0002");
        assert_eq!(sqlstate(EngineError::PermissionDenied("x".into()).kind()), "42501");
        assert_eq!(sqlstate(EngineError::WalError("disk".into()).kind()), "XX000");
    }

    #[test]
    fn room_channel_parsing() {
        let id = Ulid::new();
        assert_eq!(parse_room_channel(&format!("room_{id}")).unwrap(), id);
        assert!(parse_room_channel("resource_x").is_err());
        assert!(parse_room_channel("room_not-a-ulid").is_err());
    }

    #[test]
    fn members_cannot_manage_rooms() {
        assert!(require(&Actor::member("bob"), Capability::ManageRooms).is_err());
        assert!(require(&Actor::admin("root"), Capability::ManageRooms).is_ok());
    }
}
