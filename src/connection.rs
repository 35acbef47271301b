//! Connection state machine: message-id allocation, the single
//! pending-bind-or-StartTLS invariant, security-layer installation, and
//! close/teardown with draining of pending operations.
//!
//! One dedicated I/O task per connection owns the socket: it is the single
//! reader, it performs all writes handed over from the send path, and it
//! rebuilds the byte pipeline (TLS upgrade, SASL layer install) only between
//! frames, never mid-read. Senders serialize through the connection gate,
//! which also holds the terminal close reason and the sequencing invariant.

use crate::codec::{encode_message, parse_message, try_read_frame};
use crate::config::ConnectionConfig;
use crate::dispatch::{dispatch, MessageHandler};
use crate::error::LdapError;
use crate::pending::{
    OpOutcome, PendingTable, ResponseBody, ResponseKind, RouteStatus, SearchItem, SearchOutcome,
};
use crate::protocol::*;
use crate::sasl::CredentialExchange;
use crate::security::SaslSecurityLayer;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::tls;
use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

type Result<T> = std::result::Result<T, LdapError>;

/// Client stream: plain TCP or TLS-wrapped, so ldaps:// and a later
/// StartTLS upgrade share one read/write surface.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Work handed to the I/O task. Pipeline mutations (`StartTls`,
/// `InstallSasl`) only ever arrive between frames, at the sequencing
/// transition points.
enum IoCommand {
    Frame(Vec<u8>),
    StartTls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
        done: oneshot::Sender<Result<()>>,
    },
    InstallSasl {
        layer: SaslSecurityLayer,
        done: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Send-side state guarded by the connection gate.
struct SendGate {
    /// Terminal close reason; set at most once, replayed to later sends.
    closed: Option<Arc<LdapError>>,
    /// Message id of an in-flight bind or StartTLS; while set, no other
    /// operation may hit the wire.
    sequencing: Option<i32>,
    tls_installed: bool,
    sasl_installed: bool,
}

struct ConnCore {
    pending: PendingTable,
    stats: ConnectionStats,
    next_message_id: AtomicI32,
    gate: Mutex<SendGate>,
    io_tx: mpsc::UnboundedSender<IoCommand>,
    server_host: String,
    max_sasl_buffer: usize,
}

impl ConnCore {
    /// Allocate the next message id. The counter skips non-positive values
    /// and any id still present in the pending table, so uniqueness holds
    /// across wraparound: after `i32::MAX` allocation restarts at 1.
    fn allocate_message_id(&self) -> i32 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id > 0 && !self.pending.contains(id) {
                return id;
            }
            if id <= 0 {
                let _ = self.next_message_id.compare_exchange(
                    id.wrapping_add(1),
                    1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Serialize one request onto the wire, enforcing the gate invariants:
    /// a closed connection replays its reason, a sequencing bind/StartTLS
    /// rejects with an operations-error result (server-would-reject
    /// semantics enforced client-side, saving the round trip).
    fn dispatch_request(&self, message_id: i32, kind: ResponseKind, op: ProtocolOp) {
        let gate = self.gate.lock();
        if let Some(reason) = &gate.closed {
            let reason = (**reason).clone();
            drop(gate);
            self.pending.fail(message_id, reason);
            return;
        }
        if gate.sequencing.is_some() {
            drop(gate);
            let result = LdapResult::with_diagnostic(
                ResultCode::OperationsError,
                "a bind or StartTLS exchange is in progress on this connection",
            );
            self.pending.complete(message_id, reject_body(kind, result));
            return;
        }
        let frame = encode_message(&LdapMessage::new(message_id, op));
        self.stats.record_sent(kind);
        let sent = self.io_tx.send(IoCommand::Frame(frame));
        drop(gate);
        if sent.is_err() {
            self.pending.fail(
                message_id,
                LdapError::Closed("connection i/o task stopped".to_string()),
            );
        }
    }

    /// First close wins. Drains the pending table (best-effort abandon per
    /// remaining non-bind entry), attempts an Unbind, then shuts the
    /// transport down. Returns whether this call performed the close.
    fn close_with(&self, reason: LdapError) -> bool {
        let mut gate = self.gate.lock();
        if gate.closed.is_some() {
            return false;
        }
        debug!(%reason, "closing connection");
        let shared = Arc::new(reason);
        gate.closed = Some(Arc::clone(&shared));
        let sequencing = gate.sequencing.take();
        let drained = self.pending.drain(&shared);
        for (id, kind) in &drained {
            self.stats.record_failed(*kind);
            // With a bind or StartTLS in flight the wire ordering would be
            // invalid, so abandons are suppressed entirely.
            if sequencing.is_none() && *kind != ResponseKind::Bind {
                let abandon =
                    LdapMessage::new(self.allocate_message_id(), ProtocolOp::AbandonRequest(*id));
                if self
                    .io_tx
                    .send(IoCommand::Frame(encode_message(&abandon)))
                    .is_ok()
                {
                    self.stats.record_abandon();
                }
            }
        }
        let unbind = LdapMessage::new(self.allocate_message_id(), ProtocolOp::UnbindRequest);
        let _ = self.io_tx.send(IoCommand::Frame(encode_message(&unbind)));
        let _ = self.io_tx.send(IoCommand::Shutdown);
        true
    }

    /// Drop the sequencing claim if `message_id` still holds it.
    fn release_sequencer(&self, message_id: i32) {
        let mut gate = self.gate.lock();
        if gate.sequencing == Some(message_id) {
            gate.sequencing = None;
        }
    }
}

fn reject_body(kind: ResponseKind, result: LdapResult) -> ResponseBody {
    match kind {
        ResponseKind::Bind => ResponseBody::Bind(BindResponse {
            result,
            server_sasl_creds: None,
        }),
        ResponseKind::Search => ResponseBody::SearchDone(result),
        ResponseKind::Modify => ResponseBody::Modify(result),
        ResponseKind::Add => ResponseBody::Add(result),
        ResponseKind::Delete => ResponseBody::Delete(result),
        ResponseKind::ModifyDn => ResponseBody::ModifyDn(result),
        ResponseKind::Compare => ResponseBody::Compare(result),
        ResponseKind::Extended => ResponseBody::Extended(ExtendedResponse {
            result,
            response_name: None,
            response_value: None,
        }),
    }
}

fn body_result(body: ResponseBody) -> LdapResult {
    match body {
        ResponseBody::Bind(resp) => resp.result,
        ResponseBody::Extended(resp) => resp.result,
        ResponseBody::SearchDone(result)
        | ResponseBody::Modify(result)
        | ResponseBody::Add(result)
        | ResponseBody::Delete(result)
        | ResponseBody::ModifyDn(result)
        | ResponseBody::Compare(result) => result,
    }
}

/// Client-side dispatcher: routes responses into the pending table and
/// tears the connection down on anything that compromises the stream.
struct ClientHandler {
    core: Arc<ConnCore>,
}

impl ClientHandler {
    fn route_terminal(&self, message_id: i32, body: ResponseBody) -> Result<()> {
        let got = body.kind();
        match self.core.pending.complete(message_id, body) {
            RouteStatus::Delivered => {
                self.core.stats.record_completed(got);
                Ok(())
            }
            RouteStatus::NotFound => {
                // Late response for a cancelled or timed-out id: tolerated.
                debug!(message_id, kind = got.name(), "dropping response with no pending entry");
                Ok(())
            }
            RouteStatus::Mismatch { expected } => Err(LdapError::KindMismatch {
                message_id,
                expected: expected.name(),
                got: got.name(),
            }),
        }
    }

    fn route_search_item(&self, message_id: i32, item: SearchItem) -> Result<()> {
        match self.core.pending.push_search_item(message_id, item) {
            RouteStatus::Delivered | RouteStatus::NotFound => Ok(()),
            RouteStatus::Mismatch { expected } => Err(LdapError::KindMismatch {
                message_id,
                expected: expected.name(),
                got: ResponseKind::Search.name(),
            }),
        }
    }
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn handle_bind_response(&self, message_id: i32, resp: BindResponse) -> Result<()> {
        match self.core.pending.push_bind_response(message_id, resp) {
            RouteStatus::Delivered => Ok(()),
            RouteStatus::NotFound => {
                debug!(message_id, "dropping bind response with no pending entry");
                Ok(())
            }
            RouteStatus::Mismatch { expected } => Err(LdapError::KindMismatch {
                message_id,
                expected: expected.name(),
                got: ResponseKind::Bind.name(),
            }),
        }
    }

    async fn handle_search_result_entry(
        &self,
        message_id: i32,
        entry: SearchResultEntry,
    ) -> Result<()> {
        self.route_search_item(message_id, SearchItem::Entry(entry))
    }

    async fn handle_search_result_reference(
        &self,
        message_id: i32,
        reference: SearchResultReference,
    ) -> Result<()> {
        self.route_search_item(message_id, SearchItem::Reference(reference))
    }

    async fn handle_search_result_done(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::SearchDone(result))
    }

    async fn handle_modify_response(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::Modify(result))
    }

    async fn handle_add_response(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::Add(result))
    }

    async fn handle_del_response(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::Delete(result))
    }

    async fn handle_modify_dn_response(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::ModifyDn(result))
    }

    async fn handle_compare_response(&self, message_id: i32, result: LdapResult) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::Compare(result))
    }

    async fn handle_extended_response(
        &self,
        message_id: i32,
        resp: ExtendedResponse,
    ) -> Result<()> {
        self.route_terminal(message_id, ResponseBody::Extended(resp))
    }

    async fn handle_intermediate_response(
        &self,
        message_id: i32,
        resp: IntermediateResponse,
    ) -> Result<()> {
        // Delivered mid-operation; nothing here consumes them yet.
        debug!(
            message_id,
            name = resp.response_name.as_deref().unwrap_or(""),
            "ignoring intermediate response"
        );
        Ok(())
    }

    async fn handle_unrecognized(&self, message_id: i32, tag: u8, raw: Vec<u8>) -> Result<()> {
        // Tolerated on a client: log and keep the stream alive.
        warn!(
            message_id,
            tag = format_args!("0x{tag:02X}"),
            len = raw.len(),
            "ignoring message with unsupported tag"
        );
        Ok(())
    }

    async fn handle_exception(&self, error: LdapError) {
        warn!(%error, "connection failure, tearing down");
        self.core.close_with(error);
    }
}

async fn write_frame(
    stream: &mut ClientStream,
    sasl: Option<&mut SaslSecurityLayer>,
    frame: &[u8],
    stats: &ConnectionStats,
) -> Result<()> {
    if let Some(layer) = sasl {
        let wire = layer.protect(frame)?;
        stats.record_bytes_out(wire.len());
        stream.write_all(wire).await?;
    } else {
        stats.record_bytes_out(frame.len());
        stream.write_all(frame).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn process_frames(
    handler: &ClientHandler,
    frames: &mut BytesMut,
    max_frame: usize,
) -> Result<()> {
    while let Some(frame) = try_read_frame(frames, max_frame)? {
        let msg = parse_message(&frame)?;
        // RFC 4511 reserves a non-positive envelope id for unsolicited
        // notifications; these never touch the pending table.
        if msg.message_id <= 0 {
            handler.core.stats.record_unsolicited();
            match msg.op {
                ProtocolOp::ExtendedResponse(resp)
                    if resp.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) =>
                {
                    info!(
                        code = %resp.result.result_code,
                        diagnostic = %resp.result.diagnostic_message,
                        "server sent notice of disconnection"
                    );
                    return Err(LdapError::Disconnected(resp.result));
                }
                op => {
                    debug!(op = op.name(), "ignoring unsolicited notification");
                }
            }
            continue;
        }
        dispatch(handler, msg).await?;
    }
    Ok(())
}

/// The per-connection I/O task: single reader, serialized writer, and the
/// only place the pipeline is ever rebuilt.
async fn io_task(
    handler: Arc<ClientHandler>,
    mut stream: ClientStream,
    mut cmd_rx: mpsc::UnboundedReceiver<IoCommand>,
    max_frame: usize,
) {
    let mut raw_in = BytesMut::with_capacity(4096);
    let mut frames = BytesMut::with_capacity(4096);
    let mut sasl: Option<SaslSecurityLayer> = None;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(IoCommand::Shutdown) => {
                        let _ = stream.shutdown().await;
                        return;
                    }
                    Some(IoCommand::Frame(frame)) => {
                        if let Err(e) =
                            write_frame(&mut stream, sasl.as_mut(), &frame, &handler.core.stats)
                                .await
                        {
                            handler.handle_exception(e).await;
                            let _ = stream.shutdown().await;
                            return;
                        }
                    }
                    Some(IoCommand::StartTls { connector, server_name, done }) => {
                        match stream {
                            ClientStream::Tcp(tcp) => {
                                match connector.connect(server_name, tcp).await {
                                    Ok(tls_stream) => {
                                        debug!("TLS layer installed into the pipeline");
                                        stream = ClientStream::Tls(tls_stream);
                                        let _ = done.send(Ok(()));
                                    }
                                    Err(e) => {
                                        let _ = done.send(Err(LdapError::security(format!(
                                            "TLS handshake failed: {e}"
                                        ))));
                                        return;
                                    }
                                }
                            }
                            already_tls @ ClientStream::Tls(_) => {
                                stream = already_tls;
                                let _ = done.send(Err(LdapError::InvalidState(
                                    "TLS is already installed".to_string(),
                                )));
                            }
                        }
                    }
                    Some(IoCommand::InstallSasl { layer, done }) => {
                        debug!("SASL security layer installed into the pipeline");
                        sasl = Some(layer);
                        let _ = done.send(());
                    }
                }
            }
            read = stream.read_buf(&mut raw_in) => {
                match read {
                    Ok(0) => {
                        handler
                            .handle_exception(LdapError::Io {
                                kind: std::io::ErrorKind::UnexpectedEof,
                                message: "connection closed by peer".to_string(),
                            })
                            .await;
                        return;
                    }
                    Ok(n) => {
                        handler.core.stats.record_bytes_in(n);
                        let fed = match sasl.as_mut() {
                            Some(layer) => layer.unprotect(&mut raw_in, &mut frames),
                            None => {
                                frames.extend_from_slice(&raw_in);
                                raw_in.clear();
                                Ok(())
                            }
                        };
                        let processed = match fed {
                            Ok(()) => process_frames(&handler, &mut frames, max_frame).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = processed {
                            handler.handle_exception(e).await;
                            let _ = stream.shutdown().await;
                            return;
                        }
                    }
                    Err(e) => {
                        handler.handle_exception(e.into()).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Handle to one in-flight single-response operation. Await `result` for the
/// outcome; dropping the handle neither cancels nor abandons the operation.
pub struct OperationHandle {
    message_id: i32,
    rx: oneshot::Receiver<OpOutcome>,
}

impl OperationHandle {
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Terminal result. Exceptional result codes surface as
    /// [`LdapError::ResultError`]; bound the wait with `tokio::time::timeout`
    /// if needed — a timeout is a pure wait bound and abandons nothing.
    pub async fn result(self) -> Result<LdapResult> {
        match self.rx.await {
            Ok(Ok(body)) => body_result(body).into_outcome(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LdapError::Closed(
                "connection dropped before completing the operation".to_string(),
            )),
        }
    }

    /// Full extended response (name and value included).
    pub async fn extended_result(self) -> Result<ExtendedResponse> {
        match self.rx.await {
            Ok(Ok(ResponseBody::Extended(resp))) => {
                if resp.result.result_code.is_exceptional() {
                    Err(LdapError::ResultError(resp.result))
                } else {
                    Ok(resp)
                }
            }
            Ok(Ok(body)) => Ok(ExtendedResponse {
                result: body_result(body),
                response_name: None,
                response_value: None,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LdapError::Closed(
                "connection dropped before completing the operation".to_string(),
            )),
        }
    }

    /// Compare outcome as a boolean.
    pub async fn compare_result(self) -> Result<bool> {
        let result = self.result().await?;
        match result.result_code {
            ResultCode::CompareTrue => Ok(true),
            ResultCode::CompareFalse => Ok(false),
            _ => Err(LdapError::ResultError(result)),
        }
    }
}

/// Handle to one in-flight search: streamed entries/references first, then
/// the terminal outcome.
pub struct SearchHandle {
    message_id: i32,
    items: mpsc::UnboundedReceiver<SearchItem>,
    done: oneshot::Receiver<std::result::Result<SearchOutcome, LdapError>>,
}

impl SearchHandle {
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Next streamed entry/reference, in wire order. `None` once the
    /// terminal result has been delivered and the stream is drained.
    pub async fn next_item(&mut self) -> Option<SearchItem> {
        self.items.recv().await
    }

    /// Await the terminal result. Exceptional done codes surface as
    /// [`LdapError::ResultError`].
    pub async fn finish(self) -> Result<SearchOutcome> {
        match self.done.await {
            Ok(Ok(outcome)) => {
                if outcome.result.result_code.is_exceptional() {
                    Err(LdapError::ResultError(outcome.result))
                } else {
                    Ok(outcome)
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LdapError::Closed(
                "connection dropped before completing the search".to_string(),
            )),
        }
    }

    /// Drain the stream into a vector of entries (references are counted in
    /// the outcome but not collected), then return the terminal outcome.
    pub async fn collect(mut self) -> Result<(Vec<SearchResultEntry>, SearchOutcome)> {
        let mut entries = Vec::new();
        while let Some(item) = self.items.recv().await {
            if let SearchItem::Entry(entry) = item {
                entries.push(entry);
            }
        }
        let outcome = self.finish().await?;
        Ok((entries, outcome))
    }
}

/// Confidentiality layer currently protecting the byte pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLayerKind {
    None,
    Tls,
    Sasl,
}

/// An asynchronous LDAP v3 client connection.
///
/// All operations allocate a message id, register a pending entry, and hand
/// the encoded frame to the connection's I/O task; the returned handle
/// resolves when the matching response arrives. Responses to different
/// message ids complete in whatever order the server interleaves them.
pub struct LdapConnection {
    core: Arc<ConnCore>,
    config: ConnectionConfig,
}

impl LdapConnection {
    /// Connect per the config: TCP (plus an immediate TLS handshake for
    /// ldaps://), then spawn the connection's I/O task.
    pub async fn connect(config: ConnectionConfig) -> anyhow::Result<Self> {
        let (host, port) = config.host_port()?;
        let tcp = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}:{}", host, port))?
        .with_context(|| format!("Connect to {}:{}", host, port))?;
        tcp.set_nodelay(true)?;
        let (stream, tls_installed) = if config.is_ldaps() {
            let (connector, server_name) = tls::build_connector(&config)?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .context("TLS handshake")?;
            (ClientStream::Tls(tls_stream), true)
        } else {
            (ClientStream::Tcp(tcp), false)
        };
        info!(url = %config.url, tls = tls_installed, "LDAP connection established");

        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ConnCore {
            pending: PendingTable::new(),
            stats: ConnectionStats::new(),
            next_message_id: AtomicI32::new(1),
            gate: Mutex::new(SendGate {
                closed: None,
                sequencing: None,
                tls_installed,
                sasl_installed: false,
            }),
            io_tx,
            server_host: host,
            max_sasl_buffer: config.max_sasl_buffer_bytes(),
        });
        let handler = Arc::new(ClientHandler {
            core: Arc::clone(&core),
        });
        let max_frame = config.max_frame_bytes();
        tokio::spawn(io_task(handler, stream, io_rx, max_frame));
        Ok(Self { core, config })
    }

    /// Number of operations awaiting responses.
    pub fn pending_operations(&self) -> usize {
        self.core.pending.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// The recorded close reason, if the connection has been closed.
    pub fn closed_reason(&self) -> Option<LdapError> {
        let gate = self.core.gate.lock();
        gate.closed.as_deref().cloned()
    }

    /// Which confidentiality layer is installed. SASL wrapping layers over
    /// TLS report as SASL, matching what protects the outermost bytes.
    pub fn security_layer(&self) -> SecurityLayerKind {
        let gate = self.core.gate.lock();
        if gate.sasl_installed {
            SecurityLayerKind::Sasl
        } else if gate.tls_installed {
            SecurityLayerKind::Tls
        } else {
            SecurityLayerKind::None
        }
    }

    async fn submit(
        &self,
        kind: ResponseKind,
        op: ProtocolOp,
    ) -> OperationHandle {
        let message_id = self.core.allocate_message_id();
        let rx = self.core.pending.register(message_id, kind);
        self.core.dispatch_request(message_id, kind, op);
        OperationHandle { message_id, rx }
    }

    pub async fn add(&self, entry: impl Into<String>, attributes: Vec<Attribute>) -> OperationHandle {
        self.submit(
            ResponseKind::Add,
            ProtocolOp::AddRequest(AddRequest {
                entry: entry.into(),
                attributes,
            }),
        )
        .await
    }

    pub async fn delete(&self, dn: impl Into<String>) -> OperationHandle {
        self.submit(
            ResponseKind::Delete,
            ProtocolOp::DelRequest(DelRequest { entry: dn.into() }),
        )
        .await
    }

    pub async fn modify(
        &self,
        object: impl Into<String>,
        changes: Vec<ModifyChange>,
    ) -> OperationHandle {
        self.submit(
            ResponseKind::Modify,
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: object.into(),
                changes,
            }),
        )
        .await
    }

    pub async fn modify_dn(&self, request: ModifyDnRequest) -> OperationHandle {
        self.submit(ResponseKind::ModifyDn, ProtocolOp::ModifyDnRequest(request))
            .await
    }

    pub async fn compare(
        &self,
        entry: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> OperationHandle {
        self.submit(
            ResponseKind::Compare,
            ProtocolOp::CompareRequest(CompareRequest {
                entry: entry.into(),
                attr: attr.into(),
                assertion_value: value.into(),
            }),
        )
        .await
    }

    pub async fn extended(
        &self,
        request_name: impl Into<String>,
        request_value: Option<Vec<u8>>,
    ) -> OperationHandle {
        self.submit(
            ResponseKind::Extended,
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: request_name.into(),
                request_value,
            }),
        )
        .await
    }

    /// WhoAmI (RFC 4532): the authorization identity the server has for
    /// this connection.
    pub async fn who_am_i(&self) -> Result<Option<String>> {
        let resp = self.extended(WHO_AM_I_OID, None).await.extended_result().await?;
        match resp.response_value {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|_| {
                LdapError::decode("WhoAmI authorization identity is not UTF-8")
            })?)),
            None => Ok(None),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> SearchHandle {
        let message_id = self.core.allocate_message_id();
        let (items, done) = self.core.pending.register_search(message_id);
        self.core
            .dispatch_request(message_id, ResponseKind::Search, ProtocolOp::SearchRequest(request));
        SearchHandle {
            message_id,
            items,
            done,
        }
    }

    /// Simple (DN + password) bind. Requires a quiescent connection.
    pub async fn simple_bind(&self, dn: &str, password: &str) -> Result<LdapResult> {
        let core = &self.core;
        let (message_id, mut rx) = {
            let mut gate = core.gate.lock();
            self.check_bind_preconditions(&gate)?;
            let message_id = core.allocate_message_id();
            let rx = core.pending.register_bind(message_id);
            gate.sequencing = Some(message_id);
            let msg = LdapMessage::new(
                message_id,
                ProtocolOp::BindRequest(BindRequest {
                    version: 3,
                    name: dn.to_string(),
                    authentication: BindAuthentication::Simple(password.to_string()),
                }),
            );
            core.stats.record_sent(ResponseKind::Bind);
            if core.io_tx.send(IoCommand::Frame(encode_message(&msg))).is_err() {
                gate.sequencing = None;
                drop(gate);
                core.pending.remove(message_id);
                return Err(LdapError::Closed("connection i/o task stopped".to_string()));
            }
            (message_id, rx)
        };
        let outcome = rx.recv().await;
        core.release_sequencer(message_id);
        core.pending.remove(message_id);
        match outcome {
            Some(Ok(resp)) => {
                if resp.result.result_code.is_exceptional() {
                    core.stats.record_failed(ResponseKind::Bind);
                } else {
                    core.stats.record_completed(ResponseKind::Bind);
                }
                resp.result.into_outcome()
            }
            Some(Err(e)) => Err(e),
            None => Err(LdapError::Closed(
                "connection dropped before completing the bind".to_string(),
            )),
        }
    }

    /// SASL bind driving a pluggable credential exchange, looping on
    /// `saslBindInProgress` with the same message id and pending entry. On a
    /// success that negotiated confidentiality, the wrap/unwrap layer is
    /// installed into the pipeline before the bind completes.
    pub async fn sasl_bind(&self, mut exchange: Box<dyn CredentialExchange>) -> Result<LdapResult> {
        let core = &self.core;
        // Claim the sequencer before any external work so a concurrent
        // operation cannot slip in between initialize and the first send.
        let message_id = {
            let mut gate = core.gate.lock();
            self.check_bind_preconditions(&gate)?;
            let message_id = core.allocate_message_id();
            gate.sequencing = Some(message_id);
            message_id
        };
        // The exchange may contact a naming/ticket service here; a failure
        // fails the bind without anything having touched the wire.
        let initial = match exchange.initialize(&core.server_host) {
            Ok(initial) => initial,
            Err(e) => {
                core.release_sequencer(message_id);
                exchange.dispose();
                return Err(e);
            }
        };
        let mechanism = exchange.mechanism().to_string();
        let mut rx = core.pending.register_bind(message_id);
        if let Err(e) = self.send_bind_leg(message_id, &mechanism, initial) {
            core.release_sequencer(message_id);
            core.pending.remove(message_id);
            exchange.dispose();
            return Err(e);
        }

        let mut sasl_installed = false;
        let final_result = loop {
            let response = match rx.recv().await {
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    core.release_sequencer(message_id);
                    exchange.dispose();
                    return Err(e);
                }
                None => {
                    core.release_sequencer(message_id);
                    exchange.dispose();
                    return Err(LdapError::Closed(
                        "connection dropped before completing the bind".to_string(),
                    ));
                }
            };
            if response.result.result_code == ResultCode::SaslBindInProgress {
                // Feed the challenge back and send the follow-up leg,
                // reusing the same message id and pending entry.
                let challenge = response.server_sasl_creds.unwrap_or_default();
                let next = match exchange.evaluate(&challenge) {
                    Ok(next) => next,
                    Err(e) => {
                        core.release_sequencer(message_id);
                        core.pending.remove(message_id);
                        exchange.dispose();
                        core.close_with(e.clone());
                        return Err(e);
                    }
                };
                if let Err(e) = self.send_bind_leg(message_id, &mechanism, next) {
                    core.release_sequencer(message_id);
                    core.pending.remove(message_id);
                    exchange.dispose();
                    return Err(e);
                }
                continue;
            }
            if !response.result.result_code.is_exceptional() {
                // Some mechanisms return final verification data with the
                // success result (e.g. DIGEST-MD5 rspauth).
                if let Some(creds) = &response.server_sasl_creds {
                    if !exchange.is_complete() || !creds.is_empty() {
                        if let Err(e) = exchange.evaluate(creds) {
                            core.release_sequencer(message_id);
                            core.pending.remove(message_id);
                            exchange.dispose();
                            core.close_with(e.clone());
                            return Err(e);
                        }
                    }
                }
                if exchange.is_secure() {
                    let layer = SaslSecurityLayer::new(exchange, core.max_sasl_buffer);
                    let (done_tx, done_rx) = oneshot::channel();
                    let send_ok = {
                        let gate = core.gate.lock();
                        let ok = gate.closed.is_none()
                            && core
                                .io_tx
                                .send(IoCommand::InstallSasl {
                                    layer,
                                    done: done_tx,
                                })
                                .is_ok();
                        drop(gate);
                        ok
                    };
                    if !send_ok || done_rx.await.is_err() {
                        core.release_sequencer(message_id);
                        core.pending.remove(message_id);
                        return Err(LdapError::Closed(
                            "connection closed while installing the SASL layer".to_string(),
                        ));
                    }
                    sasl_installed = true;
                    exchange = Box::new(NoopExchange);
                }
                exchange.dispose();
            } else {
                exchange.dispose();
            }
            break response.result;
        };

        {
            let mut gate = core.gate.lock();
            if sasl_installed {
                gate.sasl_installed = true;
            }
            if gate.sequencing == Some(message_id) {
                gate.sequencing = None;
            }
        }
        core.pending.remove(message_id);
        if final_result.result_code.is_exceptional() {
            core.stats.record_failed(ResponseKind::Bind);
        } else {
            core.stats.record_completed(ResponseKind::Bind);
        }
        final_result.into_outcome()
    }

    fn check_bind_preconditions(&self, gate: &SendGate) -> Result<()> {
        if let Some(reason) = &gate.closed {
            return Err((**reason).clone());
        }
        if gate.sequencing.is_some() {
            return Err(LdapError::InvalidState(
                "another bind or StartTLS exchange is in progress".to_string(),
            ));
        }
        if !self.core.pending.is_empty() {
            return Err(LdapError::InvalidState(format!(
                "bind requires a quiescent connection; {} operations are pending",
                self.core.pending.len()
            )));
        }
        Ok(())
    }

    fn send_bind_leg(
        &self,
        message_id: i32,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<()> {
        let core = &self.core;
        let gate = core.gate.lock();
        if let Some(reason) = &gate.closed {
            return Err((**reason).clone());
        }
        let msg = LdapMessage::new(
            message_id,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: String::new(),
                authentication: BindAuthentication::Sasl {
                    mechanism: mechanism.to_string(),
                    credentials,
                },
            }),
        );
        core.stats.record_sent(ResponseKind::Bind);
        if core.io_tx.send(IoCommand::Frame(encode_message(&msg))).is_err() {
            return Err(LdapError::Closed("connection i/o task stopped".to_string()));
        }
        Ok(())
    }

    /// StartTLS (RFC 4511 §4.14): extended handshake on a quiescent
    /// connection, then the TLS upgrade at the pipeline transition point.
    /// A handshake failure closes the connection; a server refusal leaves
    /// it open in plaintext.
    pub async fn start_tls(&self) -> Result<()> {
        let (connector, server_name) = tls::build_connector(&self.config)
            .map_err(|e| LdapError::InvalidState(format!("TLS is not configured: {e:#}")))?;
        let core = &self.core;
        let (message_id, rx) = {
            let mut gate = core.gate.lock();
            if let Some(reason) = &gate.closed {
                return Err((**reason).clone());
            }
            if gate.sequencing.is_some() {
                return Err(LdapError::InvalidState(
                    "another bind or StartTLS exchange is in progress".to_string(),
                ));
            }
            if gate.tls_installed {
                return Err(LdapError::InvalidState("TLS is already installed".to_string()));
            }
            if !core.pending.is_empty() {
                return Err(LdapError::InvalidState(format!(
                    "StartTLS requires a quiescent connection; {} operations are pending",
                    core.pending.len()
                )));
            }
            let message_id = core.allocate_message_id();
            let rx = core.pending.register(message_id, ResponseKind::Extended);
            gate.sequencing = Some(message_id);
            let msg = LdapMessage::new(
                message_id,
                ProtocolOp::ExtendedRequest(ExtendedRequest {
                    request_name: START_TLS_OID.to_string(),
                    request_value: None,
                }),
            );
            core.stats.record_sent(ResponseKind::Extended);
            if core.io_tx.send(IoCommand::Frame(encode_message(&msg))).is_err() {
                gate.sequencing = None;
                drop(gate);
                core.pending.remove(message_id);
                return Err(LdapError::Closed("connection i/o task stopped".to_string()));
            }
            (message_id, rx)
        };

        let response = match rx.await {
            Ok(Ok(ResponseBody::Extended(resp))) => resp,
            Ok(Ok(_)) => unreachable!("extended entry admits only extended responses"),
            Ok(Err(e)) => {
                core.release_sequencer(message_id);
                return Err(e);
            }
            Err(_) => {
                core.release_sequencer(message_id);
                return Err(LdapError::Closed(
                    "connection dropped before completing StartTLS".to_string(),
                ));
            }
        };
        if response.result.result_code.is_exceptional() {
            // Server refused; the connection stays usable in plaintext.
            core.release_sequencer(message_id);
            core.stats.record_failed(ResponseKind::Extended);
            return Err(LdapError::ResultError(response.result));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let send_ok = {
            let gate = core.gate.lock();
            gate.closed.is_none()
                && core
                    .io_tx
                    .send(IoCommand::StartTls {
                        connector,
                        server_name,
                        done: done_tx,
                    })
                    .is_ok()
        };
        if !send_ok {
            core.release_sequencer(message_id);
            return Err(LdapError::Closed(
                "connection closed before the TLS handshake".to_string(),
            ));
        }
        match done_rx.await {
            Ok(Ok(())) => {
                let mut gate = core.gate.lock();
                gate.tls_installed = true;
                if gate.sequencing == Some(message_id) {
                    gate.sequencing = None;
                }
                drop(gate);
                core.stats.record_completed(ResponseKind::Extended);
                info!("StartTLS upgrade completed");
                Ok(())
            }
            Ok(Err(e)) => {
                core.release_sequencer(message_id);
                core.stats.record_failed(ResponseKind::Extended);
                core.close_with(e.clone());
                Err(e)
            }
            Err(_) => {
                core.release_sequencer(message_id);
                Err(LdapError::Closed(
                    "connection dropped during the TLS handshake".to_string(),
                ))
            }
        }
    }

    /// Abandon a pending operation: its local future completes as cancelled
    /// immediately; the peer is notified best-effort. While a bind or
    /// StartTLS sequences, the wire notification is suppressed.
    pub async fn abandon(&self, message_id: i32) {
        let core = &self.core;
        let cancelled = core.pending.cancel(message_id);
        if cancelled.is_none() {
            debug!(message_id, "abandon for an id with no pending entry");
        }
        let gate = core.gate.lock();
        if gate.closed.is_some() || gate.sequencing.is_some() {
            return;
        }
        let msg = LdapMessage::new(
            core.allocate_message_id(),
            ProtocolOp::AbandonRequest(message_id),
        );
        if core.io_tx.send(IoCommand::Frame(encode_message(&msg))).is_ok() {
            core.stats.record_abandon();
        }
    }

    /// Close the connection. Idempotent; the first close (local or
    /// failure-driven) wins and its reason is replayed to later sends.
    pub async fn close(&self) {
        self.core.close_with(LdapError::Closed(
            "connection closed by local caller".to_string(),
        ));
    }
}

impl Drop for LdapConnection {
    fn drop(&mut self) {
        let _ = self.core.io_tx.send(IoCommand::Shutdown);
    }
}

/// Placeholder the bind sequencer swaps in after moving the real exchange
/// into the installed security layer.
struct NoopExchange;

impl CredentialExchange for NoopExchange {
    fn mechanism(&self) -> &str {
        ""
    }
    fn initialize(&mut self, _server_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn evaluate(&mut self, _challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn is_complete(&self) -> bool {
        true
    }
    fn is_secure(&self) -> bool {
        false
    }
    fn wrap(&mut self, _plaintext: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
    fn unwrap(&mut self, _ciphertext: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
    fn dispose(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::security::test_support::XorExchange;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(5);

    /// In-process peer speaking raw frames over loopback TCP.
    struct StubPeer {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl StubPeer {
        async fn read_message(&mut self) -> LdapMessage {
            loop {
                if let Some(frame) = try_read_frame(&mut self.buf, 1 << 20).unwrap() {
                    return parse_message(&frame).unwrap();
                }
                let n = timeout(TICK, self.stream.read_buf(&mut self.buf))
                    .await
                    .expect("stub read timed out")
                    .unwrap();
                assert!(n > 0, "client closed while stub expected a message");
            }
        }

        async fn send(&mut self, msg: &LdapMessage) {
            self.stream.write_all(&encode_message(msg)).await.unwrap();
            self.stream.flush().await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
            self.stream.flush().await.unwrap();
        }

        /// Best-effort send for after-close scenarios where the client side
        /// may already have shut the socket down.
        async fn try_send(&mut self, msg: &LdapMessage) {
            let _ = self.stream.write_all(&encode_message(msg)).await;
            let _ = self.stream.flush().await;
        }
    }

    async fn connected_pair() -> (LdapConnection, StubPeer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ConnectionConfig::new(format!("ldap://127.0.0.1:{port}"));
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = LdapConnection::connect(config).await.unwrap();
        let stream = accept.await.unwrap();
        (
            conn,
            StubPeer {
                stream,
                buf: BytesMut::new(),
            },
        )
    }

    fn success() -> LdapResult {
        LdapResult::with_code(ResultCode::Success)
    }

    #[tokio::test]
    async fn message_ids_are_unique_and_all_pending() {
        let (conn, _peer) = connected_pair().await;
        let mut ids = Vec::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let handle = conn.delete(format!("cn=e{i},dc=example,dc=com")).await;
            ids.push(handle.message_id());
            handles.push(handle);
        }
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len(), "duplicate message ids: {ids:?}");
        assert_eq!(conn.pending_operations(), 8);
    }

    #[tokio::test]
    async fn responses_complete_out_of_order() {
        let (conn, mut peer) = connected_pair().await;
        let first = conn.delete("cn=a,dc=example,dc=com").await;
        let second = conn.delete("cn=b,dc=example,dc=com").await;
        let req1 = peer.read_message().await;
        let req2 = peer.read_message().await;
        assert!(matches!(req1.op, ProtocolOp::DelRequest(_)));
        // Answer the second request first.
        peer.send(&LdapMessage::new(
            req2.message_id,
            ProtocolOp::DelResponse(success()),
        ))
        .await;
        peer.send(&LdapMessage::new(
            req1.message_id,
            ProtocolOp::DelResponse(LdapResult::with_diagnostic(
                ResultCode::NoSuchObject,
                "entry not found",
            )),
        ))
        .await;
        let second_result = timeout(TICK, second.result()).await.unwrap().unwrap();
        assert_eq!(second_result.result_code, ResultCode::Success);
        match timeout(TICK, first.result()).await.unwrap() {
            Err(LdapError::ResultError(result)) => {
                assert_eq!(result.result_code, ResultCode::NoSuchObject);
            }
            other => panic!("expected server-signaled error, got {other:?}"),
        }
        // Per-operation failure does not close the connection.
        assert!(conn.closed_reason().is_none());
    }

    #[tokio::test]
    async fn bind_blocks_other_operations_without_round_trip() {
        let (conn, mut peer) = connected_pair().await;
        let conn = Arc::new(conn);
        let bind_conn = Arc::clone(&conn);
        let bind = tokio::spawn(async move {
            bind_conn.simple_bind("cn=admin,dc=example,dc=com", "secret").await
        });
        // Once the stub sees the bind request, the sequencer is set.
        let bind_req = peer.read_message().await;
        assert!(matches!(bind_req.op, ProtocolOp::BindRequest(_)));
        let rejected = conn.delete("cn=x,dc=example,dc=com").await;
        match timeout(TICK, rejected.result()).await.unwrap() {
            Err(LdapError::ResultError(result)) => {
                assert_eq!(result.result_code, ResultCode::OperationsError);
            }
            other => panic!("expected operations-error result, got {other:?}"),
        }
        // Now let the bind finish.
        peer.send(&LdapMessage::new(
            bind_req.message_id,
            ProtocolOp::BindResponse(BindResponse {
                result: success(),
                server_sasl_creds: None,
            }),
        ))
        .await;
        let bound = bind.await.unwrap().unwrap();
        assert_eq!(bound.result_code, ResultCode::Success);
        // The delete never reached the wire: the next message the stub sees
        // is a fresh one, not the rejected delete.
        let probe = conn.delete("cn=y,dc=example,dc=com").await;
        let next = peer.read_message().await;
        match next.op {
            ProtocolOp::DelRequest(req) => assert_eq!(req.entry, "cn=y,dc=example,dc=com"),
            other => panic!("expected the probe delete, got {other:?}"),
        }
        peer.send(&LdapMessage::new(
            next.message_id,
            ProtocolOp::DelResponse(success()),
        ))
        .await;
        timeout(TICK, probe.result()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_rejected_while_operations_pending() {
        let (conn, mut peer) = connected_pair().await;
        let _pending = conn.delete("cn=x,dc=example,dc=com").await;
        let _ = peer.read_message().await;
        match conn.simple_bind("cn=admin,dc=example,dc=com", "secret").await {
            Err(LdapError::InvalidState(msg)) => assert!(msg.contains("quiescent"), "{msg}"),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_drains_all_pending_and_replays_reason() {
        let (conn, mut peer) = connected_pair().await;
        let a = conn.delete("cn=a,dc=example,dc=com").await;
        let b = conn.add("cn=b,dc=example,dc=com", vec![]).await;
        let c = conn.compare("cn=c,dc=example,dc=com", "uid", "x").await;
        for _ in 0..3 {
            let _ = peer.read_message().await;
        }
        let drained_id = a.message_id();
        conn.close().await;
        for outcome in [
            timeout(TICK, a.result()).await.unwrap(),
            timeout(TICK, b.result()).await.unwrap(),
            timeout(TICK, c.result()).await.unwrap(),
        ] {
            match outcome {
                Err(LdapError::Closed(msg)) => assert!(msg.contains("local caller"), "{msg}"),
                other => panic!("expected Closed, got {other:?}"),
            }
        }
        assert_eq!(conn.pending_operations(), 0);
        // A late response for a drained id has nowhere to go and nothing
        // fails; a post-close send replays the same reason.
        peer.try_send(&LdapMessage::new(
            drained_id,
            ProtocolOp::DelResponse(success()),
        ))
        .await;
        let late = conn.delete("cn=late,dc=example,dc=com").await;
        match timeout(TICK, late.result()).await.unwrap() {
            Err(LdapError::Closed(msg)) => assert!(msg.contains("local caller"), "{msg}"),
            other => panic!("expected the replayed close reason, got {other:?}"),
        }
        // Close is single-flight: a second close does nothing.
        conn.close().await;
    }

    #[tokio::test]
    async fn close_sends_abandons_and_unbind() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        let delete_req = peer.read_message().await;
        assert_eq!(delete_req.message_id, pending.message_id());
        conn.close().await;
        let abandon = peer.read_message().await;
        match abandon.op {
            ProtocolOp::AbandonRequest(target) => assert_eq!(target, pending.message_id()),
            other => panic!("expected abandon, got {other:?}"),
        }
        let unbind = peer.read_message().await;
        assert!(matches!(unbind.op, ProtocolOp::UnbindRequest));
    }

    #[tokio::test]
    async fn multi_step_sasl_bind_uses_one_message_id() {
        let (conn, mut peer) = connected_pair().await;
        let bind = {
            let exchange = Box::new(XorExchange::new(0x21, false));
            let conn = Arc::new(conn);
            let bind_conn = Arc::clone(&conn);
            tokio::spawn(async move { bind_conn.sasl_bind(exchange).await })
        };
        let leg1 = peer.read_message().await;
        let first_id = leg1.message_id;
        match &leg1.op {
            ProtocolOp::BindRequest(req) => match &req.authentication {
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => {
                    assert_eq!(mechanism, "X-XOR-TEST");
                    assert_eq!(credentials.as_deref(), Some(&[0x21u8][..]));
                }
                other => panic!("expected SASL auth, got {other:?}"),
            },
            other => panic!("expected bind request, got {other:?}"),
        }
        peer.send(&LdapMessage::new(
            first_id,
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::with_code(ResultCode::SaslBindInProgress),
                server_sasl_creds: Some(b"abc".to_vec()),
            }),
        ))
        .await;
        let leg2 = peer.read_message().await;
        assert_eq!(leg2.message_id, first_id, "follow-up leg must reuse the id");
        match &leg2.op {
            ProtocolOp::BindRequest(req) => match &req.authentication {
                BindAuthentication::Sasl { credentials, .. } => {
                    let expected: Vec<u8> = b"abc".iter().map(|b| b ^ 0x21).collect();
                    assert_eq!(credentials.as_deref(), Some(&expected[..]));
                }
                other => panic!("expected SASL auth, got {other:?}"),
            },
            other => panic!("expected bind request, got {other:?}"),
        }
        peer.send(&LdapMessage::new(
            first_id,
            ProtocolOp::BindResponse(BindResponse {
                result: success(),
                server_sasl_creds: None,
            }),
        ))
        .await;
        let result = timeout(TICK, bind).await.unwrap().unwrap().unwrap();
        assert_eq!(result.result_code, ResultCode::Success);
    }

    #[tokio::test]
    async fn search_streams_entries_before_done() {
        let (conn, mut peer) = connected_pair().await;
        let request = SearchRequest {
            base_object: "dc=example,dc=com".to_string(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::match_all(),
            attributes: vec![],
        };
        let handle = conn.search(request.clone()).await;
        let wire_req = peer.read_message().await;
        match wire_req.op {
            ProtocolOp::SearchRequest(req) => assert_eq!(req, request),
            other => panic!("expected search request, got {other:?}"),
        }
        let id = wire_req.message_id;
        for name in ["cn=a,dc=example,dc=com", "cn=b,dc=example,dc=com"] {
            peer.send(&LdapMessage::new(
                id,
                ProtocolOp::SearchResultEntry(SearchResultEntry {
                    object_name: name.to_string(),
                    attributes: vec![Attribute::new("cn", vec![b"x".to_vec()])],
                }),
            ))
            .await;
        }
        peer.send(&LdapMessage::new(
            id,
            ProtocolOp::SearchResultReference(SearchResultReference {
                uris: vec!["ldap://other/".to_string()],
            }),
        ))
        .await;
        peer.send(&LdapMessage::new(id, ProtocolOp::SearchResultDone(success())))
            .await;
        let (entries, outcome) = timeout(TICK, handle.collect()).await.unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].object_name, "cn=a,dc=example,dc=com");
        assert_eq!(outcome.entry_count, 2);
        assert_eq!(outcome.reference_count, 1);
        assert_eq!(outcome.result.result_code, ResultCode::Success);
    }

    #[tokio::test]
    async fn unsolicited_disconnect_closes_without_table_lookup() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        let _ = peer.read_message().await;
        peer.send(&LdapMessage::new(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::with_diagnostic(
                    ResultCode::Unavailable,
                    "shutting down for maintenance",
                ),
                response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                response_value: None,
            }),
        ))
        .await;
        match timeout(TICK, pending.result()).await.unwrap() {
            Err(LdapError::Disconnected(result)) => {
                assert_eq!(result.result_code, ResultCode::Unavailable);
                assert_eq!(result.diagnostic_message, "shutting down for maintenance");
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        match conn.closed_reason() {
            Some(LdapError::Disconnected(_)) => {}
            other => panic!("expected Disconnected close reason, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_kind_mismatch_is_fatal() {
        let (conn, mut peer) = connected_pair().await;
        let victim = conn.delete("cn=a,dc=example,dc=com").await;
        let bystander = conn.compare("cn=b,dc=example,dc=com", "uid", "x").await;
        let _ = peer.read_message().await;
        let _ = peer.read_message().await;
        // An add response for an entry registered as a delete.
        peer.send(&LdapMessage::new(
            victim.message_id(),
            ProtocolOp::AddResponse(success()),
        ))
        .await;
        match timeout(TICK, victim.result()).await.unwrap() {
            Err(LdapError::KindMismatch { expected, got, .. }) => {
                assert_eq!(expected, "delete");
                assert_eq!(got, "add");
            }
            other => panic!("expected KindMismatch, got {other:?}"),
        }
        // Stream desynchronization is fatal: the bystander drains with the
        // same mismatch reason.
        match timeout(TICK, bystander.result()).await.unwrap() {
            Err(LdapError::KindMismatch { .. }) => {}
            other => panic!("expected drained KindMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_is_tolerated_and_stream_continues() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        let req = peer.read_message().await;
        // A structurally valid frame with an operation tag outside the set.
        let mut w = BerWriter::new();
        let pos = w.begin(BER_TAG_SEQUENCE);
        w.write_integer(99);
        w.write_tagged(0x4B, &[0x01, 0x02]);
        w.end(pos);
        peer.send_raw(&w.into_vec()).await;
        // The real response still lands.
        peer.send(&LdapMessage::new(
            req.message_id,
            ProtocolOp::DelResponse(success()),
        ))
        .await;
        let result = timeout(TICK, pending.result()).await.unwrap().unwrap();
        assert_eq!(result.result_code, ResultCode::Success);
        assert!(conn.closed_reason().is_none());
    }

    #[tokio::test]
    async fn malformed_known_tag_closes_connection() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        let _ = peer.read_message().await;
        // Bind response tag with a garbage body: fatal decode error.
        let mut w = BerWriter::new();
        let pos = w.begin(BER_TAG_SEQUENCE);
        w.write_integer(1);
        w.write_tagged(LDAP_TAG_BIND_RESPONSE, &[0xFF]);
        w.end(pos);
        peer.send_raw(&w.into_vec()).await;
        match timeout(TICK, pending.result()).await.unwrap() {
            Err(LdapError::Decode(_)) => {}
            other => panic!("expected Decode teardown, got {other:?}"),
        }
        assert!(matches!(
            conn.closed_reason(),
            Some(LdapError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn abandon_cancels_locally_and_notifies_peer() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        let id = pending.message_id();
        let _ = peer.read_message().await;
        conn.abandon(id).await;
        match timeout(TICK, pending.result()).await.unwrap() {
            Err(LdapError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        let wire = peer.read_message().await;
        match wire.op {
            ProtocolOp::AbandonRequest(target) => assert_eq!(target, id),
            other => panic!("expected abandon on the wire, got {other:?}"),
        }
        // The peer may still answer; the late response is dropped silently.
        peer.send(&LdapMessage::new(id, ProtocolOp::DelResponse(success())))
            .await;
        let probe = conn.delete("cn=b,dc=example,dc=com").await;
        let req = peer.read_message().await;
        peer.send(&LdapMessage::new(
            req.message_id,
            ProtocolOp::DelResponse(success()),
        ))
        .await;
        timeout(TICK, probe.result()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_is_a_wait_bound_not_an_abandon() {
        let (conn, mut peer) = connected_pair().await;
        let pending = conn.delete("cn=slow,dc=example,dc=com").await;
        let id = pending.message_id();
        let _ = peer.read_message().await;
        let waited = timeout(Duration::from_millis(50), pending.result()).await;
        assert!(waited.is_err(), "wait bound should elapse");
        // The operation is still pending and can still complete.
        assert_eq!(conn.pending_operations(), 1);
        peer.send(&LdapMessage::new(id, ProtocolOp::DelResponse(success())))
            .await;
        let deadline = tokio::time::Instant::now() + TICK;
        while conn.pending_operations() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "completion never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn who_am_i_round_trip() {
        let (conn, mut peer) = connected_pair().await;
        let conn = Arc::new(conn);
        let who_conn = Arc::clone(&conn);
        let who = tokio::spawn(async move { who_conn.who_am_i().await });
        let req = peer.read_message().await;
        match &req.op {
            ProtocolOp::ExtendedRequest(ext) => assert_eq!(ext.request_name, WHO_AM_I_OID),
            other => panic!("expected extended request, got {other:?}"),
        }
        peer.send(&LdapMessage::new(
            req.message_id,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: success(),
                response_name: None,
                response_value: Some(b"dn:cn=admin,dc=example,dc=com".to_vec()),
            }),
        ))
        .await;
        let identity = timeout(TICK, who).await.unwrap().unwrap().unwrap();
        assert_eq!(identity.as_deref(), Some("dn:cn=admin,dc=example,dc=com"));
    }

    #[tokio::test]
    async fn message_id_allocator_wraps_and_skips_pending() {
        let (io_tx, _io_rx) = mpsc::unbounded_channel();
        let core = ConnCore {
            pending: PendingTable::new(),
            stats: ConnectionStats::new(),
            next_message_id: AtomicI32::new(i32::MAX),
            gate: Mutex::new(SendGate {
                closed: None,
                sequencing: None,
                tls_installed: false,
                sasl_installed: false,
            }),
            io_tx,
            server_host: "test".to_string(),
            max_sasl_buffer: 1024,
        };
        assert_eq!(core.allocate_message_id(), i32::MAX);
        // Past the maximum, allocation restarts at 1.
        assert_eq!(core.allocate_message_id(), 1);
        // Ids still pending after a wrap are skipped, never reused.
        let _rx = core.pending.register(2, ResponseKind::Add);
        assert_eq!(core.allocate_message_id(), 3);
    }

    #[tokio::test]
    async fn security_layer_reports_none_without_upgrades() {
        let (conn, _peer) = connected_pair().await;
        assert_eq!(conn.security_layer(), SecurityLayerKind::None);
    }

    #[tokio::test]
    async fn peer_eof_drains_with_io_reason() {
        let (conn, peer) = connected_pair().await;
        let pending = conn.delete("cn=a,dc=example,dc=com").await;
        drop(peer);
        match timeout(TICK, pending.result()).await.unwrap() {
            Err(LdapError::Io { .. }) => {}
            other => panic!("expected Io teardown, got {other:?}"),
        }
        assert!(matches!(conn.closed_reason(), Some(LdapError::Io { .. })));
    }
}
