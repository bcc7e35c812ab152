use crate::prelude::*;

use crate::dap_codec::{DAPCodec, DecoderResult};
use crate::file_search::{scan_projects, FileSearch};
use crate::launcher::DebugLauncher;
use crate::logging::{Direction, MessageLog};
use crate::source_map::SourceResolver;
use futures::prelude::*;
use gzdap_protocol::*;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder as _;

pub trait DAPChannel:
    Stream<Item = Result<DecoderResult, io::Error>> + Sink<ProtocolMessage, Error = io::Error> + Send
{
}

impl<T> DAPChannel for T where
    T: Stream<Item = Result<DecoderResult, io::Error>> + Sink<ProtocolMessage, Error = io::Error> + Send
{
}

type Channel = Pin<Box<dyn DAPChannel>>;

/// GZDoom answers most requests promptly; the generous default mostly guards
/// against requests the server silently ignores.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1000);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// The engine drops idle debug connections after about 20 seconds, so we
/// must give up well before that.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(12000);

/// What to do with a server response once it is matched to its request.
/// Matched exhaustively in one place; everything the proxy does not rewrite
/// is a plain forward.
#[derive(Debug, Copy, Clone)]
enum ResponseHandler {
    Forward,
    SetBreakpoints,
    StackTrace,
    Scopes,
    Disassemble,
    LoadedSources,
    Disconnect,
}

struct PendingRequest {
    request: Request,
    handler: ResponseHandler,
    suppress_response_log: bool,
}

enum LoopEvent {
    FromClient(Option<Result<DecoderResult, io::Error>>),
    FromServer(Option<Result<DecoderResult, io::Error>>),
    Connected(Result<TcpStream, String>),
    ScanDone(Vec<(String, usize)>),
    RequestTimeout(u32),
}

/// One proxied debug session: a DAP channel to the client, a socket to the
/// game, and the supervised game process.  All protocol state is owned here
/// and touched only from the single event loop.
pub struct ProxySession {
    resolver: SourceResolver,
    launcher: DebugLauncher,
    file_search: Arc<dyn FileSearch>,
    msg_log: MessageLog,
    log_request_on_error: bool,
    supervised: bool,
    host: String,
    port: u16,
    connection_timeout: Duration,
    request_timeout: Duration,
    disconnect_timeout: Duration,

    pending_requests: HashMap<u32, PendingRequest>,
    timeout_tx: mpsc::Sender<u32>,
    timeout_rx: Option<mpsc::Receiver<u32>>,
    server_queue: Vec<ProtocolMessage>,
    connected: bool,
    scan_done: bool,
    launch_request_sent: bool,
    deferred_launch: Option<ProtocolMessage>,
    deferred_requests: Vec<ProtocolMessage>,
    next_client_seq: u32,
    terminated: bool,
    exit_code: i32,
}

pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub connection_timeout: Duration,
    pub log_request_on_error: bool,
    pub msg_log: MessageLog,
    pub supervised: bool,
}

impl SessionOptions {
    pub fn from_settings(settings: &ProxySettings, supervised: bool) -> SessionOptions {
        SessionOptions {
            host: settings.host.clone().unwrap_or_else(|| "localhost".into()),
            port: settings.port.unwrap_or(DEFAULT_PORT),
            connection_timeout: settings
                .connection_timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            log_request_on_error: settings.log_request_on_error_response.unwrap_or(true),
            msg_log: MessageLog::new(
                settings.log_client_to_proxy.unwrap_or(LogLevel::Info),
                settings.log_proxy_to_client.unwrap_or(LogLevel::Trace),
                settings.log_server_to_proxy.unwrap_or(LogLevel::Info),
                settings.log_proxy_to_server.unwrap_or(LogLevel::Trace),
            ),
            supervised,
        }
    }
}

impl ProxySession {
    pub fn new(
        options: SessionOptions,
        resolver: SourceResolver,
        launcher: DebugLauncher,
        file_search: Arc<dyn FileSearch>,
    ) -> ProxySession {
        let (timeout_tx, timeout_rx) = mpsc::channel(100);
        ProxySession {
            resolver,
            launcher,
            file_search,
            msg_log: options.msg_log,
            log_request_on_error: options.log_request_on_error,
            supervised: options.supervised,
            host: options.host,
            port: options.port,
            connection_timeout: options.connection_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            disconnect_timeout: DISCONNECT_TIMEOUT,

            pending_requests: HashMap::new(),
            timeout_tx,
            timeout_rx: Some(timeout_rx),
            server_queue: vec![],
            connected: false,
            scan_done: false,
            launch_request_sent: false,
            deferred_launch: None,
            deferred_requests: vec![],
            next_client_seq: 0,
            terminated: false,
            exit_code: 0,
        }
    }

    /// Run the session to completion.  Returns the process exit code.
    pub async fn run(mut self, client: Box<dyn DAPChannel>) -> i32 {
        let mut client: Channel = client.into();
        let mut server: Option<Channel> = None;

        // One-time project scan, off the event loop.
        let (scan_tx, scan_rx) = oneshot::channel();
        let projects = self.resolver.projects().to_vec();
        let search = self.file_search.clone();
        tokio::task::spawn_blocking(move || {
            let _ = scan_tx.send(scan_projects(&*search, &projects));
        });
        let mut scan_rx = Some(scan_rx);

        // Server connection, racing the connection timer.
        let (conn_tx, conn_rx) = oneshot::channel();
        let host = self.host.clone();
        let port = self.port;
        let connection_timeout = self.connection_timeout;
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(connection_timeout, TcpStream::connect((host.as_str(), port)))
                    .await;
            let _ = conn_tx.send(match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("timed out after {:?}", connection_timeout)),
            });
        });
        let mut conn_rx = Some(conn_rx);

        let mut timeout_rx = self.timeout_rx.take().unwrap();

        while !self.terminated {
            let event = tokio::select! {
                maybe = client.next() => LoopEvent::FromClient(maybe),
                maybe = async { server.as_mut().unwrap().next().await }, if server.is_some() =>
                    LoopEvent::FromServer(maybe),
                result = async { conn_rx.as_mut().unwrap().await }, if conn_rx.is_some() => {
                    conn_rx = None;
                    match result {
                        Ok(outcome) => LoopEvent::Connected(outcome),
                        Err(_) => LoopEvent::Connected(Err("connection task dropped".into())),
                    }
                }
                result = async { scan_rx.as_mut().unwrap().await }, if scan_rx.is_some() => {
                    scan_rx = None;
                    LoopEvent::ScanDone(result.unwrap_or_default())
                }
                Some(seq) = timeout_rx.recv() => LoopEvent::RequestTimeout(seq),
            };

            match event {
                LoopEvent::FromClient(Some(Ok(Ok(message)))) => {
                    self.handle_message_from_client(message, &mut server).await;
                }
                LoopEvent::FromClient(Some(Ok(Err(decode_error)))) => {
                    error!(
                        "Received invalid JSON message from client: {} (raw: {})",
                        decode_error.error,
                        String::from_utf8_lossy(&decode_error.raw)
                    );
                    // Answer with an error response if a request seq can be dug out.
                    if let Ok(value) = serde_json::from_slice::<Value>(&decode_error.raw) {
                        if let Some(seq) = value.get("seq").and_then(Value::as_u64) {
                            let command = value
                                .get("command")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            self.send_error_response(&mut client, seq as u32, &command, "Malformed message")
                                .await;
                        }
                    }
                }
                LoopEvent::FromClient(Some(Err(err))) => {
                    error!("Client channel error: {}", err);
                    self.stop(&mut client).await;
                    self.exit_code = 1;
                }
                LoopEvent::FromClient(None) => {
                    debug!("The client has disconnected");
                    self.terminated = true;
                }
                LoopEvent::FromServer(Some(Ok(Ok(message)))) => {
                    self.handle_message_from_server(message, &mut client).await;
                }
                LoopEvent::FromServer(Some(Ok(Err(decode_error)))) => {
                    error!(
                        "Received invalid JSON message from server: {} (raw: {})",
                        decode_error.error,
                        String::from_utf8_lossy(&decode_error.raw)
                    );
                }
                LoopEvent::FromServer(Some(Err(err))) => {
                    // A reset after a successful connection is a normal way
                    // for the game to go away.
                    debug!("Server channel error: {}", err);
                    self.emit_output(&mut client, "Connection reset.", "console").await;
                    self.stop(&mut client).await;
                }
                LoopEvent::FromServer(None) => {
                    self.emit_output(&mut client, "Connection closed.", "console").await;
                    self.stop(&mut client).await;
                }
                LoopEvent::Connected(Ok(stream)) => {
                    log_errors!(stream.set_nodelay(true));
                    info!("Connected to {}:{}", self.host, self.port);
                    server = Some(Box::pin(DAPCodec::new().framed(stream)));
                    self.connected = true;
                    self.flush_server_queue(&mut server).await;
                    self.try_send_deferred_launch(&mut server).await;
                }
                LoopEvent::Connected(Err(reason)) => {
                    error!("Connection to the DAP server failed: {}", reason);
                    self.emit_output(&mut client, "Cannot connect to the GZDoom DAP server!", "important")
                        .await;
                    self.stop(&mut client).await;
                    self.exit_code = 1;
                }
                LoopEvent::ScanDone(entries) => {
                    info!("Project scan found {} source files", entries.len());
                    self.resolver.install_index(entries);
                    self.scan_done = true;
                    self.try_send_deferred_launch(&mut server).await;
                }
                LoopEvent::RequestTimeout(seq) => {
                    self.handle_request_timeout(seq, &mut client).await;
                }
            }
        }

        if self.supervised {
            self.launcher.tear_down().await;
        }
        self.exit_code
    }

    fn next_seq(&mut self) -> u32 {
        self.next_client_seq += 1;
        self.next_client_seq
    }

    async fn send_to_client(&mut self, client: &mut Channel, message: ProtocolMessage, no_log: bool) {
        if !no_log {
            self.msg_log.log_message(Direction::ProxyToClient, &message);
        }
        log_errors!(client.send(message).await);
    }

    async fn send_to_server(&mut self, server: &mut Option<Channel>, message: ProtocolMessage) {
        match server {
            Some(server) => {
                self.msg_log.log_message(Direction::ProxyToServer, &message);
                log_errors!(server.send(message).await);
            }
            None => self.server_queue.push(message),
        }
    }

    async fn flush_server_queue(&mut self, server: &mut Option<Channel>) {
        for message in std::mem::take(&mut self.server_queue) {
            self.send_to_server(server, message).await;
        }
    }

    async fn emit_output(&mut self, client: &mut Channel, output: &str, category: &str) {
        let body = OutputEventBody {
            output: format!("{}\n", output),
            category: Some(category.to_string()),
            ..Default::default()
        };
        let message = ProtocolMessage {
            seq: self.next_seq(),
            type_: ProtocolMessageType::Event(Event {
                event: "output".into(),
                body: serde_json::to_value(body).ok(),
            }),
        };
        self.send_to_client(client, message, false).await;
    }

    /// Emit a `terminated` event and mark the session finished.
    async fn stop(&mut self, client: &mut Channel) {
        if !self.terminated {
            let message = ProtocolMessage {
                seq: self.next_seq(),
                type_: ProtocolMessageType::Event(Event {
                    event: "terminated".into(),
                    body: None,
                }),
            };
            self.send_to_client(client, message, false).await;
            self.terminated = true;
        }
    }

    async fn send_error_response(
        &mut self,
        client: &mut Channel,
        request_seq: u32,
        command: &str,
        format: &str,
    ) {
        error!(
            "***PROXY->CLIENT - Request '{}' (seq: {}) Failed: {}",
            command, request_seq, format
        );
        let error = ErrorMessage {
            id: 1104,
            format: format.to_string(),
            show_user: Some(true),
            send_telemetry: None,
        };
        let message = ProtocolMessage {
            seq: self.next_seq(),
            type_: ProtocolMessageType::Response(Response {
                request_seq,
                success: false,
                command: command.to_string(),
                message: Some(format.to_string()),
                body: Some(serde_json::json!({ "error": error })),
            }),
        };
        self.send_to_client(client, message, true).await;
    }

    async fn send_request_to_server(
        &mut self,
        server: &mut Option<Channel>,
        seq: u32,
        request: Request,
        timeout: Duration,
        handler: ResponseHandler,
        suppress_response_log: bool,
    ) {
        self.pending_requests.insert(
            seq,
            PendingRequest {
                request: request.clone(),
                handler,
                suppress_response_log,
            },
        );
        if !timeout.is_zero() {
            let timeout_tx = self.timeout_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timeout_tx.send(seq).await;
            });
        }
        self.send_to_server(
            server,
            ProtocolMessage {
                seq,
                type_: ProtocolMessageType::Request(request),
            },
        )
        .await;
    }

    async fn handle_message_from_client(&mut self, message: ProtocolMessage, server: &mut Option<Channel>) {
        self.msg_log.log_message(Direction::ClientToProxy, &message);
        match message.type_ {
            ProtocolMessageType::Request(request) => {
                self.handle_client_request(message.seq, request, server).await;
            }
            _ => self.send_to_server(server, message).await,
        }
    }

    async fn handle_client_request(&mut self, seq: u32, request: Request, server: &mut Option<Channel>) {
        match Command::parse(&request.command) {
            Command::Launch | Command::Attach => {
                let message = ProtocolMessage {
                    seq,
                    type_: ProtocolMessageType::Request(request),
                };
                if self.connected && self.scan_done {
                    self.send_launch(message, server).await;
                } else {
                    self.deferred_launch = Some(message);
                }
            }
            Command::Initialize => {
                let args = match &request.arguments {
                    Some(args) => serde_json::from_value(args.clone()).unwrap_or_default(),
                    None => InitializeRequestArguments::default(),
                };
                self.resolver
                    .set_client_capabilities(ClientCapabilities::from_args(&args));
                let timeout = self.request_timeout;
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Forward, false)
                    .await;
            }
            // Everything else waits its turn behind launch/attach, so the
            // server always sees the project sources first.
            _ if !self.launch_request_sent => {
                self.deferred_requests.push(ProtocolMessage {
                    seq,
                    type_: ProtocolMessageType::Request(request),
                });
            }
            _ => self.forward_client_request(seq, request, server).await,
        }
    }

    async fn forward_client_request(&mut self, seq: u32, mut request: Request, server: &mut Option<Channel>) {
        let timeout = self.request_timeout;
        match Command::parse(&request.command) {
            Command::SetBreakpoints => {
                self.rewrite_request_source(&mut request);
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::SetBreakpoints, false)
                    .await;
            }
            Command::Source => {
                self.rewrite_request_source(&mut request);
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Forward, false)
                    .await;
            }
            Command::StackTrace => {
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::StackTrace, false)
                    .await;
            }
            Command::Scopes => {
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Scopes, false)
                    .await;
            }
            Command::Disassemble => {
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Disassemble, false)
                    .await;
            }
            Command::LoadedSources => {
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::LoadedSources, false)
                    .await;
            }
            Command::Disconnect => {
                let timeout = self.disconnect_timeout;
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Disconnect, true)
                    .await;
            }
            // Launch, attach and initialize never come this way; anything
            // unrecognized is a plain pass-through.
            _ => {
                self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Forward, false)
                    .await;
            }
        }
    }

    /// Attach the converted project source list and forward the held
    /// launch/attach request, then release everything queued behind it.
    async fn send_launch(&mut self, message: ProtocolMessage, server: &mut Option<Channel>) {
        let ProtocolMessage { seq, type_: ProtocolMessageType::Request(mut request) } = message else {
            return;
        };
        let sources = self.resolver.project_sources();
        let arguments = request.arguments.get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(arguments) = arguments {
            match serde_json::to_value(&sources) {
                Ok(sources) => {
                    arguments.insert("projectSources".into(), sources);
                }
                Err(err) => error!("Could not serialize project sources: {}", err),
            }
        }
        let timeout = self.request_timeout;
        self.send_request_to_server(server, seq, request, timeout, ResponseHandler::Forward, false)
            .await;
        self.launch_request_sent = true;

        for message in std::mem::take(&mut self.deferred_requests) {
            if let ProtocolMessage { seq, type_: ProtocolMessageType::Request(request) } = message {
                self.forward_client_request(seq, request, server).await;
            }
        }
    }

    async fn try_send_deferred_launch(&mut self, server: &mut Option<Channel>) {
        if self.connected && self.scan_done {
            if let Some(message) = self.deferred_launch.take() {
                self.send_launch(message, server).await;
            }
        }
    }

    async fn handle_message_from_server(&mut self, message: ProtocolMessage, client: &mut Channel) {
        match message.type_ {
            ProtocolMessageType::Response(response) => {
                let pending = self.pending_requests.remove(&response.request_seq);
                let suppress = pending.as_ref().map(|p| p.suppress_response_log).unwrap_or(false);
                if !suppress {
                    let full = ProtocolMessage {
                        seq: message.seq,
                        type_: ProtocolMessageType::Response(response.clone()),
                    };
                    self.msg_log.log_message(Direction::ServerToProxy, &full);
                }
                match pending {
                    Some(pending) => {
                        self.handle_correlated_response(message.seq, response, pending, client).await;
                    }
                    None => {
                        // Defensive default: deliver information rather than drop it.
                        warn!(
                            "Received response with no pending request (request_seq={})",
                            response.request_seq
                        );
                        let message = ProtocolMessage {
                            seq: message.seq,
                            type_: ProtocolMessageType::Response(response),
                        };
                        self.send_to_client(client, message, false).await;
                    }
                }
            }
            ProtocolMessageType::Event(mut event) => {
                self.msg_log.log_message(
                    Direction::ServerToProxy,
                    &ProtocolMessage {
                        seq: message.seq,
                        type_: ProtocolMessageType::Event(event.clone()),
                    },
                );
                match EventKind::parse(&event.event) {
                    EventKind::Output => self.rewrite_output_event(&mut event),
                    EventKind::LoadedSource => self.rewrite_loaded_source_event(&mut event),
                    EventKind::Other => {}
                }
                let message = ProtocolMessage {
                    seq: message.seq,
                    type_: ProtocolMessageType::Event(event),
                };
                self.send_to_client(client, message, false).await;
            }
            ProtocolMessageType::Request(_) => {
                // Reverse request; not something GZDoom sends today, but the
                // client is the right place for it regardless.
                self.msg_log.log_message(Direction::ServerToProxy, &message);
                self.send_to_client(client, message, false).await;
            }
        }
    }

    async fn handle_correlated_response(
        &mut self,
        seq: u32,
        mut response: Response,
        pending: PendingRequest,
        client: &mut Channel,
    ) {
        if !response.success && self.log_request_on_error {
            warn!(
                "Request failed: {}",
                serde_json::to_string(&pending.request).unwrap_or_default()
            );
        }
        match pending.handler {
            ResponseHandler::Disconnect => {
                self.stop(client).await;
                return;
            }
            ResponseHandler::Forward => {}
            ResponseHandler::SetBreakpoints => {
                self.rewrite_response_body::<SetBreakpointsResponseBody>(&mut response, |resolver, body| {
                    for breakpoint in &mut body.breakpoints {
                        if let Some(source) = &mut breakpoint.source {
                            resolver.to_client_source(source);
                        }
                    }
                });
            }
            ResponseHandler::StackTrace => {
                self.rewrite_response_body::<StackTraceResponseBody>(&mut response, |resolver, body| {
                    for frame in &mut body.stack_frames {
                        if let Some(source) = &mut frame.source {
                            resolver.to_client_source(source);
                        }
                    }
                });
            }
            ResponseHandler::Scopes => {
                self.rewrite_response_body::<ScopesResponseBody>(&mut response, |resolver, body| {
                    for scope in &mut body.scopes {
                        if let Some(source) = &mut scope.source {
                            resolver.to_client_source(source);
                        }
                    }
                });
            }
            ResponseHandler::Disassemble => {
                self.rewrite_response_body::<DisassembleResponseBody>(&mut response, |resolver, body| {
                    for instruction in &mut body.instructions {
                        if let Some(location) = &mut instruction.location {
                            resolver.to_client_source(location);
                        }
                    }
                });
            }
            ResponseHandler::LoadedSources => {
                self.rewrite_response_body::<LoadedSourcesResponseBody>(&mut response, |resolver, body| {
                    for source in &mut body.sources {
                        resolver.to_client_source(source);
                    }
                });
            }
        }
        let message = ProtocolMessage {
            seq,
            type_: ProtocolMessageType::Response(response),
        };
        self.send_to_client(client, message, false).await;
    }

    /// A request timed out: synthesize the failure response and deliver it
    /// through the same handler path a real response would take.  If a real
    /// response won the race, the map entry is gone and this is a no-op.
    async fn handle_request_timeout(&mut self, seq: u32, client: &mut Channel) {
        let Some(pending) = self.pending_requests.remove(&seq) else {
            return;
        };
        warn!("Request '{}' (seq: {}) timed out", pending.request.command, seq);
        let response = Response {
            request_seq: seq,
            success: false,
            command: pending.request.command.clone(),
            message: Some("timeout".into()),
            body: None,
        };
        let message_seq = self.next_seq();
        self.handle_correlated_response(message_seq, response, pending, client).await;
    }

    fn rewrite_request_source(&mut self, request: &mut Request) {
        let Some(arguments) = &mut request.arguments else {
            return;
        };
        let Some(source_value) = arguments.get_mut("source") else {
            return;
        };
        match serde_json::from_value::<Source>(source_value.clone()) {
            Ok(mut source) => {
                self.resolver.to_debugger_source(&mut source);
                match serde_json::to_value(&source) {
                    Ok(rewritten) => *source_value = rewritten,
                    Err(err) => error!("Could not serialize source: {}", err),
                }
            }
            Err(err) => error!("Malformed source in '{}' request: {}", request.command, err),
        }
    }

    fn rewrite_response_body<T>(&mut self, response: &mut Response, rewrite: impl FnOnce(&mut SourceResolver, &mut T))
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let Some(body) = &mut response.body else {
            return;
        };
        match serde_json::from_value::<T>(body.clone()) {
            Ok(mut typed) => {
                rewrite(&mut self.resolver, &mut typed);
                match serde_json::to_value(&typed) {
                    Ok(rewritten) => *body = rewritten,
                    Err(err) => error!("Could not serialize '{}' response body: {}", response.command, err),
                }
            }
            Err(err) => {
                // Unexpected shape; forward what we got rather than nothing.
                error!("Malformed '{}' response body: {}", response.command, err);
            }
        }
    }

    // Game console output carries no trailing newline and may contain
    // in-band TEXTCOLOR escapes; make it presentable.
    fn rewrite_output_event(&mut self, event: &mut Event) {
        let Some(body) = &mut event.body else {
            return;
        };
        match serde_json::from_value::<OutputEventBody>(body.clone()) {
            Ok(mut output) => {
                output.output = strip_console_markup(&output.output);
                if !output.output.ends_with('\n') {
                    output.output.push('\n');
                }
                if let Ok(rewritten) = serde_json::to_value(&output) {
                    *body = rewritten;
                }
            }
            Err(err) => error!("Malformed output event body: {}", err),
        }
    }

    fn rewrite_loaded_source_event(&mut self, event: &mut Event) {
        let Some(body) = &mut event.body else {
            return;
        };
        match serde_json::from_value::<LoadedSourceEventBody>(body.clone()) {
            Ok(mut loaded) => {
                self.resolver.to_client_source(&mut loaded.source);
                if let Ok(rewritten) = serde_json::to_value(&loaded) {
                    *body = rewritten;
                }
            }
            Err(err) => error!("Malformed loadedSource event body: {}", err),
        }
    }
}

/// Remove GZDoom's `\x1c` color escapes: `\x1c` + single color letter, or
/// `\x1c[name]` for named colors.
fn strip_console_markup(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\x1c' {
            stripped.push(ch);
            continue;
        }
        match chars.next() {
            Some('[') => {
                for skipped in chars.by_ref() {
                    if skipped == ']' {
                        break;
                    }
                }
            }
            Some(_) | None => {}
        }
    }
    stripped
}
