use crate::dap::*;
use serde_derive::*;
use serde_json::Value;

pub const DEFAULT_PORT: u16 = 19021;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProtocolMessage {
    pub seq: u32,
    #[serde(flatten)]
    pub type_: ProtocolMessageType,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ProtocolMessageType {
    #[serde(rename = "request")]
    Request(Request),
    #[serde(rename = "response")]
    Response(Response),
    #[serde(rename = "event")]
    Event(Event),
}

/// A request as it appears on the wire.  The proxy forwards most commands
/// untouched, so arguments stay as raw JSON here; they are parsed into the
/// typed structures of [`crate::dap`] at the single dispatch point that
/// matches on [`Command`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub request_seq: u32,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// The command vocabulary the proxy dispatches on.  Everything else is a
/// plain pass-through.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Initialize,
    Launch,
    Attach,
    SetBreakpoints,
    Source,
    StackTrace,
    Scopes,
    Disassemble,
    LoadedSources,
    Disconnect,
    Other,
}

impl Command {
    pub fn parse(command: &str) -> Command {
        match command {
            "initialize" => Command::Initialize,
            "launch" => Command::Launch,
            "attach" => Command::Attach,
            "setBreakpoints" => Command::SetBreakpoints,
            "source" => Command::Source,
            "stackTrace" => Command::StackTrace,
            "scopes" => Command::Scopes,
            "disassemble" => Command::Disassemble,
            "loadedSources" => Command::LoadedSources,
            "disconnect" => Command::Disconnect,
            _ => Command::Other,
        }
    }
}

/// Events the proxy rewrites before forwarding to the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Output,
    LoadedSource,
    Other,
}

impl EventKind {
    pub fn parse(event: &str) -> EventKind {
        match event {
            "output" => EventKind::Output,
            "loadedSource" => EventKind::LoadedSource,
            _ => EventKind::Other,
        }
    }
}

/// Client capabilities captured from the `initialize` request, with every
/// field the proxy relies on resolved to a concrete value.
#[derive(Debug, Clone)]
pub struct ClientCapabilities {
    pub adapter_id: String,
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
    pub paths_are_uris: bool,
    pub supports_variable_type: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        ClientCapabilities {
            adapter_id: "gzdap".into(),
            lines_start_at1: true,
            columns_start_at1: true,
            paths_are_uris: false,
            supports_variable_type: true,
        }
    }
}

impl ClientCapabilities {
    pub fn from_args(args: &InitializeRequestArguments) -> ClientCapabilities {
        let defaults = ClientCapabilities::default();
        ClientCapabilities {
            adapter_id: args.adapter_id.clone().unwrap_or(defaults.adapter_id),
            lines_start_at1: args.lines_start_at1.unwrap_or(defaults.lines_start_at1),
            columns_start_at1: args.columns_start_at1.unwrap_or(defaults.columns_start_at1),
            paths_are_uris: match &args.path_format {
                Some(format) => format == "uri",
                None => defaults.paths_are_uris,
            },
            supports_variable_type: args
                .supports_variable_type
                .unwrap_or(defaults.supports_variable_type),
        }
    }
}

/// Line/column/path conventions on the debuggee side of the proxy.
#[derive(Debug, Copy, Clone)]
pub struct DebuggerLocale {
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
    pub paths_are_uris: bool,
}

/// GZDoom's DAP server speaks 1-based lines and columns and plain paths.
pub const GZDOOM_DAP_LOCALE: DebuggerLocale = DebuggerLocale {
    lines_start_at1: true,
    columns_start_at1: true,
    paths_are_uris: false,
};

#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
#[serde(untagged)]
pub enum Either<T1, T2> {
    First(T1),
    Second(T2),
}

/// A configured source root.  `archive` is the origin tag GZDoom reports for
/// sources loaded from this root; when omitted it defaults to the root path.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Silent,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    Launch,
    Attach,
}

/// The configuration surface consumed by the proxy, normally passed on the
/// command line as `--settings <json>`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub request: SessionKind,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    pub projects: Vec<Either<String, ProjectEntry>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub gzdoom_path: Option<String>,
    #[serde(default)]
    pub iwad: Option<String>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub additional_args: Option<Vec<String>>,
    #[serde(default)]
    pub console_log_level: Option<LogLevel>,
    #[serde(default)]
    pub file_log_level: Option<LogLevel>,
    #[serde(default)]
    pub log_client_to_proxy: Option<LogLevel>,
    #[serde(default)]
    pub log_proxy_to_client: Option<LogLevel>,
    #[serde(default)]
    pub log_server_to_proxy: Option<LogLevel>,
    #[serde(default)]
    pub log_proxy_to_server: Option<LogLevel>,
    #[serde(default)]
    pub log_request_on_error_response: Option<bool>,
    /// Milliseconds allowed for the connection to the DAP server.
    #[serde(default)]
    pub connection_timeout: Option<u64>,
    #[serde(default)]
    pub log_directory: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! assert_matches(($e:expr, $p:pat) => { let e = $e; assert!(matches!(e, $p), "{:?} !~ {}", e, stringify!($p)) });

    fn parse(s: &[u8]) -> ProtocolMessage {
        serde_json::from_slice::<ProtocolMessage>(s).unwrap()
    }

    #[test]
    fn test_initialize() {
        let request = parse(br#"{"command":"initialize","arguments":{"clientID":"vscode","clientName":"Visual Studio Code","adapterID":"gzdoom","pathFormat":"path","linesStartAt1":true,"columnsStartAt1":true,"supportsVariableType":true,"locale":"en-us"},"type":"request","seq":1}"#);
        assert_matches!(
            &request,
            ProtocolMessage {
                seq: 1,
                type_: ProtocolMessageType::Request(..)
            }
        );
        let ProtocolMessageType::Request(request) = request.type_ else {
            unreachable!()
        };
        assert_eq!(Command::parse(&request.command), Command::Initialize);
        let args: InitializeRequestArguments =
            serde_json::from_value(request.arguments.unwrap()).unwrap();
        assert_eq!(args.adapter_id.as_deref(), Some("gzdoom"));
        assert_eq!(args.path_format.as_deref(), Some("path"));
    }

    #[test]
    fn test_response() {
        let response = parse(
            br#"{"seq":3,"request_seq":2,"command":"launch","body":null,"type":"response","success":true}"#,
        );
        assert_matches!(
            response,
            ProtocolMessage {
                seq: 3,
                type_: ProtocolMessageType::Response(Response {
                    request_seq: 2,
                    success: true,
                    ..
                })
            }
        );
    }

    #[test]
    fn test_event() {
        let event = parse(br#"{"type":"event","event":"initialized","seq":0}"#);
        assert_matches!(
            &event,
            ProtocolMessage {
                seq: 0,
                type_: ProtocolMessageType::Event(..)
            }
        );

        let event =
            parse(br#"{"body":{"reason":"started","threadId":7537},"type":"event","event":"thread","seq":0}"#);
        let ProtocolMessageType::Event(event) = event.type_ else {
            unreachable!()
        };
        assert_eq!(EventKind::parse(&event.event), EventKind::Other);
    }

    #[test]
    fn test_unknown_command_roundtrip() {
        // Pass-through commands must survive re-serialization unchanged.
        let raw = br#"{"command":"customGzdoomThing","arguments":{"foo":[1,2,3]},"type":"request","seq":12}"#;
        let message = parse(raw);
        let ProtocolMessageType::Request(ref request) = message.type_ else {
            panic!("not a request");
        };
        assert_eq!(Command::parse(&request.command), Command::Other);
        let reserialized = serde_json::to_value(&message).unwrap();
        let original: Value = serde_json::from_slice(raw).unwrap();
        assert_eq!(reserialized, original);
    }

    #[test]
    fn test_source_bearing_request_arguments() {
        let args: SetBreakpointsArguments = serde_json::from_str(
            r#"{"source":{"path":"src/a.zs","origin":"/proj"},"breakpoints":[{"line":3}],"sourceModified":false}"#,
        )
        .unwrap();
        assert_eq!(args.source.path.as_deref(), Some("src/a.zs"));
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["breakpoints"][0]["line"], 3);
        assert_eq!(value["sourceModified"], false);

        let args: SourceArguments =
            serde_json::from_str(r#"{"source":{"sourceReference":7},"sourceReference":7}"#).unwrap();
        assert_eq!(args.source_reference, 7);
        assert_eq!(args.source.unwrap().source_reference, Some(7));
    }

    #[test]
    fn test_source_preserves_unknown_fields() {
        let source: Source = serde_json::from_str(
            r#"{"name":"a.zs","path":"src/a.zs","origin":"/proj","checksums":[{"algorithm":"MD5","checksum":"xx"}]}"#,
        )
        .unwrap();
        assert_eq!(source.origin.as_deref(), Some("/proj"));
        let value = serde_json::to_value(&source).unwrap();
        assert!(value.get("checksums").is_some());
    }

    #[test]
    fn test_client_capabilities_defaults() {
        let args: InitializeRequestArguments = serde_json::from_str(r#"{}"#).unwrap();
        let caps = ClientCapabilities::from_args(&args);
        assert!(caps.lines_start_at1);
        assert!(caps.columns_start_at1);
        assert!(!caps.paths_are_uris);
        assert_eq!(caps.adapter_id, "gzdap");

        let args: InitializeRequestArguments =
            serde_json::from_str(r#"{"pathFormat":"uri","linesStartAt1":false}"#).unwrap();
        let caps = ClientCapabilities::from_args(&args);
        assert!(caps.paths_are_uris);
        assert!(!caps.lines_start_at1);
    }

    #[test]
    fn test_settings() {
        let settings: ProxySettings = serde_json::from_str(
            r#"{
                "request": "launch",
                "port": 19021,
                "projects": ["/home/user/mod", {"path": "/home/user/lib", "archive": "lib.pk3"}],
                "gzdoomPath": "/usr/bin/gzdoom",
                "iwad": "doom2.wad",
                "consoleLogLevel": "debug"
            }"#,
        )
        .unwrap();
        assert_matches!(settings.request, SessionKind::Launch);
        assert_eq!(settings.projects.len(), 2);
        assert_matches!(&settings.projects[0], Either::First(_));
        assert_matches!(&settings.projects[1], Either::Second(_));
        assert_matches!(settings.console_log_level, Some(LogLevel::Debug));
    }
}
