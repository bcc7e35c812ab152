use crate::prelude::*;

use gzdap_protocol::{LogLevel, ProtocolMessage, ProtocolMessageType};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn level_filter(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Silent => log::LevelFilter::Off,
        LogLevel::Trace => log::LevelFilter::Trace,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Error => log::LevelFilter::Error,
    }
}

pub fn log_level(level: LogLevel) -> Option<log::Level> {
    level_filter(level).to_level()
}

/// Combined console+file sink behind the `log` facade.  Console output goes
/// to stderr: stdout belongs to the DAP channel when running in stdio mode.
struct ProxyLogger {
    console_level: log::LevelFilter,
    file_level: log::LevelFilter,
    file: Option<Mutex<fs::File>>,
}

impl log::Log for ProxyLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.console_level.max(self.file_level)
    }

    fn log(&self, record: &log::Record) {
        let line = format!(
            "{} {:5} [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        if record.level() <= self.console_level {
            eprintln!("{}", line);
        }
        if record.level() <= self.file_level {
            if let Some(file) = &self.file {
                let mut file = file.lock().unwrap();
                log_errors!(writeln!(file, "{}", line));
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            log_errors!(file.lock().unwrap().flush());
        }
    }
}

fn log_file_path(log_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d__%H-%M-%S");
    log_dir.join(format!("gzdap-{}.log", stamp))
}

/// Install the global logger.  `file_level` of `Silent` turns file logging
/// off entirely and the log directory is left untouched.
pub fn init(console_level: LogLevel, file_level: LogLevel, log_dir: &Path) -> Result<(), Error> {
    let console_level = level_filter(console_level);
    let file_level = level_filter(file_level);
    let file = if file_level == log::LevelFilter::Off {
        None
    } else {
        fs::create_dir_all(log_dir)?;
        Some(Mutex::new(fs::File::create(log_file_path(log_dir))?))
    };
    log::set_boxed_logger(Box::new(ProxyLogger {
        console_level,
        file_level,
        file,
    }))?;
    log::set_max_level(console_level.max(file_level));
    Ok(())
}

/// The four directions a message can travel through the proxy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    ClientToProxy,
    ProxyToClient,
    ServerToProxy,
    ProxyToServer,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::ClientToProxy => "---CLIENT->PROXY:",
            Direction::ProxyToClient => "***PROXY->CLIENT:",
            Direction::ServerToProxy => "---SERVER->PROXY:",
            Direction::ProxyToServer => "***PROXY->SERVER:",
        }
    }
}

/// Message log sink with one configured level per direction.
pub struct MessageLog {
    client_to_proxy: Option<log::Level>,
    proxy_to_client: Option<log::Level>,
    server_to_proxy: Option<log::Level>,
    proxy_to_server: Option<log::Level>,
}

impl MessageLog {
    pub fn new(
        client_to_proxy: LogLevel,
        proxy_to_client: LogLevel,
        server_to_proxy: LogLevel,
        proxy_to_server: LogLevel,
    ) -> MessageLog {
        MessageLog {
            client_to_proxy: log_level(client_to_proxy),
            proxy_to_client: log_level(proxy_to_client),
            server_to_proxy: log_level(server_to_proxy),
            proxy_to_server: log_level(proxy_to_server),
        }
    }

    fn level_for(&self, direction: Direction) -> Option<log::Level> {
        match direction {
            Direction::ClientToProxy => self.client_to_proxy,
            Direction::ProxyToClient => self.proxy_to_client,
            Direction::ServerToProxy => self.server_to_proxy,
            Direction::ProxyToServer => self.proxy_to_server,
        }
    }

    pub fn log_message(&self, direction: Direction, message: &ProtocolMessage) {
        // Failed responses heading back to the client are always worth a warning.
        let level = match &message.type_ {
            ProtocolMessageType::Response(response)
                if !response.success && direction == Direction::ProxyToClient =>
            {
                Some(log::Level::Warn)
            }
            _ => self.level_for(direction),
        };
        let Some(level) = level else {
            return;
        };
        let label = match &message.type_ {
            ProtocolMessageType::Request(request) => format!("request={}", request.command),
            ProtocolMessageType::Response(response) => format!("response={}", response.command),
            ProtocolMessageType::Event(event) => format!("event={}", event.event),
        };
        let body = serde_json::to_string(message).unwrap_or_else(|err| err.to_string());
        log::log!(level, "{} {} {}", direction.tag(), label, body);
    }
}
