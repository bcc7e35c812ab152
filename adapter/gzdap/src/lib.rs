use crate::prelude::*;

use crate::cancellation::CancellationSource;
use crate::dap_codec::DAPCodec;
use crate::file_search::{is_archive_file, WorkspaceScanner};
use crate::launcher::{build_launch_command, DebugLauncher, DebugLaunchState, LaunchCommand};
use crate::proxy_session::{DAPChannel, ProxySession, SessionOptions};
use crate::source_map::{ProjectItem, SourceResolver};
use clap::ArgMatches;
use gzdap_protocol::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder as _;

#[allow(unused_imports)]
mod prelude {
    pub use crate::error::{as_user_error, Blame, BlamedError, Error};
    pub use log::{debug, error, info, warn};
}

#[macro_use]
mod error;
mod cancellation;
mod dap_codec;
mod file_search;
mod fsutil;
mod launcher;
mod logging;
mod proxy_session;
mod source_map;
mod stdio_stream;

pub use crate::error::{Blame, BlamedError, Error};

const ATTACH_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

pub fn debug_server(matches: &ArgMatches) -> Result<i32, Error> {
    let settings: ProxySettings = match matches.get_one::<String>("settings") {
        Some(settings) => serde_json::from_str(settings)
            .map_err(|err| as_user_error(format!("Could not parse launch configuration: {}", err)))?,
        None => bail!(as_user_error("The --settings argument is required.")),
    };

    let log_dir = match &settings.log_directory {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir().unwrap_or_else(|| ".".into()).join(".gzdap").join("logs"),
    };
    logging::init(
        settings.console_log_level.unwrap_or(LogLevel::Info),
        settings.file_log_level.unwrap_or(LogLevel::Trace),
        &log_dir,
    )?;
    info!("Started.");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let exit_code = rt.block_on(run_proxy(matches, settings))?;

    rt.shutdown_timeout(Duration::from_millis(10));
    debug!("Exiting with code {}", exit_code);
    Ok(exit_code)
}

async fn run_proxy(matches: &ArgMatches, settings: ProxySettings) -> Result<i32, Error> {
    let port = settings.port.unwrap_or(DEFAULT_PORT);
    let mut launcher = DebugLauncher::new();
    let supervised = settings.request == SessionKind::Launch;

    // User cancellation (Ctrl-C) interrupts the polling waits below.
    let cancel_source = CancellationSource::new();
    let cancel = cancel_source.cancellation_token();
    tokio::spawn(async move {
        log_errors!(tokio::signal::ctrl_c().await);
        cancel_source.request_cancellation();
    });

    let mut fallback_cwd = None;
    match settings.request {
        SessionKind::Launch => {
            let command = launch_command_from_settings(&settings, port)?;
            info!("Waiting for gzdoom to start...");
            let state = launcher.launch(&command, port, &cancel).await;
            if state == DebugLaunchState::Cancelled {
                return Ok(0);
            }
            if let Some(message) = state.user_message() {
                error!("{}", message);
                bail!(as_user_error("'gzdoom' failed to launch."));
            }
        }
        SessionKind::Attach => {
            if !launcher.wait_for_port(port, Duration::from_secs(1), || true).await {
                info!("Make sure that gzdoom is running and is either in-game or at the main menu.");
                let token = cancel.clone();
                if !launcher
                    .wait_for_port(port, ATTACH_WAIT_TIMEOUT, move || !token.is_cancelled())
                    .await
                {
                    bail!(as_user_error(
                        "Could not find a running gzdoom instance with an open debug port."
                    ));
                }
            }
            // Recover the command line of the running instance so the project
            // archives resolve the same way they would on a launch.
            if let Some(command) = launcher.get_launch_command_from_running_process(port).await {
                info!("Attaching to: {} {}", command.command, command.args.join(" "));
                fallback_cwd = command.cwd;
            }
        }
    }

    let projects = resolve_projects(&settings, fallback_cwd.as_deref())?;
    let resolver = SourceResolver::new(projects, GZDOOM_DAP_LOCALE);

    let client: Box<dyn DAPChannel> = if let Some(listen_port) = matches.get_one::<u16>("port") {
        let listener = TcpListener::bind(("127.0.0.1", *listen_port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Box::new(DAPCodec::new().framed(stream))
    } else if let Some(connect_port) = matches.get_one::<u16>("connect") {
        let stream = TcpStream::connect(("127.0.0.1", *connect_port)).await?;
        stream.set_nodelay(true)?;
        Box::new(DAPCodec::new().framed(stream))
    } else {
        debug!("Starting on stdio");
        Box::new(DAPCodec::new().framed(stdio_stream::StdioStream::new()))
    };

    let options = SessionOptions::from_settings(&settings, supervised);
    let session = ProxySession::new(options, resolver, launcher, Arc::new(WorkspaceScanner));
    Ok(session.run(client).await)
}

fn launch_command_from_settings(settings: &ProxySettings, port: u16) -> Result<LaunchCommand, Error> {
    let gzdoom_path = settings
        .gzdoom_path
        .as_deref()
        .ok_or_else(|| as_user_error("The \"gzdoomPath\" attribute is required for launch."))?;
    let iwad = settings
        .iwad
        .as_deref()
        .ok_or_else(|| as_user_error("The \"iwad\" attribute is required for launch."))?;

    let pwads: Vec<String> = resolve_project_archives(settings, None)?
        .into_iter()
        .map(|(_, archive)| archive)
        .collect();
    for pwad in &pwads {
        let path = Path::new(pwad);
        if !path.is_dir() && !path.is_file() {
            bail!(as_user_error(format!("Project archive path '{}' does not exist.", pwad)));
        }
    }

    Ok(build_launch_command(
        gzdoom_path,
        iwad,
        &pwads,
        port,
        settings.map.as_deref(),
        settings.config_path.as_deref(),
        settings.additional_args.as_deref(),
        settings.cwd.clone().map(PathBuf::from),
    ))
}

/// Expand the configured project list to (root, absolute archive path) pairs.
/// String entries are shorthand for a project whose archive is its own root.
fn resolve_project_archives(
    settings: &ProxySettings,
    fallback_cwd: Option<&Path>,
) -> Result<Vec<(PathBuf, String)>, Error> {
    let cwd = settings
        .cwd
        .clone()
        .map(PathBuf::from)
        .or_else(|| fallback_cwd.map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| ".".into());

    let mut resolved = vec![];
    for entry in &settings.projects {
        let (path, archive) = match entry {
            Either::First(path) => (path.clone(), path.clone()),
            Either::Second(project) => (
                project.path.clone(),
                project.archive.clone().unwrap_or_else(|| project.path.clone()),
            ),
        };
        let archive = if fsutil::is_absolute_path(&archive) {
            archive
        } else {
            cwd.join(&archive).to_string_lossy().into_owned()
        };
        resolved.push((PathBuf::from(path), archive));
    }
    if resolved.is_empty() {
        bail!(as_user_error("No project path provided."));
    }
    Ok(resolved)
}

/// Final project items for the resolver.  A file archive is identified by its
/// basename (the origin tag GZDoom reports for it); a directory project keeps
/// its full path.
fn resolve_projects(settings: &ProxySettings, fallback_cwd: Option<&Path>) -> Result<Vec<ProjectItem>, Error> {
    let resolved = resolve_project_archives(settings, fallback_cwd)?;
    Ok(resolved
        .into_iter()
        .map(|(root, archive)| {
            let archive_path = Path::new(&archive);
            let archive = if archive_path == root || !is_archive_file(archive_path) {
                archive.clone()
            } else {
                fsutil::basename(&archive).to_string()
            };
            ProjectItem { root, archive }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(json: &str) -> ProxySettings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_resolve_projects_string_shorthand() {
        let settings = settings(r#"{"request": "attach", "projects": ["/home/user/mymod"]}"#);
        let projects = resolve_projects(&settings, None).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].root, PathBuf::from("/home/user/mymod"));
        assert_eq!(projects[0].archive, "/home/user/mymod");
    }

    #[test]
    fn test_resolve_projects_file_archive_becomes_basename() {
        let settings = settings(
            r#"{"request": "attach", "projects": [{"path": "/home/user/mymod", "archive": "/built/mymod.pk3"}]}"#,
        );
        let projects = resolve_projects(&settings, None).unwrap();
        assert_eq!(projects[0].archive, "mymod.pk3");
    }

    #[test]
    fn test_resolve_projects_relative_archive_uses_cwd() {
        let settings = settings(
            r#"{"request": "attach", "cwd": "/game", "projects": [{"path": "/home/user/mymod", "archive": "mods/mymod.pk3"}]}"#,
        );
        let projects = resolve_projects(&settings, None).unwrap();
        // Absolutized against cwd, then reduced to the reported origin tag.
        assert_eq!(projects[0].archive, "mymod.pk3");
    }

    #[test]
    fn test_resolve_projects_empty_is_an_error() {
        let settings = settings(r#"{"request": "attach", "projects": []}"#);
        assert!(resolve_projects(&settings, None).is_err());
    }

    #[test]
    fn test_launch_command_requires_gzdoom_path() {
        let settings = settings(r#"{"request": "launch", "projects": ["/proj"]}"#);
        assert!(launch_command_from_settings(&settings, DEFAULT_PORT).is_err());
    }
}
