use crate::prelude::*;

use crate::cancellation::CancellationToken;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

pub const GAME_NAME: &str = "gzdoom";

const TEARDOWN_SWEEPS: u32 = 5;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Terminal outcome of one launch/attach attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugLaunchState {
    Success,
    LauncherError { details: String },
    GameFailedToStart,
    GameExitedBeforeOpening,
    MultipleGamesRunning,
    Cancelled,
}

impl DebugLaunchState {
    /// User-facing failure message; None for success.
    pub fn user_message(&self) -> Option<String> {
        match self {
            DebugLaunchState::Success => None,
            DebugLaunchState::LauncherError { details } => Some(details.clone()),
            DebugLaunchState::GameFailedToStart => {
                Some("gzdoom did not start within the allotted time.".into())
            }
            DebugLaunchState::GameExitedBeforeOpening => {
                Some("gzdoom exited before the debug port opened.".into())
            }
            DebugLaunchState::MultipleGamesRunning => {
                Some("Multiple gzdoom instances are running, shut them down and try again.".into())
            }
            DebugLaunchState::Cancelled => Some("Launch cancelled.".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Supervises the debuggee process: spawns it (or finds an already-running
/// instance), waits for it to open the debug port, and tears it down.  One
/// instance per debug session, owned by the session.
pub struct DebugLauncher {
    game_name: String,
    child: Option<Child>,
    captured_output: Arc<Mutex<String>>,
    poll_interval: Duration,
    start_timeout: Duration,
    connect_timeout: Duration,
}

impl DebugLauncher {
    pub fn new() -> DebugLauncher {
        DebugLauncher::with_game(GAME_NAME)
    }

    pub fn with_game(game_name: &str) -> DebugLauncher {
        DebugLauncher {
            game_name: game_name.to_lowercase(),
            child: None,
            captured_output: Arc::new(Mutex::new(String::new())),
            poll_interval: Duration::from_millis(200),
            start_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(15),
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, poll: Duration, start: Duration, connect: Duration) -> DebugLauncher {
        self.poll_interval = poll;
        self.start_timeout = start;
        self.connect_timeout = connect;
        self
    }

    fn name_matches(&self, process_name: &str) -> bool {
        let name = process_name.strip_suffix(".exe").unwrap_or(process_name);
        name.eq_ignore_ascii_case(&self.game_name)
    }

    fn process_table() -> System {
        System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
    }

    pub fn game_pids(&self) -> Vec<u32> {
        let sys = DebugLauncher::process_table();
        let mut pids: Vec<u32> = sys
            .processes()
            .iter()
            .filter(|(_, process)| self.name_matches(process.name()))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn game_is_running(&self) -> bool {
        !self.game_pids().is_empty()
    }

    fn kill_pid(pid: u32, force: bool) {
        let sys = DebugLauncher::process_table();
        if let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) {
            let signal = if force { sysinfo::Signal::Kill } else { sysinfo::Signal::Term };
            if process.kill_with(signal).is_none() {
                // Signal not supported on this platform.
                process.kill();
            }
        }
    }

    /// Kill the spawned launcher process (if any is still attached), then
    /// sweep the process table for surviving game instances, escalating the
    /// signal after the first sweep.  Survivors after the final sweep are
    /// logged and left alone.  Calling this with nothing running is a no-op.
    pub async fn tear_down(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                DebugLauncher::kill_pid(pid, false);
            }
            match tokio::time::timeout(self.poll_interval.saturating_mul(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    log_errors!(child.start_kill());
                    let _ = child.wait().await;
                }
            }
        }

        let mut sweeps = 0;
        loop {
            let pids = self.game_pids();
            if pids.is_empty() {
                break;
            }
            if sweeps >= TEARDOWN_SWEEPS {
                error!(
                    "Failed to kill game process after {} sweeps: pids {:?}",
                    TEARDOWN_SWEEPS, pids
                );
                break;
            }
            for pid in &pids {
                DebugLauncher::kill_pid(*pid, sweeps > 0);
            }
            sweeps += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    // Nonzero exit of the launcher process; exit code 0 usually means it
    // forked the game and detached.
    fn launcher_failed(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                let output = self.captured_output.lock().unwrap();
                Some(format!(
                    "Launcher process exited with {}.\noutput: {}",
                    status, &*output
                ))
            }
            Ok(_) => None,
            Err(err) => Some(format!("Launcher process failed: {}", err)),
        }
    }

    fn capture_stream(
        &self,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        is_stderr: bool,
    ) {
        let captured = self.captured_output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_stderr {
                    error!("launcher: {}", line);
                } else {
                    info!("launcher: {}", line);
                }
                let mut captured = captured.lock().unwrap();
                captured.push_str(&line);
                captured.push('\n');
            }
        });
    }

    /// Run the launch command and wait for exactly one game process with an
    /// open debug port.  Always tears down leftovers from a previous attempt
    /// first.
    pub async fn launch(
        &mut self,
        command: &LaunchCommand,
        port_to_check: u16,
        cancel: &CancellationToken,
    ) -> DebugLaunchState {
        self.tear_down().await;

        info!("Launching: {} {}", command.command, command.args.join(" "));
        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return DebugLaunchState::LauncherError {
                    details: format!(
                        "Failed to start launcher process: {}\ncmd: {}\nargs: {}",
                        err,
                        command.command,
                        command.args.join(" ")
                    ),
                }
            }
        };
        self.captured_output = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            self.capture_stream(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture_stream(stderr, true);
        }
        self.child = Some(child);

        // Wait for the game process to appear.  The launcher may fork and
        // detach, so the spawned pid is not authoritative.
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                self.tear_down().await;
                return DebugLaunchState::Cancelled;
            }
            let pids = self.game_pids();
            if pids.len() > 1 {
                // Ambiguous which instance to manage; leave them alone.
                return DebugLaunchState::MultipleGamesRunning;
            }
            if pids.len() == 1 {
                break;
            }
            if let Some(details) = self.launcher_failed() {
                return DebugLaunchState::LauncherError { details };
            }
            if started.elapsed() > self.start_timeout {
                return DebugLaunchState::GameFailedToStart;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Game is up; wait for the debug port.
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return DebugLaunchState::Cancelled;
            }
            let pids = self.game_pids();
            if pids.len() > 1 {
                return DebugLaunchState::MultipleGamesRunning;
            }
            if pids.is_empty() {
                if let Some(details) = self.launcher_failed() {
                    return DebugLaunchState::LauncherError { details };
                }
                return DebugLaunchState::GameExitedBeforeOpening;
            }
            if port_open(port_to_check).await {
                return DebugLaunchState::Success;
            }
            if started.elapsed() > self.connect_timeout {
                return DebugLaunchState::GameFailedToStart;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until `port` accepts a connection, the timeout elapses, or the
    /// caller's predicate asks to stop.  The predicate runs once per interval.
    pub async fn wait_for_port(
        &self,
        port: u16,
        timeout: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> bool {
        let started = Instant::now();
        loop {
            if port_open(port).await {
                return true;
            }
            if started.elapsed() > timeout || !keep_waiting() {
                return false;
            }
            tokio::time::sleep(PORT_PROBE_TIMEOUT.min(timeout)).await;
        }
    }

    /// Attach-mode discovery: reconstruct the launch command of the game
    /// instance that should own `port`.  The process table carries no socket
    /// information, so the port only tells us whether anything is bound yet;
    /// the instance itself is found by executable name.
    pub async fn get_launch_command_from_running_process(&self, port: u16) -> Option<LaunchCommand> {
        if !port_open(port).await {
            debug!("Port {} is not open yet, falling back to a process-table lookup", port);
        }
        let sys = DebugLauncher::process_table();
        let mut matches: Vec<_> = sys
            .processes()
            .values()
            .filter(|process| self.name_matches(process.name()))
            .collect();
        matches.sort_by_key(|process| process.pid());
        if matches.is_empty() {
            return None;
        }
        if matches.len() > 1 {
            error!(
                "Found multiple {} processes running on port {}",
                self.game_name, port
            );
        }
        let process = matches[0];

        let mut argv: Vec<String> = process.cmd().to_vec();
        if argv.len() == 1 && argv[0].contains(' ') {
            // Some platforms report the command line as one unsplit string.
            argv = parse_command_line(&argv[0]);
        }
        if argv.is_empty() {
            argv = vec![process.exe()?.to_string_lossy().into_owned()];
        }
        Some(LaunchCommand {
            command: argv[0].clone(),
            args: argv[1..].to_vec(),
            cwd: process.cwd().map(|cwd| cwd.to_path_buf()),
        })
    }
}

/// Assemble the gzdoom command line for a launch configuration.
pub fn build_launch_command(
    gzdoom_path: &str,
    iwad: &str,
    pwads: &[String],
    debug_port: u16,
    map: Option<&str>,
    ini_path: Option<&str>,
    additional_args: Option<&[String]>,
    cwd: Option<PathBuf>,
) -> LaunchCommand {
    let mut args = vec![
        "-iwad".to_string(),
        iwad.to_string(),
        "-debug".to_string(),
        debug_port.to_string(),
    ];
    for pwad in pwads {
        args.push("-file".to_string());
        args.push(pwad.clone());
    }
    if let Some(ini_path) = ini_path {
        args.push("-config".to_string());
        args.push(ini_path.to_string());
    }
    if let Some(map) = map {
        args.push("+map".to_string());
        args.push(map.to_string());
    }
    if let Some(additional) = additional_args {
        args.extend_from_slice(additional);
    }
    LaunchCommand {
        command: gzdoom_path.to_string(),
        args,
        cwd,
    }
}

/// Split a command line on whitespace, respecting single- and double-quoted
/// spans.
pub fn parse_command_line(command_line: &str) -> Vec<String> {
    let mut argv = vec![];
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    for ch in command_line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    in_arg = true;
                }
                c if c.is_whitespace() => {
                    if in_arg || !current.is_empty() {
                        argv.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                other => {
                    current.push(other);
                    in_arg = true;
                }
            },
        }
    }
    if in_arg || !current.is_empty() {
        argv.push(current);
    }
    argv
}

async fn port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationSource;

    #[test]
    fn test_parse_command_line() {
        assert_eq!(
            parse_command_line("gzdoom -iwad doom2.wad"),
            vec!["gzdoom", "-iwad", "doom2.wad"]
        );
        assert_eq!(
            parse_command_line(r#""C:\Program Files\GZDoom\gzdoom.exe" -file "my mod.pk3""#),
            vec![r"C:\Program Files\GZDoom\gzdoom.exe", "-file", "my mod.pk3"]
        );
        assert_eq!(
            parse_command_line("gzdoom -file 'a b'c"),
            vec!["gzdoom", "-file", "a bc"]
        );
        assert_eq!(parse_command_line("  gzdoom  "), vec!["gzdoom"]);
        assert_eq!(parse_command_line("gzdoom -file ''"), vec!["gzdoom", "-file", ""]);
        assert_eq!(parse_command_line(""), Vec::<String>::new());
    }

    #[test]
    fn test_build_launch_command() {
        let command = build_launch_command(
            "/usr/bin/gzdoom",
            "doom2.wad",
            &["mod.pk3".to_string()],
            19021,
            Some("MAP01"),
            None,
            Some(&["+sv_cheats".to_string(), "1".to_string()]),
            None,
        );
        assert_eq!(command.command, "/usr/bin/gzdoom");
        assert_eq!(
            command.args,
            vec!["-iwad", "doom2.wad", "-debug", "19021", "-file", "mod.pk3", "+map", "MAP01", "+sv_cheats", "1"]
        );
    }

    #[tokio::test]
    async fn test_tear_down_idempotent() {
        // A game name that cannot exist: two tear-downs in a row are no-ops.
        let mut launcher = DebugLauncher::with_game("gzdap-no-such-game").with_timeouts(
            Duration::from_millis(20),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        launcher.tear_down().await;
        launcher.tear_down().await;
        assert!(!launcher.game_is_running());
    }

    #[tokio::test]
    async fn test_launch_spawn_failure() {
        let mut launcher = DebugLauncher::with_game("gzdap-no-such-game").with_timeouts(
            Duration::from_millis(20),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let command = LaunchCommand {
            command: "/nonexistent/binary".into(),
            args: vec![],
            cwd: None,
        };
        let cancel = CancellationSource::new();
        let state = launcher
            .launch(&command, 59121, &cancel.cancellation_token())
            .await;
        assert!(matches!(state, DebugLaunchState::LauncherError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_times_out_when_game_never_appears() {
        let mut launcher = DebugLauncher::with_game("gzdap-no-such-game").with_timeouts(
            Duration::from_millis(20),
            Duration::from_millis(300),
            Duration::from_millis(300),
        );
        let command = LaunchCommand {
            command: "sleep".into(),
            args: vec!["5".into()],
            cwd: None,
        };
        let cancel = CancellationSource::new();
        let started = Instant::now();
        let state = launcher
            .launch(&command, 59122, &cancel.cancellation_token())
            .await;
        let elapsed = started.elapsed();
        assert_eq!(state, DebugLaunchState::GameFailedToStart);
        assert!(elapsed >= Duration::from_millis(300), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "returned too late: {:?}", elapsed);
        launcher.tear_down().await;
    }

    #[tokio::test]
    async fn test_launch_cancelled() {
        let mut launcher = DebugLauncher::with_game("gzdap-no-such-game").with_timeouts(
            Duration::from_millis(20),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let source = CancellationSource::new();
        source.request_cancellation();
        let command = LaunchCommand {
            command: "sleep".into(),
            args: vec!["5".into()],
            cwd: None,
        };
        let state = launcher
            .launch(&command, 59123, &source.cancellation_token())
            .await;
        assert_eq!(state, DebugLaunchState::Cancelled);
        launcher.tear_down().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multiple_instances_short_circuits() {
        use std::os::unix::fs::PermissionsExt;

        // Two processes wearing the game's name: the launch must give up
        // without waiting out the port timeout.
        let sleep_bin = ["/bin/sleep", "/usr/bin/sleep"]
            .iter()
            .find(|p| std::path::Path::new(p).exists())
            .expect("no sleep binary");
        let dir = std::env::temp_dir().join(format!("gzdap-multi-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let fake_game = dir.join("gzdap-fake-game");
        std::fs::copy(sleep_bin, &fake_game).unwrap();
        std::fs::set_permissions(&fake_game, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut launcher = DebugLauncher::with_game("gzdap-fake-game").with_timeouts(
            Duration::from_millis(50),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let script = format!("'{0}' 10 & exec '{0}' 10", fake_game.display());
        let command = LaunchCommand {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            cwd: None,
        };
        let cancel = CancellationSource::new();
        let started = Instant::now();
        let state = launcher
            .launch(&command, 59124, &cancel.cancellation_token())
            .await;
        assert_eq!(state, DebugLaunchState::MultipleGamesRunning);
        assert!(started.elapsed() < Duration::from_secs(10));

        launcher.tear_down().await;
        assert!(!launcher.game_is_running());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
