//! Launching an emulator process and waiting for its control ports.
//!
//! The launcher spawns the emulator with its standard streams redirected to
//! the null device and polls the control port (and the monitor port, when
//! one is configured) until both accept connections or the startup timeout
//! elapses. Termination is polite first: SIGTERM, a two second grace
//! period, then SIGKILL.

use std::fs::File;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

use crate::error::*;
use crate::Client;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const GRACE_STEPS: u32 = 20;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_monitor_port() -> u16 {
    5556
}

fn default_startup_timeout_ms() -> u64 {
    15_000
}

/// How to start an emulator.
///
/// The command line is composed as
/// `<executable> [--console] [--disable-gui] [--port <monitor_port>] [<script>]`.
/// A `monitor_port` of `0` disables the monitor channel entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub executable: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub disable_gui: bool,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

impl LaunchConfig {
    pub fn new<S: Into<String>>(executable: S) -> LaunchConfig {
        LaunchConfig {
            executable: executable.into(),
            script: None,
            host: default_host(),
            port: default_port(),
            monitor_port: default_monitor_port(),
            console: false,
            disable_gui: false,
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<LaunchConfig> {
        let file = File::open(path.as_ref()).map_err(map_context!())?;
        let config = serde_json::from_reader(file).map_err(map_context!())?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(map_context!())?;
        serde_json::to_writer_pretty(file, self).map_err(map_context!())?;
        Ok(())
    }
}

/// A running emulator child process.
///
/// Dropping the handle terminates the child.
pub struct EmulatorProcess {
    child: Child,
}

impl EmulatorProcess {
    /// Spawn the emulator and wait until its ports are reachable.
    pub fn launch(config: &LaunchConfig) -> Result<EmulatorProcess> {
        let mut command = Command::new(&config.executable);
        if config.console {
            command.arg("--console");
        }
        if config.disable_gui {
            command.arg("--disable-gui");
        }
        if config.monitor_port > 0 {
            command.arg("--port").arg(config.monitor_port.to_string());
        }
        if let Some(script) = &config.script {
            command.arg(script);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = command.spawn().map_err(|e| {
            Error::from(context!(ErrorKind::Launch(format!(
                "spawn {}: {}",
                config.executable, e
            ))))
        })?;
        log::debug!("spawned emulator pid {}", child.id());

        let mut process = EmulatorProcess { child };
        if let Err(e) = process.wait_ready(config) {
            process.terminate();
            return Err(e);
        }
        Ok(process)
    }

    fn wait_ready(&mut self, config: &LaunchConfig) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(config.startup_timeout_ms);
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(context!(ErrorKind::Launch(format!(
                    "emulator exited during startup: {}",
                    status
                )))
                .into());
            }

            let control_up = port_reachable(&config.host, config.port);
            let monitor_up =
                config.monitor_port == 0 || port_reachable(&config.host, config.monitor_port);
            if control_up && monitor_up {
                log::debug!("emulator ready on {}:{}", config.host, config.port);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(context!(ErrorKind::Timeout).into());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the child: polite signal, two second grace period, then kill.
    pub fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }

        for _ in 0..GRACE_STEPS {
            thread::sleep(POLL_INTERVAL);
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
        }
        log::warn!("emulator pid {} ignored SIGTERM, killing", self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for EmulatorProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn port_reachable(host: &str, port: u16) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return false,
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
            return true;
        }
    }
    false
}

/// Launch an emulator and open a control connection to it.
///
/// The handshake is left to the caller. If the connection fails, the freshly
/// launched process is terminated by drop.
pub fn launch_and_connect(config: &LaunchConfig) -> Result<(EmulatorProcess, Client)> {
    let process = EmulatorProcess::launch(config)?;
    let client = Client::connect(&config.host, config.port)?;
    Ok((process, client))
}
