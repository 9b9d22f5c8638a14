//! Launch, watch and tear down the foreign host process.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::transport::SocketGroup;

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The spawned foreign host process.
///
/// Environment variables are forwarded unchanged so the foreign-OS
/// compatibility layer keeps its configuration.
pub struct HostProcess {
    child: Arc<Mutex<Child>>,
    watchdog_enabled: bool,
    monitor_stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl HostProcess {
    /// Spawn the foreign host with the socket group directory and the
    /// foreign plugin path as arguments.
    pub fn spawn(
        host_binary: &Path,
        group: &SocketGroup,
        plugin_path: &Path,
        config: &BridgeConfig,
    ) -> Result<HostProcess> {
        warn_scheduling_limits();
        let mut command = Command::new(host_binary);
        command
            .arg(group.dir())
            .arg(plugin_path)
            .stdin(Stdio::null());
        if let Some(group_id) = &config.group {
            command.arg("--group").arg(group_id);
        }
        let child = command.spawn()?;
        info!(
            "spawned foreign host {} (pid {}) for {}",
            host_binary.display(),
            child.id(),
            plugin_path.display()
        );
        Ok(HostProcess {
            child: Arc::new(Mutex::new(child)),
            watchdog_enabled: config.watchdog_enabled(),
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor: None,
        })
    }

    /// Startup-phase liveness probe, polled by the handshake accept loop.
    /// Exits before every channel is paired fail the whole construction.
    pub fn startup_liveness(&self) -> Result<()> {
        if !self.watchdog_enabled {
            return Ok(());
        }
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait()? {
            Some(status) => Err(BridgeError::HostExited(status.code().unwrap_or(-1))),
            None => Ok(()),
        }
    }

    /// Start the steady-state monitor. After the handshake an exit is only
    /// logged; the in-flight calls surface their own transport errors.
    pub fn start_monitor(&mut self) {
        if !self.watchdog_enabled || self.monitor.is_some() {
            return;
        }
        let child = Arc::clone(&self.child);
        let stop = Arc::clone(&self.monitor_stop);
        let thread = std::thread::Builder::new()
            .name("winebridge-watchdog".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    {
                        let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                        match child.try_wait() {
                            Ok(Some(status)) => {
                                warn!("foreign host exited with {}", status);
                                return;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!("watchdog wait failed: {}", err);
                                return;
                            }
                        }
                    }
                    std::thread::sleep(LIVENESS_POLL_INTERVAL);
                }
            });
        match thread {
            Ok(handle) => self.monitor = Some(handle),
            Err(err) => warn!("failed to start watchdog thread: {}", err),
        }
    }

    /// Reap the child, killing it if it has not exited on its own. Errors
    /// are swallowed; the peer being gone already is the common case.
    pub fn terminate(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Log advisory warnings when the scheduler limits are too tight for a
/// realtime audio path. Informational only.
pub fn warn_scheduling_limits() {
    unsafe {
        let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        if libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) == 0
            && limit.rlim_cur != libc::RLIM_INFINITY
            && limit.rlim_cur < 64 * 1024 * 1024
        {
            warn!(
                "RLIMIT_MEMLOCK is {} bytes; shared audio buffers may not stay resident",
                limit.rlim_cur
            );
        }
        #[cfg(target_os = "linux")]
        if libc::getrlimit(libc::RLIMIT_RTTIME, &mut limit) == 0
            && limit.rlim_cur != libc::RLIM_INFINITY
        {
            warn!(
                "RLIMIT_RTTIME is {} us; the kernel may demote realtime audio threads",
                limit.rlim_cur
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        BridgeConfig::default()
    }

    #[test]
    fn startup_liveness_detects_exit() {
        let group = SocketGroup::create().unwrap();
        let process =
            HostProcess::spawn(Path::new("/bin/true"), &group, Path::new("plugin.dll"), &config())
                .unwrap();
        // /bin/true exits immediately; poll until the watchdog notices.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match process.startup_liveness() {
                Err(BridgeError::HostExited(0)) => break,
                Ok(()) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                other => panic!("unexpected liveness result: {:?}", other),
            }
        }
    }

    #[test]
    fn terminate_kills_a_running_child() {
        let group = SocketGroup::create().unwrap();
        let process = HostProcess::spawn(
            Path::new("/bin/sleep"),
            &group,
            Path::new("600"),
            &config(),
        )
        .unwrap();
        process.terminate();
    }

    #[test]
    fn limits_warning_never_panics() {
        warn_scheduling_limits();
    }
}
