use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::SupervisorSettings;
use crate::server::SessionRegistry;
use crate::tunnel::{ChainedTunnel, Tunnel};

struct Managed {
    tunnel: Arc<ChainedTunnel>,
    child: Option<Child>,
    last_spawn: Option<Instant>,
}

/// Keeps tunnel subprocesses running while sessions need them.
///
/// Demand is computed by mark-and-sweep over live sessions. Tunnels that go
/// idle are left running; every child is killed when the supervisor drops.
pub struct Supervisor {
    managed: Vec<Managed>,
    sessions: Arc<SessionRegistry>,
    scan_interval: Duration,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(
        tunnels: &[Arc<ChainedTunnel>],
        sessions: Arc<SessionRegistry>,
        settings: &SupervisorSettings,
    ) -> Self {
        let managed = tunnels
            .iter()
            .filter(|t| t.command().is_some())
            .map(|t| Managed {
                tunnel: Arc::clone(t),
                child: None,
                last_spawn: None,
            })
            .collect();
        Self {
            managed,
            sessions,
            scan_interval: Duration::from_millis(settings.scan_interval_ms.max(1)),
            restart_delay: Duration::from_secs(settings.restart_delay_secs),
        }
    }

    pub async fn run(mut self) {
        if self.managed.is_empty() {
            debug!("no tunnel commands configured, supervisor idle");
            return;
        }
        let mut tick = tokio::time::interval(self.scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.scan();
        }
    }

    /// One mark-and-sweep pass.
    pub fn scan(&mut self) {
        mark_demand(&self.sessions);

        for managed in &mut self.managed {
            // A tunnel with relays still open stays wanted.
            let active = managed.tunnel.active_connections();
            let wanted = managed.tunnel.take_mark() || active > 0;
            let name = managed.tunnel.name().to_string();

            if let Some(child) = managed.child.as_mut() {
                match child.try_wait() {
                    Ok(None) => continue,
                    Ok(Some(status)) => {
                        warn!(tunnel = %name, %status, "tunnel process exited");
                        managed.child = None;
                    }
                    Err(e) => {
                        warn!(tunnel = %name, "cannot poll tunnel process: {}", e);
                        continue;
                    }
                }
            }

            if !wanted {
                continue;
            }
            let ready = managed
                .last_spawn
                .map_or(true, |at| at.elapsed() >= self.restart_delay);
            if !ready {
                debug!(tunnel = %name, "restart delayed");
                continue;
            }
            managed.last_spawn = Some(Instant::now());
            match spawn_tunnel(&managed.tunnel) {
                Ok(child) => managed.child = Some(child),
                Err(e) => warn!(tunnel = %name, "failed to start tunnel process: {}", e),
            }
        }
    }

    #[cfg(test)]
    fn is_running(&self, name: &str) -> bool {
        self.managed
            .iter()
            .any(|m| m.tunnel.name() == name && m.child.is_some())
    }
}

/// Mark every chained tunnel a live session is using or about to try.
pub fn mark_demand(sessions: &SessionRegistry) {
    for session in sessions.sessions() {
        let st = session.lock();
        if st.exited {
            continue;
        }
        match (&st.tunnel, &st.route) {
            (Some(Tunnel::Chained(t)), _) => t.set_mark(),
            (Some(_), _) => {}
            (None, Some(route)) => route
                .tunnels
                .iter()
                .filter_map(Tunnel::as_chained)
                .for_each(|t| t.set_mark()),
            (None, None) => {}
        }
    }
}

fn spawn_tunnel(tunnel: &ChainedTunnel) -> std::io::Result<Child> {
    let command = tunnel.command().unwrap_or_default();
    info!(tunnel = tunnel.name(), command, "starting tunnel process");

    let mut child = Command::new("bash")
        .arg("-c")
        .arg(format!("exec {command}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(out) = child.stdout.take() {
        tokio::spawn(log_lines(tunnel.name().to_string(), out));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(log_lines(tunnel.name().to_string(), err));
    }
    Ok(child)
}

async fn log_lines<R>(tunnel: String, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(tunnel = %tunnel, "{}", line);
    }
}
