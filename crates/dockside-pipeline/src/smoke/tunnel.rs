//! Port-forward sessions.
//!
//! A session moves `Unopened → Opening → Open → Closing → Closed`. Failure
//! while opening goes straight to `Closing`. [`TunnelSet::close_all`] is the
//! release point on every exit path; `Drop` only fires a kill as a backstop.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dockside_core::{
    BackgroundProcess, CommandRunner, CommandSpec, DeployError, Result, ServiceEndpoint,
};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Unopened,
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Unopened => "unopened",
            TunnelState::Opening => "opening",
            TunnelState::Open => "open",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One `kubectl port-forward` process and its local port.
pub struct PortForwardSession {
    service: String,
    local_port: u16,
    remote_port: u16,
    state: TunnelState,
    process: Option<Box<dyn BackgroundProcess>>,
}

impl fmt::Debug for PortForwardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForwardSession")
            .field("service", &self.service)
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .field("state", &self.state)
            .finish()
    }
}

impl PortForwardSession {
    fn new(endpoint: &ServiceEndpoint) -> Self {
        Self {
            service: endpoint.name.clone(),
            local_port: endpoint.local_port,
            remote_port: endpoint.remote_port,
            state: TunnelState::Unopened,
            process: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    fn transition(&mut self, next: TunnelState) {
        debug!(service = %self.service, port = self.local_port, from = %self.state, to = %next, "Tunnel state");
        self.state = next;
    }

    fn failure(&self, detail: String) -> DeployError {
        DeployError::TunnelFailed {
            service: self.service.clone(),
            port: self.local_port,
            detail,
        }
    }

    async fn open(
        &mut self,
        runner: &dyn CommandRunner,
        namespace: &str,
        probe_timeout: Duration,
        poll: Duration,
    ) -> Result<()> {
        self.transition(TunnelState::Opening);
        let cmd = CommandSpec::new("kubectl").args([
            "port-forward".to_string(),
            format!("svc/{}", self.service),
            format!("{}:{}", self.local_port, self.remote_port),
            "-n".to_string(),
            namespace.to_string(),
        ]);
        let process = match runner.spawn(&cmd).await {
            Ok(process) => process,
            Err(e) => {
                let err = self.failure(e.to_string());
                self.close().await;
                return Err(err);
            }
        };
        debug!(service = %self.service, pid = ?process.id(), "Port-forward started");
        self.process = Some(process);

        if let Err(err) = self.probe(probe_timeout, poll).await {
            self.close().await;
            return Err(err);
        }
        self.transition(TunnelState::Open);
        info!(service = %self.service, addr = %self.local_addr(), "Tunnel open");
        Ok(())
    }

    /// Poll until the local port accepts connections or the process dies.
    async fn probe(&mut self, timeout: Duration, poll: Duration) -> Result<()> {
        let addr = self.local_addr();
        let deadline = Instant::now() + timeout;
        loop {
            self.check_alive()?;

            if let Ok(Ok(_)) = tokio::time::timeout(poll, TcpStream::connect(addr)).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.failure(format!(
                    "port not reachable within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Error if the port-forward process has exited.
    fn check_alive(&mut self) -> Result<()> {
        let exited = match self.process.as_mut() {
            Some(process) => process.try_exit_code()?,
            None => Some(-1),
        };
        match exited {
            Some(code) => Err(self.failure(format!("port-forward exited with code {code}"))),
            None => Ok(()),
        }
    }

    /// Tear the session down. Safe to call in any state.
    pub async fn close(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        self.transition(TunnelState::Closing);
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate().await {
                warn!(service = %self.service, error = %e, "Failed to stop port-forward");
                process.start_kill();
            }
        }
        self.transition(TunnelState::Closed);
    }
}

impl Drop for PortForwardSession {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.start_kill();
        }
    }
}

/// Owner of every tunnel opened during a run.
pub struct TunnelSet {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    probe_timeout: Duration,
    poll: Duration,
    sessions: Vec<PortForwardSession>,
}

impl TunnelSet {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        namespace: &str,
        probe_timeout: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            runner,
            namespace: namespace.to_string(),
            probe_timeout,
            poll,
            sessions: Vec::new(),
        }
    }

    /// Open a tunnel to `endpoint` and return its local address.
    ///
    /// At most one live session per (service, local port).
    pub async fn open(&mut self, endpoint: &ServiceEndpoint) -> Result<SocketAddr> {
        let in_use = self.sessions.iter().any(|s| {
            s.service == endpoint.name
                && s.local_port == endpoint.local_port
                && s.state != TunnelState::Closed
        });
        if in_use {
            return Err(DeployError::TunnelInUse {
                service: endpoint.name.clone(),
                port: endpoint.local_port,
            });
        }

        // Registered before opening so a cancelled open is still closed by close_all
        self.sessions.push(PortForwardSession::new(endpoint));
        let index = self.sessions.len() - 1;
        let session = &mut self.sessions[index];
        session
            .open(
                self.runner.as_ref(),
                &self.namespace,
                self.probe_timeout,
                self.poll,
            )
            .await?;
        Ok(session.local_addr())
    }

    /// Check every open session each poll interval.
    ///
    /// Returns `Ok` once no session is open, and the failure of the first
    /// session whose process exits. Sessions are left for
    /// [`close_all`](Self::close_all).
    pub async fn watch(&mut self) -> Result<()> {
        loop {
            let mut open = 0;
            for session in &mut self.sessions {
                if session.state == TunnelState::Open {
                    session.check_alive()?;
                    open += 1;
                }
            }
            if open == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Close every session that is not closed yet.
    pub async fn close_all(&mut self) {
        for session in &mut self.sessions {
            session.close().await;
        }
    }

    pub fn sessions(&self) -> &[PortForwardSession] {
        &self.sessions
    }

    /// Sessions currently `Open`.
    pub fn open_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == TunnelState::Open)
            .count()
    }

    pub fn all_closed(&self) -> bool {
        self.sessions.iter().all(|s| s.state == TunnelState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockside_core::fakes::{FakeSpawn, ScriptedRunner};
    use tokio::net::TcpListener;

    fn tunnels(runner: &Arc<ScriptedRunner>) -> TunnelSet {
        TunnelSet::new(
            runner.clone(),
            "default",
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let runner = Arc::new(ScriptedRunner::new());
        let (_listener, port) = listener().await;
        let mut set = tunnels(&runner);

        let addr = set
            .open(&ServiceEndpoint::new("web", port, 8000))
            .await
            .unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(set.open_count(), 1);
        assert!(runner.was_called(&format!(
            "kubectl port-forward svc/web {port}:8000 -n default"
        )));

        set.close_all().await;
        assert!(set.all_closed());
        assert!(runner.spawned()[0].terminated());
    }

    #[tokio::test]
    async fn test_immediate_exit_fails_and_closes() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_spawn("kubectl port-forward", FakeSpawn::Exits(1));
        let (_listener, port) = listener().await;
        let mut set = tunnels(&runner);

        let err = set
            .open(&ServiceEndpoint::new("web", port, 8000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tunnel_failed");
        assert!(err.to_string().contains("exited with code 1"));
        assert_eq!(set.sessions()[0].state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_port_fails_and_closes() {
        let runner = Arc::new(ScriptedRunner::new());
        let (listener, port) = listener().await;
        drop(listener);
        let mut set = tunnels(&runner);

        let err = set
            .open(&ServiceEndpoint::new("web", port, 8000))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not reachable"));
        assert!(set.all_closed());
        assert!(runner.spawned()[0].terminated());
    }

    #[tokio::test]
    async fn test_one_session_per_pair() {
        let runner = Arc::new(ScriptedRunner::new());
        let (_listener, port) = listener().await;
        let mut set = tunnels(&runner);
        let endpoint = ServiceEndpoint::new("web", port, 8000);

        set.open(&endpoint).await.unwrap();
        let err = set.open(&endpoint).await.unwrap_err();
        assert_eq!(err.kind(), "tunnel_in_use");

        set.close_all().await;
        set.open(&endpoint).await.unwrap();
        assert_eq!(set.open_count(), 1);
        set.close_all().await;
    }

    #[tokio::test]
    async fn test_watch_reports_dead_forward() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_spawn(
            "kubectl port-forward svc/broker",
            FakeSpawn::ExitsAfter { polls: 3, code: 1 },
        );
        let (_web, web_port) = listener().await;
        let (_broker, broker_port) = listener().await;
        let mut set = tunnels(&runner);
        set.open(&ServiceEndpoint::new("web", web_port, 8000))
            .await
            .unwrap();
        set.open(&ServiceEndpoint::new("broker", broker_port, 6379))
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), set.watch())
            .await
            .expect("watch never noticed the exit")
            .unwrap_err();
        assert_eq!(err.kind(), "tunnel_failed");
        assert!(err.to_string().contains("broker"));
        assert!(err.to_string().contains("exited with code 1"));

        set.close_all().await;
        assert!(set.all_closed());
        assert!(runner.spawned().iter().all(|p| p.terminated()));
    }

    #[tokio::test]
    async fn test_watch_without_open_sessions_returns() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut set = tunnels(&runner);
        set.watch().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_kills_open_process() {
        let runner = Arc::new(ScriptedRunner::new());
        let (_listener, port) = listener().await;
        {
            let mut set = tunnels(&runner);
            set.open(&ServiceEndpoint::new("web", port, 8000))
                .await
                .unwrap();
        }
        assert!(runner.spawned()[0].terminated());
    }
}
