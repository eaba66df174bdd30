//! Smoke tests against the deployed stack.
//!
//! Everything runs through tunnels owned by a [`TunnelSet`]; [`SmokeTester::run`]
//! closes them on every exit path, including an external interrupt.

pub mod broker;
pub mod http;
pub mod tunnel;

use std::future::Future;
use std::sync::Arc;

use dockside_core::{
    CommandRunner, CommandSpec, DeployConfig, DeployError, DeployWarning, Result,
};
use tokio::time::Instant;
use tracing::{info, warn};

pub use http::{extract_field, HttpProbe, ProbeResponse};
pub use tunnel::{PortForwardSession, TunnelSet, TunnelState};

/// Which checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmokeSuite {
    /// Task round trip through the web service, then the worker log.
    Full,
    /// Task round trip only.
    Api,
    /// Broker PING only.
    Broker,
    /// Open web and broker tunnels and keep them until interrupted. Fails
    /// when either port-forward process exits.
    Hold,
}

pub struct SmokeTester {
    runner: Arc<dyn CommandRunner>,
    config: Arc<DeployConfig>,
    http: HttpProbe,
}

impl SmokeTester {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<DeployConfig>) -> Result<Self> {
        let http = HttpProbe::new(config.timeouts.request())?;
        Ok(Self {
            runner,
            config,
            http,
        })
    }

    /// An empty tunnel set configured for this run.
    pub fn tunnels(&self) -> TunnelSet {
        TunnelSet::new(
            self.runner.clone(),
            &self.config.manifests.namespace,
            self.config.timeouts.tunnel_probe(),
            self.config.timeouts.poll_interval(),
        )
    }

    /// Run `suite`, racing it against `shutdown`. Tunnels are closed
    /// before this returns, whichever side finished first.
    pub async fn run<S>(
        &self,
        suite: SmokeSuite,
        tunnels: &mut TunnelSet,
        shutdown: S,
    ) -> Result<Vec<DeployWarning>>
    where
        S: Future<Output = ()>,
    {
        let result = tokio::select! {
            result = self.run_suite(suite, &mut *tunnels) => result,
            () = shutdown => {
                if suite == SmokeSuite::Hold {
                    info!("Stopping port forwards");
                    Ok(Vec::new())
                } else {
                    warn!("Interrupted, closing tunnels");
                    Err(DeployError::Interrupted)
                }
            }
        };
        tunnels.close_all().await;
        result
    }

    async fn run_suite(
        &self,
        suite: SmokeSuite,
        tunnels: &mut TunnelSet,
    ) -> Result<Vec<DeployWarning>> {
        let services = &self.config.services;
        match suite {
            SmokeSuite::Full => {
                let addr = tunnels.open(&services.web).await?;
                let mut warnings = self.task_round_trip(&format!("http://{addr}")).await?;
                match self.fetch_log().await {
                    Ok(log) => info!(path = %self.config.worker.log_path, "Worker log:\n{}", log.trim_end()),
                    Err(warning) => warnings.push(warning),
                }
                Ok(warnings)
            }
            SmokeSuite::Api => {
                let addr = tunnels.open(&services.web).await?;
                self.task_round_trip(&format!("http://{addr}")).await
            }
            SmokeSuite::Broker => {
                let addr = tunnels.open(&services.broker).await?;
                broker::ping(addr, self.config.timeouts.request()).await?;
                info!(service = %services.broker.name, "Broker answered PING");
                Ok(Vec::new())
            }
            SmokeSuite::Hold => {
                for endpoint in [&services.web, &services.broker] {
                    let addr = tunnels.open(endpoint).await?;
                    info!(service = %endpoint.name, addr = %addr, "Forwarding");
                }
                info!("Port forwards active, press Ctrl-C to stop");
                tunnels.watch().await?;
                Ok(Vec::new())
            }
        }
    }

    /// GET against a tunnelled service.
    pub async fn request(&self, base_url: &str, path: &str) -> Result<ProbeResponse> {
        self.http.get(base_url, path).await
    }

    /// Queue a task, then poll its status until it succeeds or the wait
    /// window closes.
    pub async fn task_round_trip(&self, base_url: &str) -> Result<Vec<DeployWarning>> {
        let mut warnings = Vec::new();
        let token = &self.config.smoke.device_token;

        let trigger = self.request(base_url, &format!("/task/{token}")).await?;
        if let Some(warning) = trigger.warning() {
            warnings.push(warning);
        }
        let Some(task_id) = trigger.field("task_id") else {
            warnings.push(DeployWarning::MissingTaskId {
                url: trigger.url.clone(),
            });
            return Ok(warnings);
        };
        info!(
            task_id = %task_id,
            message = %trigger.field("message").unwrap_or_default(),
            "Task queued"
        );

        if let Some(warning) = self.await_task(base_url, &task_id).await? {
            warnings.push(warning);
        }
        Ok(warnings)
    }

    async fn await_task(&self, base_url: &str, task_id: &str) -> Result<Option<DeployWarning>> {
        let expected = format!("Task completed for {}", self.config.smoke.device_token);
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.task_wait();
        let path = format!("/task/status/{task_id}");

        loop {
            let response = self.request(base_url, &path).await?;
            if let Some(warning) = response.warning() {
                return Ok(Some(warning));
            }

            let status = response
                .field("status")
                .unwrap_or_else(|| "UNKNOWN".to_string());
            match status.as_str() {
                "SUCCESS" => {
                    let actual = response.field("result");
                    if actual.as_deref() == Some(expected.as_str()) {
                        info!(task_id, "Task completed");
                        return Ok(None);
                    }
                    return Ok(Some(DeployWarning::UnexpectedTaskResult {
                        task_id: task_id.to_string(),
                        expected,
                        actual,
                    }));
                }
                "FAILURE" | "REVOKED" => {
                    return Ok(Some(DeployWarning::TaskNotFinished {
                        task_id: task_id.to_string(),
                        status,
                    }));
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Some(DeployWarning::TaskNotFinished {
                    task_id: task_id.to_string(),
                    status,
                }));
            }
            tokio::time::sleep(timeouts.poll_interval().min(deadline - now)).await;
        }
    }

    /// Read the worker's log file from the first matching pod.
    ///
    /// Diagnostic only, so failure comes back as a warning.
    pub async fn fetch_log(&self) -> std::result::Result<String, DeployWarning> {
        let worker = &self.config.worker;
        let namespace = &self.config.manifests.namespace;
        let unavailable = |target: &str, detail: String| DeployWarning::LogUnavailable {
            target: target.to_string(),
            detail: if detail.is_empty() {
                "no output".to_string()
            } else {
                detail
            },
        };

        let selector_target = format!("pods -l {}", worker.selector);
        let pods = self
            .runner
            .run(&CommandSpec::new("kubectl").args([
                "get",
                "pods",
                "-n",
                namespace.as_str(),
                "-l",
                worker.selector.as_str(),
                "-o",
                "jsonpath={.items[0].metadata.name}",
            ]))
            .await
            .map_err(|e| unavailable(&selector_target, e.to_string()))?;
        if !pods.success() {
            return Err(unavailable(&selector_target, pods.combined()));
        }
        let pod = pods.stdout.trim();
        if pod.is_empty() {
            return Err(unavailable(&selector_target, "no pod matches".to_string()));
        }

        let target = format!("{pod}:{}", worker.log_path);
        let output = self
            .runner
            .run(&CommandSpec::new("kubectl").args([
                "exec",
                "-n",
                namespace.as_str(),
                pod,
                "-c",
                worker.container.as_str(),
                "--",
                "cat",
                worker.log_path.as_str(),
            ]))
            .await
            .map_err(|e| unavailable(&target, e.to_string()))?;
        if !output.success() {
            return Err(unavailable(&target, output.combined()));
        }
        Ok(output.stdout)
    }
}
