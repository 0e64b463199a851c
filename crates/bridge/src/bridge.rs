//! The bridge facade: one `run_python` entry point over the catalog, pool,
//! discovery, runtime selector and sandbox plumbing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{self, Catalog};
use crate::discovery::DiscoveryService;
use crate::entrypoint;
use crate::error::BridgeError;
use crate::invocation::{self, SandboxInvocation};
use crate::pool::ClientPool;
use crate::render::{RunOutcome, RunStatus};
use crate::runtime::RuntimeSelector;
use crate::sandbox;
use crate::settings::Settings;

pub struct Bridge {
    settings: Settings,
    pool: Arc<ClientPool>,
    discovery: Arc<DiscoveryService>,
    runtime: Arc<RuntimeSelector>,
    sequence: AtomicU64,
}

impl Bridge {
    /// Scans configuration and assembles the bridge.
    pub async fn load(settings: Settings) -> anyhow::Result<Self> {
        let catalog = Arc::new(config::load_catalog(&settings).await?);
        Ok(Self::with_catalog(settings, catalog))
    }

    pub fn with_catalog(settings: Settings, catalog: Arc<Catalog>) -> Self {
        let pool = Arc::new(ClientPool::new(catalog.clone()));
        let discovery = Arc::new(DiscoveryService::new(catalog, pool.clone()));
        let runtime = Arc::new(RuntimeSelector::new(
            settings.runtime.clone(),
            settings.idle_timeout(),
        ));
        Self {
            settings,
            pool,
            discovery,
            runtime,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Executes one `run_python` call end to end. Failures are folded into
    /// the result envelope; this never takes the outer server down.
    pub async fn run_python(
        &self,
        code: &str,
        servers: &[String],
        timeout: Option<i64>,
    ) -> RunOutcome {
        let requested_names: Vec<String> = dedup(servers);

        let request = match invocation::validate(code, servers, timeout, &self.settings) {
            Ok(request) => request,
            Err(err) => return fail(requested_names, &err),
        };

        // Start (or reuse) the requested downstream clients before paying
        // for a container.
        if let Err(err) = self.pool.ensure(&request.servers).await {
            return fail(requested_names, &err);
        }

        let mut metadata = Vec::with_capacity(request.servers.len());
        for server in &request.servers {
            match self.discovery.server_metadata(server).await {
                Ok(meta) => metadata.push(meta.to_value()),
                Err(err) => return fail(requested_names, &err),
            }
        }
        let discovered = self.discovery.discovered_servers();

        let lease = match self.runtime.acquire().await {
            Ok(lease) => lease,
            Err(err) => return fail(requested_names, &err),
        };

        if let Err(err) = tokio::fs::create_dir_all(&self.settings.state_dir).await {
            let err = BridgeError::SandboxCrash(format!(
                "failed to create state dir {}: {err}",
                self.settings.state_dir.display()
            ));
            return fail(requested_names, &err);
        }
        if let Err(err) = self.runtime.ensure_shared_dir(&self.settings.state_dir).await {
            return fail(requested_names, &err);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let invocation = match SandboxInvocation::prepare(&self.settings, sequence, &request).await
        {
            Ok(invocation) => invocation,
            Err(err) => return fail(requested_names, &err),
        };

        let env = vec![
            (
                entrypoint::AVAILABLE_SERVERS_ENV.to_string(),
                serde_json::to_string(&metadata).unwrap_or_else(|_| "[]".to_string()),
            ),
            (
                entrypoint::DISCOVERED_SERVERS_ENV.to_string(),
                serde_json::to_string(&discovered).unwrap_or_else(|_| "[]".to_string()),
            ),
        ];
        let plan = sandbox::build_launch(
            &lease.binary,
            &self.settings,
            &invocation.id,
            invocation.ipc_dir(),
            &env,
        );

        tracing::info!(
            invocation = %invocation.id,
            servers = ?requested_names,
            timeout = request.timeout_seconds,
            "starting sandbox"
        );
        let run = invocation
            .run(&plan, self.pool.clone(), self.discovery.clone())
            .await;
        invocation.cleanup().await;
        drop(lease);

        tracing::info!(
            status = run.status.as_str(),
            exit_code = ?run.exit_code,
            "sandbox finished"
        );
        RunOutcome {
            status: run.status,
            stdout: run.stdout,
            stderr: run.stderr,
            error: run.error,
            servers: requested_names,
        }
    }

    /// Closes all downstream clients.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn dedup(servers: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for server in servers {
        if !out.contains(server) {
            out.push(server.clone());
        }
    }
    out
}

/// Pre-spawn failures surface through the result envelope, with the tagged
/// message mirrored into stderr so code-level checks can see the kind.
fn fail(servers: Vec<String>, err: &BridgeError) -> RunOutcome {
    let tagged = err.tagged().to_string();
    RunOutcome {
        status: RunStatus::Error,
        stdout: String::new(),
        stderr: tagged.clone(),
        error: Some(tagged),
        servers,
    }
}
