//! Config-driven wiring of the whole runtime.
//!
//! One [`Runtime`] is built per process and shared by every request: the
//! gateway and the CLI both go through it.

use loomi_config::AppConfig;
use loomi_core::provider::ModelClient;
use loomi_session::{ContextManager, HeartbeatTracker, LayeredQueue, NotesService, StopManager, SubagentRateLimiter};
use loomi_store::{InMemoryNotes, PoolManager, PoolSizes, kv_from_name};
use loomi_telemetry::{RuntimeMetrics, TokenAccumulator};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent_loop::AgentDeps;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

/// Shared services behind every orchestration.
pub struct Runtime {
    pub pools: Arc<PoolManager>,
    pub stop: Arc<StopManager>,
    pub tokens: Arc<TokenAccumulator>,
    pub notes: Arc<NotesService>,
    pub context: Arc<ContextManager>,
    pub heartbeat: Arc<HeartbeatTracker>,
    pub metrics: Arc<RuntimeMetrics>,
    pub orchestrator: Arc<Orchestrator>,
    session_idle: Duration,
    sweep_interval: Duration,
}

impl Runtime {
    pub fn from_config(config: &AppConfig, client: Arc<dyn ModelClient>) -> Self {
        let sizes = PoolSizes {
            high_priority: config.store.pool_size.high_priority,
            normal: config.store.pool_size.normal,
            background: config.store.pool_size.background,
        };
        let pools = Arc::new(PoolManager::new(
            kv_from_name(&config.store.backend),
            sizes,
            config.store.acquire_timeout(),
        ));
        Self::with_pools(config, client, pools)
    }

    /// Same as [`Runtime::from_config`] but over an existing pool manager.
    pub fn with_pools(config: &AppConfig, client: Arc<dyn ModelClient>, pools: Arc<PoolManager>) -> Self {
        let runtime = &config.runtime;

        let stop = Arc::new(StopManager::new(pools.clone()).with_ttl(runtime.stop_ttl()));
        let tokens = Arc::new(
            TokenAccumulator::new(pools.clone())
                .with_bucket_ttl(runtime.token_bucket_ttl())
                .with_cost_per_token(runtime.cost_per_token),
        );
        let notes = Arc::new(NotesService::new(Arc::new(InMemoryNotes::new())));
        let context = Arc::new(
            ContextManager::new()
                .with_store(pools.clone())
                .with_notes(notes.clone()),
        );
        let heartbeat = Arc::new(HeartbeatTracker::new(pools.clone()));
        let metrics = Arc::new(RuntimeMetrics::new());

        let deps = AgentDeps::new(client, pools.clone())
            .with_stop(stop.clone())
            .with_tokens(tokens.clone())
            .with_context(context.clone())
            .with_notes(notes.clone())
            .with_metrics(metrics.clone());

        let queue = Arc::new(LayeredQueue::new(pools.clone()).with_timeout(runtime.queue_timeout()));
        let mut orchestrator = Orchestrator::new(deps, pools.clone())
            .with_settings(OrchestratorSettings::from_config(runtime))
            .with_queue(queue);
        if let Some(limit) = &config.rate_limit {
            info!(
                max_subagents = limit.max_subagents,
                window_secs = limit.window_secs,
                "Subagent rate limiting enabled"
            );
            orchestrator = orchestrator.with_rate_limiter(Arc::new(SubagentRateLimiter::new(
                pools.clone(),
                limit.max_subagents,
                limit.window(),
            )));
        }

        Self {
            pools,
            stop,
            tokens,
            notes,
            context,
            heartbeat,
            metrics,
            orchestrator: Arc::new(orchestrator),
            session_idle: runtime.session_idle(),
            sweep_interval: runtime.sweep_interval(),
        }
    }

    /// Evict session contexts idle for longer than the configured limit.
    pub async fn sweep(&self) -> usize {
        self.context.evict_idle(self.session_idle).await
    }

    /// Run [`Runtime::sweep`] on the configured interval until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = runtime.sweep().await;
                debug!(evicted, "Session sweep finished");
            }
        })
    }
}
