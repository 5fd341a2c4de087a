// Service wiring: builds the engine from configuration and owns its lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServiceConfig;
use crate::engine::cache::{CacheStats, ResponseCache};
use crate::engine::clock::{Clock, SystemClock};
use crate::engine::orchestrator::FetchOrchestrator;
use crate::engine::randomizer::Randomizer;
use crate::engine::scheduler::Scheduler;
use crate::engine::session::{PoolCounters, SessionPool, SessionSnapshot};
use crate::engine::stats::{StatsCollector, StatsSnapshot};
use crate::source::http_source::HttpSessionProvider;
use crate::source::traits::SessionProvider;
use crate::store::{JsonScheduleStore, ResultSink, ScheduleStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub sessions_healthy: usize,
    pub sessions_total: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealth {
    #[serde(flatten)]
    pub summary: HealthReport,
    pub started_at: DateTime<Utc>,
    pub shutting_down: bool,
    pub sessions: Vec<SessionSnapshot>,
    pub cache: CacheStats,
    pub tracked_entities: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub cache: CacheStats,
    pub fetch: StatsSnapshot,
    pub pool: PoolCounters,
}

pub struct ServiceBuilder {
    config: ServiceConfig,
    provider: Option<Arc<dyn SessionProvider>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn ScheduleStore>>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            provider: None,
            clock: Arc::new(SystemClock),
            store: None,
            sink: None,
        }
    }

    /// Defaults to [`HttpSessionProvider`] over `upstream`.
    pub fn provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to `<state_dir>/schedule.json`.
    pub fn schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<FetchService> {
        let config = self.config;
        config.validate()?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(
                HttpSessionProvider::new(&config.upstream, config.fetch.capture_timeout())
                    .context("creating http session provider")?,
            ),
        };
        let store = self.store.unwrap_or_else(|| {
            Arc::new(JsonScheduleStore::new(
                PathBuf::from(&config.state_dir).join("schedule.json"),
            ))
        });

        let randomizer = Arc::new(Randomizer::new(&config.randomizer));
        let pool = Arc::new(SessionPool::new(config.pool.clone())?);
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let stats = Arc::new(StatsCollector::new());

        let mut orchestrator = FetchOrchestrator::new(
            Arc::clone(&pool),
            Arc::clone(&cache),
            provider,
            Arc::clone(&randomizer),
            config.fetch.clone(),
            config.pool.acquire_timeout(),
        )?
        .with_stats(Arc::clone(&stats));
        if let Some(sink) = self.sink {
            orchestrator = orchestrator.with_sink(sink);
        }
        let orchestrator = Arc::new(orchestrator);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&orchestrator),
            randomizer,
            self.clock,
            store,
            config.scheduler.clone(),
            config.fetch.cycle_deadline(),
        ));

        Ok(FetchService {
            config,
            pool,
            cache,
            stats,
            orchestrator,
            scheduler,
            shutdown_token: CancellationToken::new(),
            started_at: Utc::now(),
        })
    }
}

pub struct FetchService {
    config: ServiceConfig,
    pool: Arc<SessionPool>,
    cache: Arc<ResponseCache>,
    stats: Arc<StatsCollector>,
    orchestrator: Arc<FetchOrchestrator>,
    scheduler: Arc<Scheduler>,
    shutdown_token: CancellationToken,
    started_at: DateTime<Utc>,
}

impl FetchService {
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn orchestrator(&self) -> &Arc<FetchOrchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Restore the schedule table and start the tick loop.
    pub async fn start_scheduler(&self) -> Result<JoinHandle<()>> {
        self.scheduler.restore().await?;
        self.scheduler.persist().await?;
        let scheduler = Arc::clone(&self.scheduler);
        let token = self.shutdown_token.child_token();
        Ok(tokio::spawn(scheduler.run(token)))
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.pool.available() > 0 { "ok" } else { "degraded" },
            sessions_healthy: self.pool.healthy(),
            sessions_total: self.pool.size(),
            capacity: self.pool.capacity(),
        }
    }

    pub fn detailed_health(&self) -> DetailedHealth {
        DetailedHealth {
            summary: self.health(),
            started_at: self.started_at,
            shutting_down: self.orchestrator.is_shutting_down(),
            sessions: self.pool.snapshot(),
            cache: self.cache.stats(),
            tracked_entities: self.scheduler.len(),
        }
    }

    pub fn stats_report(&self) -> StatsReport {
        StatsReport {
            cache: self.cache.stats(),
            fetch: self.stats.snapshot(),
            pool: self.pool.counters(),
        }
    }

    /// Stop the scheduler and abort in-flight pipelines.
    pub async fn dispose(&self) {
        info!("disposing fetch service");
        self.shutdown_token.cancel();
        self.orchestrator.shutdown().await;
    }
}
