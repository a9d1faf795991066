//! Periodic background refresh.
//!
//! Keeps every configured fragment warm so page renders, which never hit
//! the network, find valid entries. Runs in the `Background` context and
//! therefore ignores the fallback preference.

use crate::cache::{CacheManager, FetchContext, GetOptions, Source};
use crate::provider::Provider;
use crate::render::{ContentId, Renderer};
use crate::service::Service;
use crate::store::MemoryStore;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Scheduler {
    cache: CacheManager,
    renderer: Renderer,
    /// Expired entries to sweep when running on the in-memory store
    sweep: Option<MemoryStore>,
    every: Duration,
}

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

impl Scheduler {
    pub fn new(
        cache: CacheManager,
        renderer: Renderer,
        sweep: Option<MemoryStore>,
        every: Duration,
    ) -> Self {
        Self {
            cache,
            renderer,
            sweep,
            every,
        }
    }

    fn configured(&self, service: Service) -> bool {
        match service {
            Service::Lastfm => self.renderer.lastfm().is_configured(),
            Service::Trakt => self.renderer.trakt().is_configured(),
            Service::Generic => false,
        }
    }

    /// Refresh every fragment of a configured provider once.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let scope = self.cache.scope();
        let options = GetOptions::new(FetchContext::Background);
        let targets: Vec<ContentId> = ContentId::ALL
            .into_iter()
            .filter(|id| self.configured(id.service()))
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|id| self.renderer.render(&scope, *id, options)),
        )
        .await;

        let mut summary = RefreshSummary::default();
        for (id, rendered) in targets.iter().zip(results) {
            match rendered.source {
                Source::Fresh | Source::Cache | Source::Memory => summary.refreshed += 1,
                Source::Fallback | Source::Miss => {
                    debug!("Background refresh of {} served {}", id, rendered.source);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Run until `cancel` fires. The first pass runs immediately.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Background refresh every {}s", self.every.as_secs());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Background refresh stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let summary = self.refresh_all().await;
                        info!(
                            "Background refresh: {} refreshed, {} degraded",
                            summary.refreshed, summary.failed
                        );
                        if let Some(store) = &self.sweep {
                            store.cleanup_expired();
                        }
                    }
                }
            }
        })
    }
}
