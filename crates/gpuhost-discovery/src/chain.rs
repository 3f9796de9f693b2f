use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Attempt, DiscoveryError};
use crate::strategy::{
    AlternateListing, DiscoveryStrategy, Endpoint, LogScan, ProbeContext, ProbeOutcome,
    SocketTable, StructuredListing,
};

/// Ordered fallback chain; the first strategy that finds the port wins
pub struct EndpointDiscovery {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
    retries: u32,
    retry_delay: Duration,
}

impl Default for EndpointDiscovery {
    fn default() -> Self {
        Self::new(vec![
            Box::new(StructuredListing),
            Box::new(AlternateListing),
            Box::new(SocketTable),
            Box::new(LogScan),
        ])
    }
}

impl EndpointDiscovery {
    pub fn new(strategies: Vec<Box<dyn DiscoveryStrategy>>) -> Self {
        Self {
            strategies,
            retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    /// Rerun the whole chain up to `retries` more times while the service is still starting
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn discover(&self, ctx: &ProbeContext<'_>) -> Result<Endpoint, DiscoveryError> {
        if self.strategies.is_empty() {
            return Err(DiscoveryError::NoStrategies);
        }

        let mut attempts = Vec::new();
        for pass in 0..=self.retries {
            if pass > 0 {
                debug!(pass, delay = ?self.retry_delay, "Retrying endpoint discovery");
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.run_chain(ctx, &mut attempts).await {
                Some(endpoint) => return Ok(endpoint),
                None => continue,
            }
        }

        warn!(
            container = %ctx.container_id,
            attempts = attempts.len(),
            "Endpoint discovery exhausted"
        );
        Err(DiscoveryError::Exhausted { attempts })
    }

    async fn run_chain(
        &self,
        ctx: &ProbeContext<'_>,
        attempts: &mut Vec<Attempt>,
    ) -> Option<Endpoint> {
        for strategy in &self.strategies {
            match strategy.probe(ctx).await {
                ProbeOutcome::Found(endpoint) => {
                    info!(
                        container = %ctx.container_id,
                        strategy = strategy.name(),
                        endpoint = %endpoint,
                        "Discovered service endpoint"
                    );
                    return Some(endpoint);
                }
                ProbeOutcome::NotFound(diagnostic) => {
                    debug!(strategy = strategy.name(), %diagnostic, "Strategy found nothing");
                    attempts.push(Attempt {
                        strategy: strategy.name().to_string(),
                        diagnostic,
                    });
                }
            }
        }
        None
    }
}
