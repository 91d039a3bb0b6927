//! Backoff before retrying a cross-site send after a link failure.
//!
//! Each `(cache, backup site)` pair owns its own [`BackOff`] instance, so a
//! slow site never throttles sends to a healthy one.

use crate::config::BackOffConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delay policy engaged after a transient send failure.
#[async_trait]
pub trait BackOff: Send + Sync {
    /// Wait before the next attempt. Each call may lengthen the next wait.
    async fn back_off(&self);

    /// Forget the failure history; the next wait starts from the shortest delay.
    fn reset(&self);
}

/// Creates one [`BackOff`] per backup site of a cache.
pub trait BackOffFactory: Send + Sync {
    /// Build the backoff instance for `site` of `cache`.
    fn create(&self, cache: &str, site: &str) -> Arc<dyn BackOff>;
}

impl<F> BackOffFactory for F
where
    F: Fn(&str, &str) -> Arc<dyn BackOff> + Send + Sync,
{
    fn create(&self, cache: &str, site: &str) -> Arc<dyn BackOff> {
        self(cache, site)
    }
}

/// Exponential backoff: the delay doubles on every call up to a ceiling.
///
/// With jitter enabled each wait is drawn uniformly from `[delay / 2, delay]`.
#[derive(Debug)]
pub struct ExponentialBackOff {
    initial: Duration,
    max: Duration,
    jitter: bool,
    current: Mutex<Duration>,
}

impl ExponentialBackOff {
    /// Create a backoff from its configuration.
    pub fn new(config: &BackOffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms.max(1));
        let max = Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms).max(1));
        Self {
            initial,
            max,
            jitter: config.jitter,
            current: Mutex::new(initial),
        }
    }

    /// Delay the next `back_off` call will use before jitter.
    pub fn current_delay(&self) -> Duration {
        *self.current.lock()
    }

    /// Take the current delay and double the stored one.
    fn next_delay(&self) -> Duration {
        let mut current = self.current.lock();
        let delay = *current;
        *current = (delay * 2).min(self.max);
        delay
    }
}

#[async_trait]
impl BackOff for ExponentialBackOff {
    async fn back_off(&self) {
        let mut delay = self.next_delay();
        if self.jitter {
            let millis = delay.as_millis() as u64;
            let low = millis / 2;
            delay = Duration::from_millis(rand::thread_rng().gen_range(low..=millis));
        }
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
    }

    fn reset(&self) {
        *self.current.lock() = self.initial;
    }
}

/// Backoff that never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackOff;

#[async_trait]
impl BackOff for NoBackOff {
    async fn back_off(&self) {
        tokio::task::yield_now().await;
    }

    fn reset(&self) {}
}

/// Factory building [`ExponentialBackOff`] instances from a default config
/// with optional per-site overrides.
#[derive(Debug, Clone)]
pub struct ExponentialBackOffFactory {
    default: BackOffConfig,
    overrides: Vec<(String, BackOffConfig)>,
}

impl ExponentialBackOffFactory {
    /// Create a factory with a default configuration.
    pub fn new(default: BackOffConfig) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    /// Use `config` for `site` instead of the default.
    pub fn with_override(mut self, site: impl Into<String>, config: BackOffConfig) -> Self {
        self.overrides.push((site.into(), config));
        self
    }
}

impl BackOffFactory for ExponentialBackOffFactory {
    fn create(&self, _cache: &str, site: &str) -> Arc<dyn BackOff> {
        let config = self
            .overrides
            .iter()
            .find(|(name, _)| name == site)
            .map(|(_, c)| c)
            .unwrap_or(&self.default);
        Arc::new(ExponentialBackOff::new(config))
    }
}
