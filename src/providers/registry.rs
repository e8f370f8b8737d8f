use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::alldebrid::AllDebridProvider;
use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::debridlink::DebridLinkProvider;
use super::direct::DirectProvider;
use super::megadebrid::MegaDebridProvider;
use super::premiumize::PremiumizeProvider;
use super::realdebrid::RealDebridProvider;
use super::torbox::TorBoxProvider;
use super::ytdlp::YtDlpProvider;
use super::{ConfigField, Headers, Provider, ProviderError, ProviderKind, ResolveResult};
use crate::models::{AccountInfo, ProviderRecord};

pub const DEFAULT_RATE_LIMIT: u32 = 5;

/// Spaces calls at least `1/rate` apart, with a burst of one.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next: Mutex<Instant>,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / rate.max(1),
            next: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let mut next = self.next.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = (*next).max(now) + self.interval;
    }
}

struct Entry {
    provider: Arc<dyn Provider>,
    enabled: AtomicBool,
    priority: AtomicI32,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

impl Entry {
    fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Provider as listed over the API. `config` and `account` are filled in from
/// the stored record by the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub enabled: bool,
    pub priority: i32,
    pub configured: bool,
    pub supports_magnets: bool,
    pub circuit: CircuitState,
    pub config: BTreeMap<String, String>,
    pub config_schema: Vec<ConfigField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Entry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DirectProvider::new()));
        registry.register(Arc::new(AllDebridProvider::new()));
        registry.register(Arc::new(RealDebridProvider::new()));
        registry.register(Arc::new(DebridLinkProvider::new()));
        registry.register(Arc::new(PremiumizeProvider::new()));
        registry.register(Arc::new(TorBoxProvider::new()));
        registry.register(Arc::new(MegaDebridProvider::new()));
        registry.register(Arc::new(YtDlpProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let priority = provider.priority();
        self.entries.retain(|e| e.provider.name() != provider.name());
        self.entries.push(Entry {
            provider,
            enabled: AtomicBool::new(true),
            priority: AtomicI32::new(priority),
            breaker: CircuitBreaker::default(),
            limiter: RateLimiter::per_second(DEFAULT_RATE_LIMIT),
        });
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.provider.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entry(name).map(|e| e.provider.clone())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.provider.name()).collect()
    }

    pub fn summary(&self, name: &str) -> Option<ProviderSummary> {
        let entry = self.entry(name)?;
        let p = &entry.provider;
        Some(ProviderSummary {
            name: p.name().to_string(),
            display_name: p.display_name().to_string(),
            kind: p.kind(),
            enabled: entry.enabled(),
            priority: entry.priority(),
            configured: p.is_configured(),
            supports_magnets: p.supports_magnets(),
            circuit: entry.breaker.state(),
            config: BTreeMap::new(),
            config_schema: p.config_schema(),
            account: None,
        })
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        let mut list: Vec<_> = self
            .entries
            .iter()
            .filter_map(|e| self.summary(e.provider.name()))
            .collect();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.name.cmp(&b.name)));
        list
    }

    /// Applies a stored record: enabled flag, priority override and config.
    pub async fn apply_record(&self, record: &ProviderRecord) -> Result<(), ProviderError> {
        let entry = self
            .entry(&record.name)
            .ok_or_else(|| ProviderError::NotFound(record.name.clone()))?;
        entry.enabled.store(record.enabled, Ordering::Relaxed);
        if record.priority > 0 {
            entry.priority.store(record.priority, Ordering::Relaxed);
        }
        entry.provider.configure(&record.config).await
    }

    /// Drops stored config and restores the provider's defaults.
    pub async fn reset(&self, name: &str) -> Result<(), ProviderError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        entry.enabled.store(true, Ordering::Relaxed);
        entry
            .priority
            .store(entry.provider.priority(), Ordering::Relaxed);
        entry.provider.configure(&BTreeMap::new()).await
    }

    fn usable(&self) -> Vec<&Entry> {
        let mut list: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| e.enabled() && e.provider.is_configured())
            .collect();
        list.sort_by_key(|e| std::cmp::Reverse(e.priority()));
        list
    }

    pub fn is_supported(&self, url: &str) -> bool {
        self.usable().iter().any(|e| e.provider.supports(url))
    }

    /// Enabled, configured providers that can cache magnets, best first.
    pub fn magnet_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.usable()
            .into_iter()
            .filter(|e| e.provider.supports_magnets())
            .map(|e| e.provider.clone())
            .collect()
    }

    /// Runs `url` through every usable provider, highest priority first.
    /// Returns the first success together with the provider's name.
    pub async fn resolve(
        &self,
        url: &str,
        headers: &Headers,
    ) -> Result<(ResolveResult, String), ProviderError> {
        for entry in self.usable() {
            let provider = &entry.provider;
            if !provider.supports(url) {
                continue;
            }
            if !entry.breaker.allow() {
                debug!("provider {} skipped, circuit open", provider.name());
                continue;
            }
            entry.limiter.acquire().await;
            match provider.resolve(url, headers).await {
                Ok(result) => {
                    entry.breaker.record_success();
                    return Ok((result, provider.name().to_string()));
                }
                Err(err) => {
                    entry.breaker.record_failure();
                    warn!("provider {} failed to resolve {url}: {err}", provider.name());
                }
            }
        }
        Err(ProviderError::NoProvider)
    }

    /// Calls `test` through the provider's breaker and limiter.
    pub async fn test(&self, name: &str) -> Result<AccountInfo, ProviderError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
        if !entry.breaker.allow() {
            return Err(ProviderError::CircuitOpen(name.to_string()));
        }
        entry.limiter.acquire().await;
        let result = entry.provider.test().await;
        match &result {
            Ok(_) => entry.breaker.record_success(),
            Err(_) => entry.breaker.record_failure(),
        }
        result
    }
}
