//! Provider Registry - thread-safe provider storage and budget accounting

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

use crate::clock::Clock;
use crate::error::{BalancerError, Result};
use crate::strategies::SelectionStrategy;
use crate::types::{
    BalancerRequest, HealthUpdate, Provider, ProviderId, ProviderSpec, Selection,
};

/// Smoothing factor for the request error rate
const ERROR_RATE_ALPHA: f64 = 0.2;

/// In-memory provider set, kept in registration order.
///
/// Every read-modify-write of rate counters or health happens under the
/// write guard, so concurrent callers never lose an update.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Provider>>>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

fn is_eligible(provider: &Provider, request: &BalancerRequest) -> bool {
    provider.is_active
        && provider.health.is_healthy
        && provider.supports(&request.model)
        && provider.rate_limit.admits(request)
}

impl ProviderRegistry {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            providers: Arc::new(RwLock::new(Vec::new())),
            clock,
            window,
        }
    }

    /// Reject specs the engine could never route to
    pub fn validate_spec(spec: &ProviderSpec) -> Result<()> {
        let invalid = |reason: String| Err(BalancerError::Configuration(reason));

        if spec.name.trim().is_empty() {
            return invalid("provider name is required".to_string());
        }
        if spec.kind.requires_credential() && spec.credential.trim().is_empty() {
            return invalid(format!(
                "provider {} of kind {} requires a credential",
                spec.name, spec.kind
            ));
        }
        match Url::parse(&spec.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return invalid(format!(
                    "provider {} endpoint has unsupported scheme {}",
                    spec.name,
                    url.scheme()
                ))
            }
            Err(e) => {
                return invalid(format!("provider {} endpoint is invalid: {e}", spec.name))
            }
        }
        if !(1..=10).contains(&spec.priority) {
            return invalid(format!(
                "provider {} priority {} outside 1-10",
                spec.name, spec.priority
            ));
        }
        if spec.requests_per_minute == 0 || spec.tokens_per_minute == 0 {
            return invalid(format!(
                "provider {} needs non-zero request and token budgets",
                spec.name
            ));
        }
        if spec.models.is_empty() {
            return invalid(format!("provider {} lists no models", spec.name));
        }
        if spec.cost.input_cost_per_1m_tokens < 0.0 || spec.cost.output_cost_per_1m_tokens < 0.0 {
            return invalid(format!("provider {} has a negative cost", spec.name));
        }
        Ok(())
    }

    /// Validate, assign an id and append. Returns the stored record.
    pub async fn add(&self, spec: ProviderSpec) -> Result<Provider> {
        Self::validate_spec(&spec)?;
        let provider = Provider::from_spec(ProviderId::new(), spec, self.clock.now());

        info!(
            provider_id = %provider.id,
            name = %provider.name,
            kind = provider.kind.as_str(),
            models = provider.models.len(),
            "Registered provider"
        );
        self.providers.write().await.push(provider.clone());
        Ok(provider)
    }

    /// Replace the provider set with records loaded from the store
    pub async fn load(&self, providers: Vec<Provider>) {
        debug!("Loading {} providers into registry", providers.len());
        *self.providers.write().await = providers;
    }

    /// Providers that could take `request` right now, in registration order.
    ///
    /// Expired windows are reset on the way, which is why this takes the
    /// write guard.
    pub async fn get_available_providers(&self, request: &BalancerRequest) -> Vec<Provider> {
        let now = self.clock.now();
        let mut providers = self.providers.write().await;
        providers
            .iter_mut()
            .filter_map(|provider| {
                provider.rate_limit.reset_if_expired(now, self.window);
                is_eligible(provider, request).then(|| provider.clone())
            })
            .collect()
    }

    /// Select and charge in one guarded step
    pub async fn reserve(
        &self,
        request: &BalancerRequest,
        strategy: &dyn SelectionStrategy,
    ) -> Result<Selection> {
        let now = self.clock.now();
        let mut providers = self.providers.write().await;

        let mut candidates = Vec::new();
        for provider in providers.iter_mut() {
            provider.rate_limit.reset_if_expired(now, self.window);
            if is_eligible(provider, request) {
                candidates.push(provider.clone());
            }
        }

        let selection = strategy
            .select(&candidates, request)
            .ok_or_else(|| BalancerError::NoAvailableProviders {
                model: request.model.clone(),
            })?;

        let chosen = providers
            .iter_mut()
            .find(|p| p.id == selection.provider.id)
            .ok_or(BalancerError::ProviderNotFound(selection.provider.id))?;
        chosen.rate_limit.charge(request);

        trace!(
            provider_id = %chosen.id,
            requests = chosen.rate_limit.current_requests,
            tokens = chosen.rate_limit.current_tokens,
            "Charged provider budget"
        );
        Ok(selection)
    }

    /// Apply `update` to one provider under the write guard
    pub async fn modify<F>(&self, id: ProviderId, update: F) -> Result<Provider>
    where
        F: FnOnce(&mut Provider),
    {
        let mut providers = self.providers.write().await;
        let provider = providers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(BalancerError::ProviderNotFound(id))?;
        update(provider);
        Ok(provider.clone())
    }

    pub async fn charge_provider(
        &self,
        id: ProviderId,
        request: &BalancerRequest,
    ) -> Result<Provider> {
        self.modify(id, |provider| provider.rate_limit.charge(request))
            .await
    }

    pub async fn update_provider_health(
        &self,
        id: ProviderId,
        update: &HealthUpdate,
    ) -> Result<Provider> {
        self.modify(id, |provider| provider.health.apply(update))
            .await
    }

    pub async fn set_provider_active(&self, id: ProviderId, active: bool) -> Result<Provider> {
        let provider = self
            .modify(id, |provider| provider.is_active = active)
            .await?;
        info!(provider_id = %id, active, "Provider activation changed");
        Ok(provider)
    }

    /// Fold one request outcome into the smoothed error rate
    pub async fn record_outcome(&self, id: ProviderId, success: bool) -> Result<Provider> {
        self.modify(id, |provider| {
            let sample = if success { 0.0 } else { 100.0 };
            let health = &mut provider.health;
            health.error_rate =
                ERROR_RATE_ALPHA * sample + (1.0 - ERROR_RATE_ALPHA) * health.error_rate;
        })
        .await
    }

    /// Unconditionally reset every provider's window. Returns how many
    /// providers were reset.
    pub async fn reset_all_windows(&self) -> usize {
        let now = self.clock.now();
        let mut providers = self.providers.write().await;
        for provider in providers.iter_mut() {
            provider.rate_limit.reset(now);
        }
        providers.len()
    }

    pub async fn provider(&self, id: ProviderId) -> Option<Provider> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub async fn list_providers(&self) -> Vec<Provider> {
        self.providers.read().await.clone()
    }

    /// Like [`list_providers`](Self::list_providers), but windows that
    /// have expired read as empty. Stored counters are left alone.
    pub async fn current_view(&self) -> Vec<Provider> {
        let now = self.clock.now();
        let mut providers = self.list_providers().await;
        for provider in &mut providers {
            provider.rate_limit.reset_if_expired(now, self.window);
        }
        providers
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
