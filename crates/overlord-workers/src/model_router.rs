//! Tiered model routing over the `models:` config section, independent of
//! the subprocess/HTTP/SDK [`crate::Worker`] backends: this is the routing
//! table the dispatch engine's plan-executor consults when a step names a
//! `model_tier` instead of being dispatched straight to a configured worker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use overlord_config::OverlordConfig;
use overlord_types::Tier;

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

struct HealthState {
    last_check: Option<Instant>,
    healthy: bool,
}

/// A single named LLM endpoint loaded from config, with its own cached
/// health state.
pub struct ModelEndpoint {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    pub tier: Tier,
    pub concurrent: u32,
    pub health_check_url: Option<String>,
    health: Mutex<HealthState>,
}

impl ModelEndpoint {
    fn new(name: String, endpoint: String, model: String, tier: Tier, concurrent: u32, health_check_url: Option<String>) -> Self {
        Self {
            name,
            endpoint,
            model,
            tier,
            concurrent,
            health_check_url,
            health: Mutex::new(HealthState { last_check: None, healthy: true }),
        }
    }
}

/// Routes a task to a healthy endpoint for its inferred tier, falling back
/// across tiers when the preferred one has nothing healthy.
pub struct ModelRouter {
    endpoints: HashMap<String, ModelEndpoint>,
}

impl ModelRouter {
    /// Parses `config.models` into endpoints. Entries with an empty
    /// endpoint/model are kept (selection just won't pick a usable one) —
    /// config validation is `overlord-config`'s job, not this router's.
    pub fn new(config: &OverlordConfig) -> Self {
        let endpoints = config
            .models
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    ModelEndpoint::new(
                        name.clone(),
                        cfg.endpoint.clone(),
                        cfg.model.clone(),
                        cfg.tier,
                        cfg.concurrent,
                        cfg.health_check_url.clone(),
                    ),
                )
            })
            .collect();
        Self { endpoints }
    }

    /// Selects the best available endpoint for `task_type`/`complexity`,
    /// preferring endpoints literally named `"local"` first when
    /// `prefer_local` is set. Falls back across tiers before giving up.
    pub fn select_model(&self, task_type: &str, complexity: &str, prefer_local: bool) -> Option<&ModelEndpoint> {
        if self.endpoints.is_empty() {
            tracing::warn!("no models configured");
            return None;
        }

        let target_tier = infer_tier(task_type, complexity);
        if let Some(ep) = self.healthy_endpoint_for_tier(target_tier, prefer_local) {
            tracing::info!(endpoint = %ep.name, tier = %ep.tier, "selected model");
            return Some(ep);
        }

        for tier in fallback_order(target_tier, prefer_local) {
            if let Some(ep) = self.healthy_endpoint_for_tier(*tier, prefer_local) {
                tracing::warn!(tier = %target_tier, fallback = %ep.name, "tier unavailable, falling back");
                return Some(ep);
            }
        }

        tracing::error!("no healthy endpoints available");
        None
    }

    fn healthy_endpoint_for_tier(&self, tier: Tier, prefer_local: bool) -> Option<&ModelEndpoint> {
        let mut candidates: Vec<&ModelEndpoint> =
            self.endpoints.values().filter(|ep| ep.tier == tier).collect();
        candidates.sort_by_key(|ep| (prefer_local && ep.endpoint != "local", ep.name.clone()));
        candidates.into_iter().find(|ep| self.is_healthy(ep))
    }

    /// Local endpoints (no `health_check_url`) are assumed healthy. Remote
    /// health checks are cached for 60s.
    /// TODO: wire up a real HTTP probe against `health_check_url`.
    fn is_healthy(&self, endpoint: &ModelEndpoint) -> bool {
        let mut state = endpoint.health.lock().unwrap();
        if let Some(last) = state.last_check {
            if last.elapsed() < HEALTH_CACHE_TTL {
                return state.healthy;
            }
        }
        state.healthy = true;
        state.last_check = Some(Instant::now());
        state.healthy
    }

    /// Forces every endpoint's cached health state to be re-evaluated on
    /// next use.
    pub fn refresh_health(&self) {
        for endpoint in self.endpoints.values() {
            let mut state = endpoint.health.lock().unwrap();
            state.last_check = None;
        }
        for endpoint in self.endpoints.values() {
            self.is_healthy(endpoint);
        }
    }

    pub fn get_tier_summary(&self) -> HashMap<Tier, Vec<String>> {
        let mut summary: HashMap<Tier, Vec<String>> =
            [(Tier::Local, vec![]), (Tier::CloudFast, vec![]), (Tier::CloudHeavy, vec![])].into();
        for endpoint in self.endpoints.values() {
            summary.entry(endpoint.tier).or_default().push(endpoint.name.clone());
        }
        summary
    }
}

fn infer_tier(task_type: &str, complexity: &str) -> Tier {
    match task_type {
        "format" | "lint" | "boilerplate" => Tier::Local,
        "feature" => match complexity {
            "low" | "medium" => Tier::Local,
            _ => Tier::CloudFast,
        },
        "review" => Tier::CloudFast,
        "architecture" | "planning" => Tier::CloudHeavy,
        _ => Tier::CloudFast,
    }
}

fn fallback_order(preferred: Tier, prefer_local: bool) -> &'static [Tier] {
    match preferred {
        Tier::Local => &[Tier::CloudFast, Tier::CloudHeavy],
        Tier::CloudFast => {
            if prefer_local {
                &[Tier::Local, Tier::CloudHeavy]
            } else {
                &[Tier::CloudHeavy, Tier::Local]
            }
        }
        Tier::CloudHeavy => &[Tier::CloudFast, Tier::Local],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_config::ModelEndpointConfig;

    fn config(models: Vec<(&str, &str, Tier)>) -> OverlordConfig {
        use overlord_config::{AutonomyConfig, CostControlConfig, NotificationConfig, ScheduleConfig};
        let models = models
            .into_iter()
            .map(|(name, endpoint, tier)| {
                (
                    name.to_string(),
                    ModelEndpointConfig {
                        endpoint: endpoint.to_string(),
                        model: "some-model".to_string(),
                        tier,
                        concurrent: 1,
                        health_check_url: None,
                    },
                )
            })
            .collect();
        OverlordConfig {
            workspace_root: None,
            projects: HashMap::new(),
            autonomy: AutonomyConfig::default(),
            models,
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        }
    }

    #[test]
    fn selects_local_for_mechanical_tasks() {
        let config = config(vec![("ollama", "local", Tier::Local), ("claude", "https://api.anthropic.com", Tier::CloudFast)]);
        let router = ModelRouter::new(&config);
        let ep = router.select_model("format", "medium", true).unwrap();
        assert_eq!(ep.name, "ollama");
    }

    #[test]
    fn falls_back_across_tiers_when_preferred_tier_missing() {
        let config = config(vec![("claude", "https://api.anthropic.com", Tier::CloudFast)]);
        let router = ModelRouter::new(&config);
        let ep = router.select_model("architecture", "high", true).unwrap();
        assert_eq!(ep.name, "claude");
    }

    #[test]
    fn no_models_configured_returns_none() {
        let config = config(vec![]);
        let router = ModelRouter::new(&config);
        assert!(router.select_model("feature", "medium", true).is_none());
    }

    #[test]
    fn prefer_local_sorts_local_endpoint_first() {
        let config = config(vec![("aaa-cloud", "https://example.com", Tier::Local), ("local", "local", Tier::Local)]);
        let router = ModelRouter::new(&config);
        let ep = router.select_model("format", "low", true).unwrap();
        assert_eq!(ep.name, "local");
    }
}
