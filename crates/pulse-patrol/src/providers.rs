//! Collaborators the patrol engine reads from but does not own

use chrono::{DateTime, Utc};
use pulse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Aggregate LLM spend gate
pub trait CostTracker: Send + Sync {
    /// `Err(Unavailable)` with a reason when `use_case` may not spend
    fn check_budget(&self, use_case: &str) -> Result<()>;
    fn record_usage(&self, use_case: &str, input_tokens: u64, output_tokens: u64);
}

/// In-memory token budget; `None` means unlimited
#[derive(Debug, Default)]
pub struct TokenBudget {
    limit: Option<u64>,
    used: Mutex<HashMap<String, u64>>,
}

impl TokenBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }

    pub fn total_used(&self) -> u64 {
        self.lock().values().sum()
    }

    pub fn used(&self, use_case: &str) -> u64 {
        self.lock().get(use_case).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CostTracker for TokenBudget {
    fn check_budget(&self, use_case: &str) -> Result<()> {
        match self.limit {
            Some(limit) if self.total_used() >= limit => Err(Error::unavailable(format!(
                "{} skipped: token budget of {} exhausted",
                use_case, limit
            ))),
            _ => Ok(()),
        }
    }

    fn record_usage(&self, use_case: &str, input_tokens: u64, output_tokens: u64) {
        *self.lock().entry(use_case.to_string()).or_default() += input_tokens + output_tokens;
    }
}

/// What is known about a guest beyond the collector snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestIntel {
    /// Service discovered running inside, if any
    pub service_name: String,
    /// Ping result; `None` when the guest was not probed
    pub reachable: Option<bool>,
}

pub trait GuestIntelProvider: Send + Sync {
    /// Keyed by guest id
    fn guest_intel(&self) -> HashMap<String, GuestIntel>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityForecast {
    pub resource_id: String,
    pub resource_name: String,
    pub metric: String,
    pub current: f64,
    /// Projected value in 30 days
    pub predicted: f64,
    pub days_to_full: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceChange {
    pub resource_id: String,
    pub resource_name: String,
    pub description: String,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Correlation {
    pub source: String,
    pub target: String,
    pub description: String,
    pub confidence: f64,
}

/// Derived fleet knowledge; every source is optional
pub trait FleetIntelligence: Send + Sync {
    fn forecasts(&self) -> Vec<CapacityForecast> {
        Vec::new()
    }

    fn recent_changes(&self) -> Vec<ResourceChange> {
        Vec::new()
    }

    fn correlations(&self) -> Vec<Correlation> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_refuses_once_spent() {
        let budget = TokenBudget::new(Some(1000));
        assert!(budget.check_budget("patrol").is_ok());
        budget.record_usage("patrol", 700, 250);
        assert!(budget.check_budget("patrol").is_ok());
        budget.record_usage("chat", 40, 10);
        let err = budget.check_budget("patrol").unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(budget.used("patrol"), 950);
    }

    #[test]
    fn test_unlimited_budget() {
        let budget = TokenBudget::default();
        budget.record_usage("patrol", u32::MAX as u64, 0);
        assert!(budget.check_budget("patrol").is_ok());
    }
}
