//! Static strategy configuration, owned by the business layer and looked up by id.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::market::Timeframe;
use crate::error::Result;

/// Risk parameters handed to a strategy worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Maximum position size in quote currency
    pub max_position_size: Decimal,
    /// Stop loss as a fraction (0.02 = 2%)
    pub stop_loss_pct: Decimal,
    /// Take profit as a fraction
    pub take_profit_pct: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::from(100),
            stop_loss_pct: Decimal::new(2, 2),
            take_profit_pct: Decimal::new(4, 2),
        }
    }
}

/// Strategy configuration as looked up at start and recovery time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub risk: RiskParams,
    /// Strategy-specific parameters (indicator periods etc.)
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_active() -> bool {
    true
}

/// Lookup of static strategy configuration
#[async_trait]
pub trait StrategyCatalog: Send + Sync {
    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyConfig>>;
}

/// Catalog backed by a fixed list, loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    strategies: HashMap<String, StrategyConfig>,
}

impl StaticCatalog {
    pub fn new(strategies: impl IntoIterator<Item = StrategyConfig>) -> Self {
        Self {
            strategies: strategies.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[async_trait]
impl StrategyCatalog for StaticCatalog {
    async fn get(&self, strategy_id: &str) -> Result<Option<StrategyConfig>> {
        Ok(self.strategies.get(strategy_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog_lookup() {
        let catalog = StaticCatalog::new(vec![StrategyConfig {
            id: "ema-btc".into(),
            name: "EMA cross BTC".into(),
            active: true,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            risk: RiskParams::default(),
            params: serde_json::Value::Null,
        }]);

        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("ema-btc").await.unwrap().is_some());
        assert!(catalog.get("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_active_defaults_true() {
        let cfg: StrategyConfig = serde_json::from_str(
            r#"{"id":"a","name":"A","symbol":"ETHUSDT","timeframe":"15m"}"#,
        )
        .unwrap();
        assert!(cfg.active);
        assert_eq!(cfg.timeframe, Timeframe::M15);
    }
}
