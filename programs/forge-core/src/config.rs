use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{BPS_SCALE, MAX_POSITIONS_PER_OWNER};
use crate::error::{ForgeError, ForgeResult};

const MAX_POSITIONS_LIMIT: u64 = 1_000;
const MAX_TRANSACTION_WINDOW: usize = 100_000;

/// Engine tunables. Fee rates live in `constants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub min_open_health: f64,
    pub warning_health: f64,
    pub liquidation_health: f64,
    pub max_positions_per_owner: u64,
    /// Most-recent transactions kept per owner.
    pub transaction_window: usize,
    pub lp_tolerance_bps: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_retries: u32,
    pub settlement_timeout_secs: u64,
    /// USDC units the lending pool never lends out.
    pub minimum_reserve: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_open_health: 1.2,
            warning_health: 1.5,
            liquidation_health: 1.0,
            max_positions_per_owner: MAX_POSITIONS_PER_OWNER,
            transaction_window: 100,
            lp_tolerance_bps: 100,
            reconcile_interval_secs: 30,
            reconcile_retries: 3,
            settlement_timeout_secs: 30,
            minimum_reserve: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> ForgeResult<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ForgeResult<()> {
        let finite = [self.min_open_health, self.warning_health, self.liquidation_health]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0);
        if !finite {
            return Err(ForgeError::InvalidConfig(
                "health thresholds must be positive and finite".into(),
            ));
        }
        if self.liquidation_health > self.warning_health
            || self.liquidation_health > self.min_open_health
        {
            return Err(ForgeError::InvalidConfig(format!(
                "liquidation health {} must not exceed warning {} or open floor {}",
                self.liquidation_health, self.warning_health, self.min_open_health
            )));
        }
        if self.max_positions_per_owner == 0 || self.max_positions_per_owner > MAX_POSITIONS_LIMIT {
            return Err(ForgeError::InvalidConfig(format!(
                "max_positions_per_owner must be in 1..={}",
                MAX_POSITIONS_LIMIT
            )));
        }
        if self.transaction_window == 0 || self.transaction_window > MAX_TRANSACTION_WINDOW {
            return Err(ForgeError::InvalidConfig(format!(
                "transaction_window must be in 1..={}",
                MAX_TRANSACTION_WINDOW
            )));
        }
        if self.lp_tolerance_bps > BPS_SCALE {
            return Err(ForgeError::InvalidConfig(format!(
                "lp_tolerance_bps {} exceeds {}",
                self.lp_tolerance_bps, BPS_SCALE
            )));
        }
        if self.reconcile_interval_secs == 0 || self.settlement_timeout_secs == 0 {
            return Err(ForgeError::InvalidConfig(
                "reconcile interval and settlement timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }
}
