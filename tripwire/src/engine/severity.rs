// tripwire/src/engine/severity.rs
//
// Static detection-type → severity weight table, built once from config.
// Every row carries two weights: the one used when ground truth confirmed
// the detection, and a strictly lower one for a bare client claim.

use std::collections::HashMap;

use crate::config::{SeverityConfig, SeverityWeight};
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct SeverityTable {
    default: SeverityWeight,
    types:   HashMap<String, SeverityWeight>,
}

impl SeverityTable {
    pub fn from_config(cfg: &SeverityConfig) -> Result<Self, ConfigError> {
        check_row("default", &cfg.default)?;
        for (name, w) in &cfg.types {
            check_row(name, w)?;
        }
        Ok(Self { default: cfg.default, types: cfg.types.clone() })
    }

    /// Weight for `detection_type`, falling back to the default row for unknown types.
    pub fn weight(&self, detection_type: &str, server_validated: bool) -> f32 {
        let row = self.types.get(detection_type).unwrap_or(&self.default);
        if server_validated { row.validated } else { row.unvalidated }
    }

    pub fn is_known(&self, detection_type: &str) -> bool {
        self.types.contains_key(detection_type)
    }
}

fn check_row(name: &str, w: &SeverityWeight) -> Result<(), ConfigError> {
    if !w.validated.is_finite() || !w.unvalidated.is_finite() || w.unvalidated < 0.0 {
        return Err(ConfigError::Invalid(format!("severity row '{}' has invalid weights", name)));
    }
    let zero_row = w.validated == 0.0 && w.unvalidated == 0.0;
    if !zero_row && w.unvalidated >= w.validated {
        return Err(ConfigError::Invalid(format!(
            "severity row '{}': unvalidated weight {} must be lower than validated weight {}",
            name, w.unvalidated, w.validated
        )));
    }
    Ok(())
}
