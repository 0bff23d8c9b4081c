//! Per-timeline-class trim bounds.
//!
//! Timelines are bounded: once an append pushes a timeline past its class
//! upper bound, it is trimmed back down to the lower bound. The class of a
//! timeline is the name prefix before the first `:` (`home:42` is class
//! `home`), falling back to the default bounds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Inclusive length bounds for a timeline class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// Length a trim reduces the timeline to.
    pub lower: u64,
    /// Length past which a trim is scheduled.
    pub upper: u64,
}

impl Bounds {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            lower: 800,
            upper: 850,
        }
    }
}

/// Trim bounds per timeline class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub default: Bounds,
    pub bounds: HashMap<String, Bounds>,
}

impl TrimConfig {
    /// Resolve the bounds for a timeline name.
    pub fn bounds_for(&self, timeline: &str) -> Bounds {
        let class = timeline.split(':').next().unwrap_or(timeline);
        self.bounds.get(class).copied().unwrap_or(self.default)
    }

    /// Check the `0 < lower <= upper` invariant on every class.
    pub fn validate(&self) -> Result<(), String> {
        for (class, bounds) in self
            .bounds
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(std::iter::once(("default", &self.default)))
        {
            if bounds.lower == 0 || bounds.lower > bounds.upper {
                return Err(format!(
                    "invalid bounds for class {class:?}: lower {} upper {}",
                    bounds.lower, bounds.upper
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_resolution() {
        let mut cfg = TrimConfig::default();
        cfg.bounds.insert("mentions".into(), Bounds::new(100, 120));

        assert_eq!(cfg.bounds_for("mentions:7"), Bounds::new(100, 120));
        assert_eq!(cfg.bounds_for("home:7"), Bounds::default());
        assert_eq!(cfg.bounds_for("noclass"), Bounds::default());
    }

    #[test]
    fn validation() {
        let mut cfg = TrimConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.bounds.insert("bad".into(), Bounds::new(10, 5));
        assert!(cfg.validate().is_err());
        cfg.bounds.insert("bad".into(), Bounds::new(0, 5));
        assert!(cfg.validate().is_err());
    }
}
