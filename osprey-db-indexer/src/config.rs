//! Coordinator configuration and the two-phase feature gate.

use serde::{Deserialize, Serialize};

/// Feature compatibility version of the deployment.
///
/// Two-phase index builds require every member to understand the
/// `startIndexBuild`/`commitIndexBuild` record shapes, so they are gated on
/// the fully-upgraded version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureVersion {
    /// Downgraded / mixed-version deployment
    V42,
    /// Fully upgraded deployment
    V44,
}

/// Configuration for the index build coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Process-wide switch for the two-phase protocol
    pub two_phase_enabled: bool,
    /// Deployment feature compatibility version
    pub feature_compat: FeatureVersion,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            two_phase_enabled: true,
            feature_compat: FeatureVersion::V44,
        }
    }
}

impl CoordinatorConfig {
    /// Configuration forcing the single-phase protocol.
    pub fn single_phase() -> Self {
        CoordinatorConfig {
            two_phase_enabled: false,
            feature_compat: FeatureVersion::V44,
        }
    }

    /// True when new builds may use the two-phase protocol.
    ///
    /// Both the switch and the fully-upgraded feature version are required.
    pub fn supports_two_phase(&self) -> bool {
        self.two_phase_enabled && self.feature_compat == FeatureVersion::V44
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_phase_requires_flag_and_version() {
        assert!(CoordinatorConfig::default().supports_two_phase());
        assert!(!CoordinatorConfig::single_phase().supports_two_phase());
        let downgraded = CoordinatorConfig {
            two_phase_enabled: true,
            feature_compat: FeatureVersion::V42,
        };
        assert!(!downgraded.supports_two_phase());
    }
}
