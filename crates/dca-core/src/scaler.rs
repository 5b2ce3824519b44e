//! Feature scaler: standardizes the six numerical flow features before they
//! reach the autoencoders (see spec §4.2). Persisted as a small JSON sidecar
//! trained offline; the pipeline only ever reads it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DcaError;
use crate::types::FeatureVector;

/// Per-feature mean/scale pair, matching scikit-learn's `StandardScaler`
/// convention (`scale` is the standard deviation, already guarded against 0).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureStat {
    pub mean: f64,
    pub scale: f64,
}

/// Standardizes the six numerical features (spkts..dmean) of a flow's
/// feature vector; the two one-hot protocol components pass through
/// unscaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    stats: [FeatureStat; 6],
}

impl FeatureScaler {
    pub fn load(path: &Path) -> Result<Self, DcaError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DcaError::Startup(format!("cannot read scaler at {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| DcaError::Startup(format!("malformed scaler at {}: {e}", path.display())))
    }

    /// Scales the first six components of `features` in place, leaving the
    /// `is_tcp`/`is_udp` indicator components (6, 7) untouched.
    pub fn transform(&self, features: &FeatureVector) -> FeatureVector {
        let mut out = *features;
        for i in 0..6 {
            let stat = self.stats[i];
            out[i] = (features[i] - stat.mean) / stat.scale;
        }
        out
    }

    /// Inverse of [`FeatureScaler::transform`], used only by tests to check
    /// the round-trip property.
    pub fn inverse_transform(&self, scaled: &FeatureVector) -> FeatureVector {
        let mut out = *scaled;
        for i in 0..6 {
            let stat = self.stats[i];
            out[i] = scaled[i] * stat.scale + stat.mean;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_scaler() -> FeatureScaler {
        FeatureScaler {
            stats: [FeatureStat { mean: 0.0, scale: 1.0 }; 6],
        }
    }

    #[test]
    fn identity_scaler_is_a_no_op_on_numerical_components() {
        let scaler = identity_scaler();
        let features: FeatureVector = [10.0, 5.0, 1200.0, 600.0, 120.0, 120.0, 1.0, 0.0];
        let scaled = scaler.transform(&features);
        assert_eq!(scaled, features);
    }

    #[test]
    fn protocol_indicators_never_scaled() {
        let scaler = FeatureScaler {
            stats: [FeatureStat { mean: 5.0, scale: 2.0 }; 6],
        };
        let features: FeatureVector = [10.0, 5.0, 1200.0, 600.0, 120.0, 120.0, 1.0, 0.0];
        let scaled = scaler.transform(&features);
        assert_eq!(scaled[6], 1.0);
        assert_eq!(scaled[7], 0.0);
    }

    #[test]
    fn transform_then_inverse_round_trips() {
        let scaler = FeatureScaler {
            stats: [
                FeatureStat { mean: 3.0, scale: 1.5 },
                FeatureStat { mean: 2.0, scale: 0.5 },
                FeatureStat { mean: 500.0, scale: 120.0 },
                FeatureStat { mean: 400.0, scale: 90.0 },
                FeatureStat { mean: 80.0, scale: 20.0 },
                FeatureStat { mean: 70.0, scale: 15.0 },
            ],
        };
        let features: FeatureVector = [10.0, 5.0, 1200.0, 600.0, 120.0, 90.0, 1.0, 0.0];
        let scaled = scaler.transform(&features);
        let restored = scaler.inverse_transform(&scaled);
        for i in 0..8 {
            assert!((restored[i] - features[i]).abs() < 1e-9);
        }
    }
}
