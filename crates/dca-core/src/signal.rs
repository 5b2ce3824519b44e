//! Signal extraction: two autoencoders reduce each flow's scaled feature
//! vector to a PAMP (danger) and SAFE signal via reconstruction error (see
//! spec §4.2). Both models are loaded once at startup, never per-call.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use tracing::debug;

use crate::types::FeatureVector;

/// Symmetric encoder/decoder autoencoder: `8 -> hidden -> 8`.
///
/// All eight feature-vector components — the six scaled numerical features
/// plus the `is_tcp`/`is_udp` indicators — are the reconstruction target,
/// matching the original's `m(data)` scoring the full feature vector.
#[derive(Debug)]
pub struct Autoencoder {
    encoder: Linear,
    decoder: Linear,
    device: Device,
}

const FEATURE_DIM: usize = 8;

impl Autoencoder {
    /// Loads weights from a `.safetensors` file produced by offline training.
    /// Expects variable names `encoder.weight`/`encoder.bias` and
    /// `decoder.weight`/`decoder.bias`.
    pub fn load(path: &Path, hidden_size: usize, device: Device) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], DType::F32, &device)
                .with_context(|| format!("loading autoencoder weights from {}", path.display()))?
        };
        let encoder = linear(FEATURE_DIM, hidden_size, vb.pp("encoder"))?;
        let decoder = linear(hidden_size, FEATURE_DIM, vb.pp("decoder"))?;
        Ok(Self { encoder, decoder, device })
    }

    /// Reconstructs `features` and returns the root-mean-square error between
    /// input and reconstruction, over all eight components (spec §4.2).
    pub fn reconstruction_error(&self, features: &FeatureVector) -> Result<f64> {
        let all: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        let input = Tensor::from_vec(all, (1, FEATURE_DIM), &self.device)?;

        let encoded = self.encoder.forward(&input)?.relu()?;
        let decoded = self.decoder.forward(&encoded)?;

        let diff = (&decoded - &input)?;
        let squared = diff.sqr()?;
        let mse = squared.mean_all()?.to_scalar::<f32>()?;
        Ok((mse as f64).sqrt())
    }
}

/// Wraps the benign-trained and malicious-trained autoencoders and derives
/// the PAMP/SAFE signal pair for a flow's feature vector.
pub struct SignalExtractor {
    /// Trained on benign traffic: a flow that reconstructs *poorly* here is
    /// dangerous (PAMP signal).
    benign_model: Autoencoder,
    /// Trained on malicious traffic: a normal flow reconstructs *poorly*
    /// here, so its raw error is itself the SAFE signal (rises on normal
    /// traffic, per spec §4.2 — no inversion).
    malicious_model: Autoencoder,
}

/// The two innate-immune signals handed to a dendritic cell per antigen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    pub pamp: f64,
    pub safe: f64,
}

impl SignalExtractor {
    pub fn new(benign_model: Autoencoder, malicious_model: Autoencoder) -> Self {
        Self { benign_model, malicious_model }
    }

    /// Extracts the PAMP and SAFE signals for a scaled feature vector.
    pub fn extract(&self, scaled_features: &FeatureVector) -> Result<Signals> {
        let pamp = self.benign_model.reconstruction_error(scaled_features)?;
        let safe = self.malicious_model.reconstruction_error(scaled_features)?;
        debug!(pamp, safe, "extracted signals");
        Ok(Signals { pamp, safe })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_autoencoder(device: &Device, varmap: &candle_nn::VarMap) -> Autoencoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let encoder = linear(FEATURE_DIM, 4, vb.pp("encoder")).unwrap();
        let decoder = linear(4, FEATURE_DIM, vb.pp("decoder")).unwrap();
        Autoencoder { encoder, decoder, device: device.clone() }
    }

    #[test]
    fn reconstruction_error_is_non_negative() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let model = toy_autoencoder(&device, &varmap);
        let features: FeatureVector = [1.0, 0.5, -0.3, 0.2, 0.0, -1.0, 1.0, 0.0];
        let err = model.reconstruction_error(&features).unwrap();
        assert!(err >= 0.0);
    }

    #[test]
    fn both_signals_are_non_negative_raw_reconstruction_errors() {
        let device = Device::Cpu;
        let benign_map = candle_nn::VarMap::new();
        let malicious_map = candle_nn::VarMap::new();
        let benign = toy_autoencoder(&device, &benign_map);
        let malicious = toy_autoencoder(&device, &malicious_map);
        let extractor = SignalExtractor::new(benign, malicious);

        let features: FeatureVector = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 1.0, 0.0];
        let signals = extractor.extract(&features).unwrap();
        assert!(signals.safe >= 0.0);
        assert!(signals.pamp >= 0.0);
    }
}
