//! Dendritic Cell Algorithm population: signal integration, costimulation,
//! and migration (see spec §4.3-§4.4).

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DcaConfig;
use crate::scaler::FeatureScaler;
use crate::signal::{SignalExtractor, Signals};
use crate::types::{Antigen, DcOutput, FeatureVector};

/// A single dendritic cell: accumulates weighted signals across the
/// antigens it samples until its costimulation crosses its migration
/// threshold, then presents its context verdict and resets.
#[derive(Debug)]
struct DendriticCell {
    migration_threshold: f64,
    max_antigens: usize,
    antigen_store: Vec<Antigen>,
    /// `[csm_weights; k_weights]`, each `[pamp_weight, safe_weight]`.
    weights: [[f64; 2]; 2],
    signals: [f64; 2],
    output_signals: [f64; 2],
}

impl DendriticCell {
    fn new(migration_threshold: f64, max_antigens: usize, csm_weights: [f64; 2], k_weights: [f64; 2]) -> Self {
        Self {
            migration_threshold,
            max_antigens,
            antigen_store: Vec::with_capacity(max_antigens),
            weights: [csm_weights, k_weights],
            signals: [0.0, 0.0],
            output_signals: [0.0, 0.0],
        }
    }

    /// Attempts to accept one more antigen into this cell's store; fails
    /// once it has already sampled `max_antigens`.
    fn phagocytose(&mut self, antigen: Antigen) -> bool {
        if self.antigen_store.len() < self.max_antigens {
            self.antigen_store.push(antigen);
            true
        } else {
            false
        }
    }

    fn signal_update(&mut self, signals: Signals) {
        self.signals[0] += signals.pamp;
        self.signals[1] += signals.safe;
        self.output_signals[0] = self.weights[0][0] * self.signals[0] + self.weights[0][1] * self.signals[1];
        self.output_signals[1] = self.weights[1][0] * self.signals[0] + self.weights[1][1] * self.signals[1];
    }

    fn csm(&self) -> f64 {
        self.output_signals[0]
    }

    fn k(&self) -> f64 {
        self.output_signals[1]
    }

    fn should_migrate(&self) -> bool {
        self.csm() >= self.migration_threshold
    }

    fn present(&self) -> DcOutput {
        DcOutput {
            k: self.k(),
            csm: self.csm(),
            antigens: self.antigen_store.clone(),
        }
    }

    fn reset(&mut self) {
        self.antigen_store.clear();
        self.signals = [0.0, 0.0];
        self.output_signals = [0.0, 0.0];
    }
}

/// The dendritic cell population, driving antigen sampling and migration.
pub struct Dca {
    population: Vec<DendriticCell>,
    population_size: usize,
    segment_size: usize,
    antigen_count: usize,
    scaler: FeatureScaler,
    signal_extractor: SignalExtractor,
}

impl Dca {
    pub fn new(config: &DcaConfig, scaler: FeatureScaler, signal_extractor: SignalExtractor) -> Self {
        let mut rng = rand::thread_rng();
        let population = (0..config.population_size)
            .map(|_| {
                let threshold = rng.gen_range(config.migration_range.0..=config.migration_range.1);
                DendriticCell::new(threshold, config.max_antigens, config.csm_weights, config.k_weights)
            })
            .collect();

        Self {
            population,
            population_size: config.population_size,
            segment_size: config.segment_size,
            antigen_count: 0,
            scaler,
            signal_extractor,
        }
    }

    /// Assigns `antigen` to a dendritic cell, starting at a round-robin index
    /// and probing forward until one has room. Caps the search at one full
    /// revolution of the population: if every cell is already full, the
    /// antigen is dropped rather than looping forever (a livelock the
    /// original sampling loop was prone to when every cell filled up at
    /// once).
    fn sample_antigen(&mut self, antigen: Antigen) -> Option<usize> {
        let start = self.antigen_count % self.population_size;
        for offset in 0..self.population_size {
            let index = (start + offset) % self.population_size;
            if self.population[index].phagocytose(antigen.clone()) {
                return Some(index);
            }
        }
        debug!(antigen = %antigen, "population full, dropping antigen");
        None
    }

    fn signal_update(&mut self, index: usize, signals: Signals) -> Option<DcOutput> {
        let cell = &mut self.population[index];
        cell.signal_update(signals);
        if cell.should_migrate() {
            let output = cell.present();
            cell.reset();
            Some(output)
        } else {
            None
        }
    }

    fn population_context_reset(&mut self) {
        for cell in &mut self.population {
            cell.reset();
        }
    }

    /// Consumes raw (antigen id, feature vector) pairs from `antigen_rx`,
    /// running the segment loop described in spec §4.4, and forwards every
    /// migration event to `migration_tx`. Exits on `None` from the collector
    /// or when `cancel` fires.
    pub async fn run(
        mut self,
        mut antigen_rx: mpsc::Receiver<Option<(String, FeatureVector)>>,
        migration_tx: mpsc::Sender<Option<DcOutput>>,
        cancel: CancellationToken,
    ) {
        'segments: loop {
            while self.antigen_count < self.segment_size {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break 'segments,
                    item = antigen_rx.recv() => item,
                };

                let Some(payload) = item else { break 'segments };
                let Some((antigen_id, raw_features)) = payload else { break 'segments };

                let scaled = self.scaler.transform(&raw_features);
                let signals = match self.signal_extractor.extract(&scaled) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "signal extraction failed, dropping antigen");
                        continue;
                    }
                };

                let antigen = Antigen::from(antigen_id);
                if let Some(index) = self.sample_antigen(antigen) {
                    if let Some(output) = self.signal_update(index, signals) {
                        if migration_tx.send(Some(output)).await.is_err() {
                            break 'segments;
                        }
                    }
                }
                self.antigen_count += 1;
            }
            self.population_context_reset();
            self.antigen_count = 0;
        }

        let _ = migration_tx.send(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(threshold: f64) -> DendriticCell {
        DendriticCell::new(threshold, 5, [2.0, 2.0], [2.0, -2.0])
    }

    #[test]
    fn migration_fires_once_csm_crosses_threshold() {
        let mut dc = cell(10.0);
        assert!(!dc.should_migrate());
        dc.signal_update(Signals { pamp: 3.0, safe: 0.0 });
        assert!(!dc.should_migrate());
        dc.signal_update(Signals { pamp: 3.0, safe: 0.0 });
        assert!(dc.should_migrate());
    }

    #[test]
    fn reset_clears_signals_and_antigen_store() {
        let mut dc = cell(1.0);
        dc.phagocytose(Antigen::from("a".to_string()));
        dc.signal_update(Signals { pamp: 1.0, safe: 1.0 });
        dc.reset();
        assert_eq!(dc.csm(), 0.0);
        assert_eq!(dc.k(), 0.0);
        assert!(dc.antigen_store.is_empty());
    }

    #[test]
    fn phagocytose_rejects_once_full() {
        let mut dc = DendriticCell::new(100.0, 2, [1.0, 1.0], [1.0, -1.0]);
        assert!(dc.phagocytose(Antigen::from("a".to_string())));
        assert!(dc.phagocytose(Antigen::from("b".to_string())));
        assert!(!dc.phagocytose(Antigen::from("c".to_string())));
    }

    #[test]
    fn context_is_safe_when_k_is_at_or_below_one() {
        let mut dc = cell(1.0);
        dc.signal_update(Signals { pamp: 0.0, safe: 1.0 });
        let output = dc.present();
        assert!(output.k <= 1.0);
    }

    proptest::proptest! {
        /// Invariant 2 (spec §8): after any number of signal updates without
        /// a migration resetting the cell, `output_signals == weights . signals`
        /// to within double-precision tolerance.
        #[test]
        fn output_signals_always_equal_weights_times_signals(
            updates in proptest::collection::vec((0.0f64..5.0, 0.0f64..5.0), 0..30),
        ) {
            // A migration threshold high enough that no update in this range
            // can trigger a reset mid-sequence, so the invariant is checked
            // against undisturbed accumulation.
            let mut dc = DendriticCell::new(1_000_000.0, 100, [2.0, 2.0], [2.0, -2.0]);
            for (pamp, safe) in updates {
                dc.signal_update(Signals { pamp, safe });
                let expected_csm = dc.weights[0][0] * dc.signals[0] + dc.weights[0][1] * dc.signals[1];
                let expected_k = dc.weights[1][0] * dc.signals[0] + dc.weights[1][1] * dc.signals[1];
                proptest::prop_assert!((dc.output_signals[0] - expected_csm).abs() < 1e-12);
                proptest::prop_assert!((dc.output_signals[1] - expected_k).abs() < 1e-12);
            }
        }
    }
}
