//! Lymph node: turns dendritic cell migrations into antigen profiles and
//! raises alerts once an antigen's MCAV crosses the anomaly threshold (see
//! spec §4.5).

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::{Alert, AntigenProfile, DcOutput};

/// Tracks per-antigen presentation history and decides when an antigen has
/// been presented in a mature context often enough to be an anomaly.
pub struct LymphNode {
    anomaly_threshold: f64,
    profiles: HashMap<String, AntigenProfile>,
}

impl LymphNode {
    pub fn new(anomaly_threshold: f64) -> Self {
        Self {
            anomaly_threshold,
            profiles: HashMap::new(),
        }
    }

    fn update_antigen_profile(&mut self, antigen_id: &str, context: u8) {
        self.profiles.entry(antigen_id.to_string()).or_default().presented(context);
    }

    fn detect_anomaly(&self, antigen_id: &str) -> bool {
        self.profiles
            .get(antigen_id)
            .map(|p| p.mcav() > self.anomaly_threshold)
            .unwrap_or(false)
    }

    /// Processes one migration event: `k > 1` marks a mature (dangerous)
    /// context, everything else is safe.
    fn get_migration(&mut self, output: DcOutput) -> Vec<Alert> {
        let context: u8 = if output.k > 1.0 { 1 } else { 0 };
        let mut alerts = Vec::new();
        for antigen in &output.antigens {
            self.update_antigen_profile(antigen.id(), context);
            if self.detect_anomaly(antigen.id()) {
                alerts.push(Alert { antigen_id: antigen.id().to_string() });
            }
        }
        alerts
    }

    /// Consumes migration events from `migration_rx`, forwarding any raised
    /// alerts to `alert_tx`. Exits on `None` or when `cancel` fires.
    ///
    /// The alert queue is unbounded (spec §5): `send` only fails once the
    /// shipper has dropped its receiver entirely, not under backpressure.
    pub async fn run(
        mut self,
        mut migration_rx: mpsc::Receiver<Option<DcOutput>>,
        alert_tx: mpsc::UnboundedSender<Alert>,
        cancel: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = migration_rx.recv() => item,
            };

            let Some(output) = item.flatten() else { break };
            for alert in self.get_migration(output) {
                info!(antigen_id = %alert.antigen_id, "anomaly detected");
                if alert_tx.send(alert).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Antigen;

    fn output(k: f64, antigens: Vec<&str>) -> DcOutput {
        DcOutput {
            k,
            csm: 0.0,
            antigens: antigens.into_iter().map(|a| Antigen::from(a.to_string())).collect(),
        }
    }

    #[test]
    fn mature_context_accumulates_toward_anomaly_threshold() {
        let mut node = LymphNode::new(0.65);
        for _ in 0..10 {
            let alerts = node.get_migration(output(2.0, vec!["flow-a"]));
            if !alerts.is_empty() {
                return;
            }
        }
        panic!("expected an alert once mcav crossed the threshold");
    }

    #[test]
    fn benign_context_never_raises_an_alert() {
        let mut node = LymphNode::new(0.65);
        for _ in 0..50 {
            let alerts = node.get_migration(output(0.5, vec!["flow-b"]));
            assert!(alerts.is_empty());
        }
    }

    #[test]
    fn context_boundary_at_k_equal_one_is_safe() {
        let mut node = LymphNode::new(0.0);
        let alerts = node.get_migration(output(1.0, vec!["flow-c"]));
        assert!(alerts.is_empty());
    }
}
