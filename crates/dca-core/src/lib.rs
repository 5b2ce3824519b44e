//! # DCA Core
//!
//! Dendritic Cell Algorithm network anomaly detection pipeline: packet
//! capture and flow aggregation, signal extraction via a pair of
//! autoencoders, dendritic cell population dynamics, lymph node anomaly
//! detection, and encrypted alert shipping.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dca;
pub mod error;
pub mod flow;
pub mod lymph;
pub mod scaler;
pub mod shipper;
pub mod signal;
pub mod types;

use std::sync::Arc;

use candle_core::Device;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{CompanyKey, SystemConfig};
use crate::dca::Dca;
use crate::error::DcaError;
use crate::flow::{FlowTable, PacketCollector};
use crate::lymph::LymphNode;
use crate::scaler::FeatureScaler;
use crate::shipper::AlertShipper;
use crate::signal::{Autoencoder, SignalExtractor};
use crate::types::Alert;

/// Supervises the four pipeline stages: Collector, DCA, Lymph Node, and
/// Shipper, wired by bounded channels and torn down together through one
/// cancellation token.
pub struct Pipeline {
    config: Arc<SystemConfig>,
    shutdown_token: CancellationToken,
}

impl Pipeline {
    pub fn new(config: SystemConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Loads models/scaler, opens the capture interface, and spawns every
    /// stage. Returns once all stages have been spawned; call
    /// [`Pipeline::shutdown`] to stop them, or wait on the returned handle
    /// for natural termination (e.g. the shipper exhausting its retries).
    pub async fn start(&self, company_key: CompanyKey, hostname: String) -> Result<tokio::task::JoinHandle<()>, DcaError> {
        info!(interface = %self.config.interface, "starting pipeline");

        let scaler = FeatureScaler::load(&self.config.scaler_path)?;

        let device = Device::Cpu;
        let benign_model = Autoencoder::load(&self.config.benign_model_path, self.config.hidden_size, device.clone())
            .map_err(|e| DcaError::Startup(format!("cannot load benign model: {e}")))?;
        let malicious_model = Autoencoder::load(&self.config.malicious_model_path, self.config.hidden_size, device)
            .map_err(|e| DcaError::Startup(format!("cannot load malicious model: {e}")))?;
        let signal_extractor = SignalExtractor::new(benign_model, malicious_model);

        let host_addr = local_ip_guess();
        let bpf_filter = format!("ip and (tcp or udp) and (host {host_addr})");
        let collector = PacketCollector::open(&self.config.interface, &bpf_filter)?;

        let (antigen_tx, antigen_rx) = mpsc::channel(self.config.queues.collector_to_dca);
        let (migration_tx, migration_rx) = mpsc::channel(self.config.queues.dca_to_lymph);
        // The alert queue is unbounded per spec §5: a dead shipper should
        // never backpressure the lymph node.
        let (alert_tx, alert_rx) = mpsc::unbounded_channel::<Alert>();

        let dca = Dca::new(&self.config.dca, scaler, signal_extractor);
        let lymph_node = LymphNode::new(self.config.dca.anomaly_threshold);
        let shipper = AlertShipper::new(company_key, hostname, self.config.shipper.clone());

        let collector_cancel = self.shutdown_token.clone();
        let collector_handle = tokio::spawn(async move {
            if let Err(e) = collector.run(FlowTable::new(), antigen_tx, collector_cancel).await {
                error!(error = %e, "collector stopped with error");
            }
        });

        let dca_cancel = self.shutdown_token.clone();
        let dca_handle = tokio::spawn(async move {
            dca.run(antigen_rx, migration_tx, dca_cancel).await;
        });

        let lymph_cancel = self.shutdown_token.clone();
        let lymph_handle = tokio::spawn(async move {
            lymph_node.run(migration_rx, alert_tx, lymph_cancel).await;
        });

        let shipper_cancel = self.shutdown_token.clone();
        let shipper_handle = tokio::spawn(async move {
            if let Err(e) = shipper.run(alert_rx, shipper_cancel).await {
                error!(error = %e, "shipper stopped with error");
            }
        });

        info!("all pipeline stages spawned");

        Ok(tokio::spawn(async move {
            let _ = tokio::join!(collector_handle, dca_handle, lymph_handle, shipper_handle);
            info!("pipeline stages exited");
        }))
    }

    /// Signals every stage to stop. Stages drain their current batch of work
    /// and propagate the `None` sentinel downstream before exiting.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown_token.cancel();
    }
}

/// Best-effort local address for the capture BPF filter's `host` clause.
/// Falls back to a filter that matches nothing narrower than the interface
/// itself if no non-loopback address can be found.
fn local_ip_guess() -> std::net::IpAddr {
    use std::net::{IpAddr, Ipv4Addr};

    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
