//! Core data types shared across pipeline stages (see spec §3)

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport protocol carried by a packet.
///
/// Only `Tcp`/`Udp` flows ever reach the Flow Table (§4.3's acceptance
/// rule rejects everything else before a `Flow` is built), but the parser
/// keeps `Icmp`/`Other` as valid parse outcomes so packet parsing stays a
/// total function independent of the acceptance filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Other(n) => write!(f, "protocol({n})"),
        }
    }
}

/// Raw 8-component feature vector in the fixed spec order:
/// `(spkts, dpkts, sbytes, dbytes, smean, dmean, is_tcp, is_udp)`.
///
/// Indices 0..6 are numerical and pass through the scaler; 6 and 7 are the
/// one-hot protocol indicator and are never scaled.
pub type FeatureVector = [f64; 8];

/// An antigen identity: a flow's key, opaque beyond string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Antigen(pub String);

impl Antigen {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl From<String> for Antigen {
    fn from(s: String) -> Self {
        Antigen(s)
    }
}

impl fmt::Display for Antigen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A migration event emitted by a dendritic cell: its net costimulation and
/// context verdict at the moment it crossed its migration threshold, plus
/// the antigens it had sampled.
#[derive(Debug, Clone)]
pub struct DcOutput {
    pub k: f64,
    pub csm: f64,
    pub antigens: Vec<Antigen>,
}

/// Per-antigen running tally kept by the Lymph Node.
#[derive(Debug, Clone, Copy, Default)]
pub struct AntigenProfile {
    pub mature_presentations: u64,
    pub total_presentations: u64,
}

impl AntigenProfile {
    /// Records one presentation; `context == 1` marks it mature.
    pub fn presented(&mut self, context: u8) {
        if context == 1 {
            self.mature_presentations += 1;
        }
        self.total_presentations += 1;
    }

    /// Mature-context-antigen-value, with +1 Laplace smoothing.
    pub fn mcav(&self) -> f64 {
        self.mature_presentations as f64 / (self.total_presentations as f64 + 1.0)
    }
}

/// An outbound alert: just the antigen id. The server reconstructs
/// sip/sport/dip/dport from it (see spec §9, Open Question #5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub antigen_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcav_smoothing_avoids_div_by_zero() {
        let p = AntigenProfile::default();
        assert_eq!(p.mcav(), 0.0);
    }

    #[test]
    fn mcav_matches_scenario_s3() {
        let mut p = AntigenProfile::default();
        let expected = [0.5, 2.0 / 3.0, 0.75, 0.8, 5.0 / 6.0];
        for e in expected {
            p.presented(1);
            assert!((p.mcav() - e).abs() < 1e-12);
        }
    }

    #[test]
    fn mcav_stays_zero_for_benign_context() {
        let mut p = AntigenProfile::default();
        for _ in 0..10 {
            p.presented(0);
        }
        assert_eq!(p.mcav(), 0.0);
    }

    proptest::proptest! {
        /// Invariant 3 (spec §8): `0 <= MCAV < 1` for any sequence of
        /// presentations, mature or not.
        #[test]
        fn mcav_stays_in_zero_one_range(contexts in proptest::collection::vec(0u8..=1, 0..200)) {
            let mut p = AntigenProfile::default();
            for context in contexts {
                p.presented(context);
                let mcav = p.mcav();
                proptest::prop_assert!(mcav >= 0.0);
                proptest::prop_assert!(mcav < 1.0);
            }
        }

        /// MCAV is non-decreasing on a presentation that adds to the mature
        /// count (`context == 1`).
        #[test]
        fn mcav_never_decreases_on_a_mature_presentation(prefix in proptest::collection::vec(0u8..=1, 0..50)) {
            let mut p = AntigenProfile::default();
            for context in prefix {
                p.presented(context);
            }
            let before = p.mcav();
            p.presented(1);
            proptest::prop_assert!(p.mcav() >= before);
        }
    }
}
