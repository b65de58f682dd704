use crate::{
    config::Config,
    layout::{JobLayout, select_last_relax_dir},
    signals::{Detector, SignalSet},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Classification block stored on every task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalReport {
    pub last_relax_dir: String,
    pub signals: Vec<String>,
    pub critical_signals: Vec<String>,
    pub num_signals: usize,
    pub num_critical: usize,
}

impl SignalReport {
    /// Builds the report from a detected set. Critical signals are always a
    /// subset of `signals` and the counts always match the lists.
    pub fn new(last_relax_dir: &Path, signals: SignalSet, critical: &[String]) -> Self {
        let critical_signals: Vec<String> = signals
            .iter()
            .filter(|s| critical.iter().any(|c| c == *s))
            .cloned()
            .collect();
        let signals: Vec<String> = signals.into_iter().collect();
        Self {
            last_relax_dir: last_relax_dir.display().to_string(),
            num_signals: signals.len(),
            num_critical: critical_signals.len(),
            signals,
            critical_signals,
        }
    }

    pub fn is_critical(&self) -> bool {
        !self.critical_signals.is_empty()
    }
}

/// Runs every detector for a job and merges the findings.
pub fn detect_all(cfg: &Config, job_dir: &Path, layout: &JobLayout) -> SignalReport {
    let last_relax_dir = select_last_relax_dir(cfg, job_dir, layout);
    info!("getting signals for dir {}", last_relax_dir.display());

    let mut signals = SignalSet::new();
    for d in Detector::RUN_DIR {
        signals.extend(d.detect(cfg, &last_relax_dir));
    }

    // Legacy schedulers sometimes wrote their kill messages one level up.
    let parent = job_dir.parent().filter(|p| !p.as_os_str().is_empty());
    for d in Detector::BASE_DIR {
        signals.extend(d.detect(cfg, job_dir));
        if layout.is_legacy() {
            if let Some(root) = parent {
                signals.extend(d.detect(cfg, root));
            }
        }
    }

    SignalReport::new(&last_relax_dir, signals, &cfg.signals.critical)
}
