use crate::{
    config::Config,
    util::{nonempty_file, read_lossy},
};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

pub type SignalSet = BTreeSet<String>;

pub const INPUTS_DONT_EXIST: &str = "INPUTS_DONT_EXIST";
pub const OUTPUTS_DONT_EXIST: &str = "OUTPUTS_DONT_EXIST";
pub const INCOHERENT_POTCARS: &str = "INCOHERENT_POTCARS";
pub const VASP_HASNT_STARTED: &str = "VASP_HASNT_STARTED";
pub const VASP_HASNT_COMPLETED: &str = "VASP_HASNT_COMPLETED";
pub const CHARGE_UNCONVERGED: &str = "CHARGE_UNCONVERGED";
pub const NETWORK_QUIESCED: &str = "NETWORK_QUIESCED";
pub const HARD_KILLED: &str = "HARD_KILLED";
pub const WALLTIME_EXCEEDED: &str = "WALLTIME_EXCEEDED";
pub const ATOMS_TOO_CLOSE: &str = "ATOMS_TOO_CLOSE";
pub const DISK_SPACE_EXCEEDED: &str = "DISK_SPACE_EXCEEDED";
pub const SEGFAULT: &str = "SEGFAULT";

const INPUT_FILES: [&str; 4] = ["INCAR", "POSCAR", "POTCAR", "KPOINTS"];
const OUTPUT_FILES: [&str; 2] = ["OUTCAR", "vasprun.xml"];
const PROCESS_LOG: &str = "vasp.out";
const COMPLETION_BANNER: &str = "General timing and accounting";

/// Process-log line patterns and the signal each one raises.
const PROCESS_LOG_PATTERNS: [(&str, &str); 7] = [
    (
        r"(?i)number of potentials on file potcar incompatible",
        INCOHERENT_POTCARS,
    ),
    (r"(?i)distance between some ions is very small", ATOMS_TOO_CLOSE),
    (r"BRMIX: very serious problems", "BRMIX"),
    (r"ZBRENT: fatal error", "ZBRENT"),
    (r"Error EDDDAV", "EDDDAV"),
    (r"(?i)sub-space-matrix is not hermitian", "SUBSPACEMATRIX"),
    (r"(?i)tetrahedron method fails", "TET"),
];

/// One anomaly check over a directory's files.
///
/// Detectors never fail: a file that cannot be read counts as absent, and a
/// missing directory simply has no logs to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detector {
    InputsExist,
    OutputsExist,
    ProcessLog,
    NetworkQuiesced,
    SegFault,
    HardKilled,
    StartedCompleted,
    Unconverged,
    WallTime,
    DiskSpace,
}

impl Detector {
    /// Run against the selected relaxation directory.
    pub const RUN_DIR: [Detector; 8] = [
        Detector::InputsExist,
        Detector::OutputsExist,
        Detector::ProcessLog,
        Detector::NetworkQuiesced,
        Detector::SegFault,
        Detector::HardKilled,
        Detector::StartedCompleted,
        Detector::Unconverged,
    ];

    /// Run against the job base directory (and its parent for legacy jobs).
    pub const BASE_DIR: [Detector; 2] = [Detector::WallTime, Detector::DiskSpace];

    pub fn name(&self) -> &'static str {
        match self {
            Detector::InputsExist => "inputs_exist",
            Detector::OutputsExist => "outputs_exist",
            Detector::ProcessLog => "process_log",
            Detector::NetworkQuiesced => "network_quiesced",
            Detector::SegFault => "segfault",
            Detector::HardKilled => "hard_killed",
            Detector::StartedCompleted => "started_completed",
            Detector::Unconverged => "unconverged",
            Detector::WallTime => "walltime",
            Detector::DiskSpace => "disk_space",
        }
    }

    pub fn detect(&self, cfg: &Config, dir: &Path) -> SignalSet {
        let found = match self {
            Detector::InputsExist => missing_any(dir, &INPUT_FILES, INPUTS_DONT_EXIST),
            Detector::OutputsExist => missing_any(dir, &OUTPUT_FILES, OUTPUTS_DONT_EXIST),
            Detector::ProcessLog => process_log_signals(dir),
            Detector::NetworkQuiesced => {
                error_logs_match(cfg, dir, network_re(), NETWORK_QUIESCED)
            }
            Detector::SegFault => error_logs_match(cfg, dir, segfault_re(), SEGFAULT),
            Detector::HardKilled => error_logs_match(cfg, dir, killed_re(), HARD_KILLED),
            Detector::StartedCompleted => started_completed(dir),
            Detector::Unconverged => unconverged(cfg, dir),
            Detector::WallTime => error_logs_match(cfg, dir, walltime_re(), WALLTIME_EXCEEDED),
            Detector::DiskSpace => {
                let mut out = error_logs_match(cfg, dir, disk_re(), DISK_SPACE_EXCEEDED);
                if let Some(text) = read_lossy(&dir.join(PROCESS_LOG)) {
                    if disk_re().is_match(&text) {
                        out.insert(DISK_SPACE_EXCEEDED.to_string());
                    }
                }
                out
            }
        };
        if !found.is_empty() {
            debug!(detector = self.name(), dir = %dir.display(), ?found, "signals");
        }
        found
    }
}

fn single(signal: &str) -> SignalSet {
    let mut s = SignalSet::new();
    s.insert(signal.to_string());
    s
}

fn missing_any(dir: &Path, files: &[&str], signal: &str) -> SignalSet {
    if files.iter().all(|f| nonempty_file(&dir.join(f))) {
        SignalSet::new()
    } else {
        single(signal)
    }
}

fn process_log_signals(dir: &Path) -> SignalSet {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        PROCESS_LOG_PATTERNS
            .iter()
            .map(|(p, s)| (Regex::new(p).expect("valid regex literal"), *s))
            .collect()
    });

    let Some(text) = read_lossy(&dir.join(PROCESS_LOG)) else {
        return SignalSet::new();
    };
    patterns
        .iter()
        .filter(|(re, _)| re.is_match(&text))
        .map(|(_, s)| s.to_string())
        .collect()
}

fn started_completed(dir: &Path) -> SignalSet {
    let outcar = dir.join("OUTCAR");
    if !nonempty_file(&outcar) {
        return single(VASP_HASNT_STARTED);
    }
    match read_lossy(&outcar) {
        Some(text) if text.contains(COMPLETION_BANNER) => SignalSet::new(),
        Some(_) => single(VASP_HASNT_COMPLETED),
        None => SignalSet::new(),
    }
}

/// Compares the electronic steps of the last ionic step in OSZICAR against NELM.
fn unconverged(cfg: &Config, dir: &Path) -> SignalSet {
    let Some(oszicar) = read_lossy(&dir.join("OSZICAR")) else {
        return SignalSet::new();
    };
    let nelm = read_lossy(&dir.join("INCAR"))
        .and_then(|incar| parse_nelm(&incar))
        .unwrap_or(cfg.signals.default_nelm);

    let mut steps = 0u32;
    let mut last_block = 0u32;
    for line in oszicar.lines() {
        let t = line.trim_start();
        if t.starts_with("DAV:") || t.starts_with("RMM:") || t.starts_with("CG :") {
            steps += 1;
        } else if ionic_re().is_match(t) {
            last_block = steps;
            steps = 0;
        }
    }
    // A trailing electronic block without an ionic summary is the step still running.
    let last = if steps > 0 { steps } else { last_block };

    if nelm > 0 && last >= nelm {
        single(CHARGE_UNCONVERGED)
    } else {
        SignalSet::new()
    }
}

fn parse_nelm(incar: &str) -> Option<u32> {
    incar
        .lines()
        .flat_map(|l| l.split(';'))
        .filter_map(|entry| entry.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("NELM"))
        .and_then(|(_, v)| v.split_whitespace().next()?.parse().ok())
}

fn error_logs_match(cfg: &Config, dir: &Path, re: &Regex, signal: &str) -> SignalSet {
    let hit = error_logs(cfg, dir)
        .iter()
        .filter_map(|p| read_lossy(p))
        .any(|text| re.is_match(&text));
    if hit { single(signal) } else { SignalSet::new() }
}

fn error_logs(cfg: &Config, dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| cfg.signals.error_log_suffixes.iter().any(|s| n.ends_with(s.as_str())))
                .unwrap_or(false)
        })
        .collect();
    out.sort();
    out
}

macro_rules! cached_regex {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pat).expect("valid regex literal"))
        }
    };
}

cached_regex!(network_re, r"(?i)(hit\s+a\s+member|network\s+quiesced)");
cached_regex!(segfault_re, r"(?i)(segmentation\s+fault|SIGSEGV)");
cached_regex!(
    killed_re,
    r"(?i)(killed\s+by\s+signal\s+9|exit\s+signal\s+killed|APPLICATION\s+TERMINATED)"
);
cached_regex!(
    walltime_re,
    r"(?i)(due\s+to\s+time\s+limit|walltime\s+.*exceeded|exceeded\s+.*walltime)"
);
cached_regex!(disk_re, r"(?i)no\s+space\s+left\s+on\s+device");
cached_regex!(ionic_re, r"^\d+\s+F=");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nelm_from_incar() {
        assert_eq!(parse_nelm("ISMEAR = 0\nNELM = 100\n"), Some(100));
        assert_eq!(parse_nelm("ALGO = Fast; nelm=40"), Some(40));
        assert_eq!(parse_nelm("ENCUT = 520"), None);
    }

    #[test]
    fn process_log_patterns_compile() {
        for (pat, signal) in PROCESS_LOG_PATTERNS {
            assert!(Regex::new(pat).is_ok(), "{signal}: {pat}");
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROCESS_LOG), "ZBRENT: fatal error\nError EDDDAV\n").unwrap();
        let found = process_log_signals(dir.path());
        assert!(found.contains("ZBRENT"));
        assert!(found.contains("EDDDAV"));
    }
}
