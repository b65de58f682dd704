use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub ingest: Ingest,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub signals: Signals,
    #[serde(default)]
    pub offload: Offload,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub parser: Parser,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Loads `path` if it exists, otherwise returns the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    /// SQLite database path. `:memory:` opens a private in-memory database.
    pub path: String,
    pub busy_timeout_ms: u64,
}
impl Default for Store {
    fn default() -> Self {
        Self {
            path: "taskdrone.sqlite".into(),
            busy_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingest {
    pub update_duplicates: bool,
    pub simulate: bool,
    pub parse_dos: bool,
    /// Fail legacy jobs that carry no manifest instead of ingesting them without
    /// workflow metadata.
    pub require_manifest: bool,
    pub max_parallel_jobs: usize,
}
impl Default for Ingest {
    fn default() -> Self {
        Self {
            update_duplicates: false,
            simulate: false,
            parse_dos: false,
            require_manifest: false,
            max_parallel_jobs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layout {
    pub marker_files: Vec<String>,
    pub first_stage_dir: String,
    pub second_stage_dir: String,
    pub manifest_filename: String,
}
impl Default for Layout {
    fn default() -> Self {
        Self {
            marker_files: vec![
                "OUTCAR".into(),
                "POSCAR".into(),
                "INCAR".into(),
                "KPOINTS".into(),
            ],
            first_stage_dir: "relax1".into(),
            second_stage_dir: "relax2".into(),
            manifest_filename: "FW.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signals {
    pub critical: Vec<String>,
    pub error_log_suffixes: Vec<String>,
    pub default_nelm: u32,
}
impl Default for Signals {
    fn default() -> Self {
        Self {
            critical: [
                "INPUTS_DONT_EXIST",
                "OUTPUTS_DONT_EXIST",
                "INCOHERENT_POTCARS",
                "VASP_HASNT_STARTED",
                "VASP_HASNT_COMPLETED",
                "CHARGE_UNCONVERGED",
                "NETWORK_QUIESCED",
                "HARD_KILLED",
                "WALLTIME_EXCEEDED",
                "ATOMS_TOO_CLOSE",
                "DISK_SPACE_EXCEEDED",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            error_log_suffixes: vec![".error".into(), ".err".into(), "std_err.txt".into()],
            default_nelm: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offload {
    pub calculations_field: String,
    pub payload_field: String,
    pub id_field: String,
    pub bucket: String,
}
impl Default for Offload {
    fn default() -> Self {
        Self {
            calculations_field: "calculations".into(),
            payload_field: "dos".into(),
            id_field: "dos_fs_id".into(),
            bucket: "dos_fs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub history_name: String,
    pub history_url: String,
    /// Substring of the job-type label that marks a structure-optimizing run.
    pub optimize_marker: String,
}
impl Default for Provenance {
    fn default() -> Self {
        Self {
            history_name: "Materials Project structure optimization".into(),
            history_url: "http://www.materialsproject.org".into(),
            optimize_marker: "optimize structure".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parser {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}
impl Default for Parser {
    fn default() -> Self {
        Self {
            command: "python3".into(),
            args: vec!["scripts/parse_run.py".into()],
            timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub keep_parser_stderr: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            keep_parser_stderr: true,
            dump_effective_config: false,
        }
    }
}
