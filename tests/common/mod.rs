#![allow(dead_code)]

use anyhow::Result;
use serde_json::{Value, json};
use std::path::Path;
use taskdrone::{
    config::Config,
    parser::{OutputParser, ParsedRun},
    record::JobRecord,
};

pub const FINISHED_OUTCAR: &str =
    "  free energy TOTEN = -10.5 eV\n General timing and accounting informations for this job:\n";

pub fn write(dir: &Path, name: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), body).unwrap();
}

/// A directory that every run-dir detector considers healthy.
pub fn finished_run(dir: &Path) {
    write(dir, "INCAR", "ENCUT = 520\nNELM = 60\n");
    write(dir, "POSCAR", "Si2\n1.0\n");
    write(dir, "POTCAR", "PAW_PBE Si\n");
    write(dir, "KPOINTS", "Automatic\n0\nGamma\n4 4 4\n");
    write(dir, "OUTCAR", FINISHED_OUTCAR);
    write(dir, "vasprun.xml", "<modeling></modeling>\n");
}

pub fn memory_config() -> Config {
    let mut cfg = Config::default();
    cfg.store.path = ":memory:".into();
    cfg
}

pub fn record(dir_name: &str) -> JobRecord {
    JobRecord::from_parsed(json!({
        "dir_name": dir_name,
        "state": "successful",
        "output": { "final_energy": -10.5 },
    }))
    .unwrap()
}

pub fn manifest(task_type: &str, snlgroup_id: i64) -> Value {
    json!({
        "fw_id": 17,
        "spec": {
            "mpsnl": {
                "snl_id": 3,
                "structure": { "sites": ["Si", "Si"], "a": 5.47 },
                "history": [{ "name": "ICSD import" }],
            },
            "snlgroup_id": snlgroup_id,
            "task_type": task_type,
            "run_tags": ["auto generation v1.0"],
            "vaspinputset_name": "MPGGAVaspInputSet",
        }
    })
}

/// Stands in for the external parser: returns a fixed document for any dir.
pub struct StubParser {
    pub doc: Value,
    pub parse_dos: bool,
}

impl StubParser {
    pub fn successful() -> Self {
        Self {
            doc: json!({
                "state": "successful",
                "output": {
                    "final_energy": -10.5,
                    "crystal": { "sites": ["Si", "Si"], "a": 5.43 },
                },
            }),
            parse_dos: false,
        }
    }
}

impl OutputParser for StubParser {
    fn parse(&self, dir: &Path, parse_dos: bool) -> Result<ParsedRun> {
        let mut doc = self.doc.clone();
        doc["dir_name"] = Value::from(format!("host:{}", dir.display()));
        Ok(ParsedRun {
            doc,
            parse_dos: parse_dos && self.parse_dos,
        })
    }
}
