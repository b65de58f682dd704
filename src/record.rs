use crate::{
    config::Config,
    error::IngestError,
    manifest::Manifest,
    policy::{self, JobState},
    report::SignalReport,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// One ingested job as persisted in the task store.
///
/// Parser output that this crate does not interpret lives in `fields` and is
/// written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub dir_name: String,
    /// Zero until the store issues an ID (and permanently zero when simulated).
    #[serde(default)]
    pub task_id: i64,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<SignalReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snl: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snlgroup_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vaspinputset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snl_final: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snlgroup_id_final: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snlgroup_changed: Option<bool>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl JobRecord {
    /// Wraps a parser document. `dir_name` and `state` must be present.
    pub fn from_parsed(mut doc: Value) -> Result<Self, IngestError> {
        let dir = doc
            .get("dir_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IngestError::IncompleteParse {
                dir: "<unknown>".into(),
                field: "dir_name".into(),
            })?;
        if !doc.get("state").is_some_and(Value::is_string) {
            return Err(IngestError::IncompleteParse {
                dir,
                field: "state".into(),
            });
        }
        // Task IDs come from the store counter only.
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("task_id");
            obj.remove("last_updated");
        }
        serde_json::from_value(doc).map_err(|e| IngestError::IncompleteParse {
            dir,
            field: e.to_string(),
        })
    }

    pub fn apply_manifest(&mut self, m: &Manifest) {
        self.fw_id = Some(m.fw_id);
        self.snl = Some(m.snl.clone());
        self.snlgroup_id = Some(m.snlgroup_id);
        self.submission_id = Some(m.submission_id.clone());
        self.run_tags = m.run_tags.clone();
        self.vaspinputset_name = m.vaspinputset_name.clone();
        self.task_type = Some(m.task_type.clone());
    }

    pub fn apply_signals(&mut self, report: SignalReport) {
        self.state = policy::decide(self.state.clone(), &report);
        self.signals = Some(report);
    }

    /// True for structure-optimizing jobs whose parse produced an output block.
    pub fn needs_derived_structure(&self, cfg: &Config) -> bool {
        let optimizing = self
            .task_type
            .as_deref()
            .is_some_and(|t| t.contains(&cfg.provenance.optimize_marker));
        optimizing && self.fields.contains_key("output") && self.snl.is_some()
    }

    /// Builds the follow-on input record for an optimized structure. The
    /// provenance entry embeds `task_id`, so call this only once it is final.
    pub fn derive_structure(&self, cfg: &Config) -> Option<Value> {
        if !self.needs_derived_structure(cfg) {
            return None;
        }
        let crystal = self.fields.get("output")?.get("crystal")?.clone();
        let mut derived = self.snl.clone()?;
        let obj = derived.as_object_mut()?;

        obj.insert("structure".into(), crystal);
        obj.remove("snl_id");

        let entry = json!({
            "name": cfg.provenance.history_name,
            "url": cfg.provenance.history_url,
            "description": {
                "task_type": self.task_type,
                "fw_id": self.fw_id,
                "task_id": self.task_id,
            },
        });
        match obj.get_mut("history").and_then(Value::as_array_mut) {
            Some(history) => history.push(entry),
            None => {
                obj.insert("history".into(), Value::Array(vec![entry]));
            }
        }
        Some(derived)
    }

    /// Copies a previous registration onto this record. Returns false when
    /// `prior` was never registered.
    pub fn carry_registration(&mut self, prior: JobRecord) -> bool {
        let (Some(snl_final), Some(group_id)) = (prior.snl_final, prior.snlgroup_id_final) else {
            return false;
        };
        self.snl_final = Some(snl_final);
        self.snlgroup_id_final = Some(group_id);
        self.snlgroup_changed = Some(self.snlgroup_id != Some(group_id));
        true
    }

    pub fn apply_registration(&mut self, registered: Value, group_id: i64) {
        self.snl_final = Some(registered);
        self.snlgroup_id_final = Some(group_id);
        self.snlgroup_changed = Some(self.snlgroup_id != Some(group_id));
    }
}
