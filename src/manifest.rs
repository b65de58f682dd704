use crate::error::IngestError;
use serde_json::Value;
use std::path::Path;

/// Workflow metadata the job manager writes next to each modern job.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub fw_id: i64,
    pub snl: Value,
    pub snlgroup_id: i64,
    pub task_type: String,
    pub submission_id: Value,
    pub run_tags: Vec<String>,
    pub vaspinputset_name: Option<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path).map_err(|e| IngestError::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let doc: Value = serde_json::from_str(&raw).map_err(|e| IngestError::InvalidManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_value(path, &doc)
    }

    pub fn from_value(path: &Path, doc: &Value) -> Result<Self, IngestError> {
        let missing = |field: &str| IngestError::MissingManifest {
            path: path.to_path_buf(),
            field: field.to_string(),
        };

        let fw_id = doc
            .get("fw_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("fw_id"))?;
        let spec = doc.get("spec").ok_or_else(|| missing("spec"))?;
        let snl = spec
            .get("mpsnl")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| missing("spec.mpsnl"))?;
        let snlgroup_id = spec
            .get("snlgroup_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("spec.snlgroup_id"))?;
        let task_type = spec
            .get("task_type")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("spec.task_type"))?
            .to_string();

        let run_tags = spec
            .get("run_tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            fw_id,
            snl,
            snlgroup_id,
            task_type,
            submission_id: spec.get("submission_id").cloned().unwrap_or(Value::Null),
            run_tags,
            vaspinputset_name: spec
                .get("vaspinputset_name")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
