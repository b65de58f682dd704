use crate::{
    config::Config,
    record::JobRecord,
    store::{TASK_COUNTER, TaskStore, WriteOutcome},
    util::{now_rfc3339, sha256_hex},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    pub update_duplicates: bool,
    pub simulate: bool,
    pub parse_dos: bool,
}

impl IngestOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            update_duplicates: cfg.ingest.update_duplicates,
            simulate: cfg.ingest.simulate,
            parse_dos: cfg.ingest.parse_dos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Inserted,
    Updated,
    SkippedDuplicate,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingested {
    pub outcome: Outcome,
    pub dir_name: String,
    pub task_id: i64,
    /// The record as written (or as it would have been, when simulated).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<JobRecord>,
}

/// A nested payload moved out of the record into the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bucket: String,
    pub blob_id: String,
    pub data: Vec<u8>,
}

/// Moves every per-calculation payload out of `record`, leaving a reference to
/// its content-derived blob ID in its place.
pub fn extract_blobs(cfg: &Config, record: &mut JobRecord) -> Result<Vec<Blob>> {
    let o = &cfg.offload;
    let Some(calcs) = record
        .fields
        .get_mut(&o.calculations_field)
        .and_then(|v| v.as_array_mut())
    else {
        return Ok(Vec::new());
    };

    let mut blobs = Vec::new();
    for calc in calcs.iter_mut().filter_map(|c| c.as_object_mut()) {
        let Some(payload) = calc.remove(&o.payload_field) else {
            continue;
        };
        let data = serde_json::to_vec(&payload).with_context(|| "serializing offloaded payload")?;
        let blob_id = sha256_hex(&data);
        calc.insert(o.id_field.clone(), blob_id.clone().into());
        blobs.push(Blob {
            bucket: o.bucket.clone(),
            blob_id,
            data,
        });
    }
    Ok(blobs)
}

pub fn upsert<S: TaskStore>(
    store: &mut S,
    cfg: &Config,
    opts: IngestOptions,
    record: JobRecord,
    has_blobs: bool,
) -> Result<Ingested> {
    upsert_with(store, cfg, opts, record, has_blobs, |_, _| Ok(()))
}

/// De-duplicates on `dir_name`, issues or keeps the task ID, offloads large
/// payloads and writes the record.
///
/// `finalize` runs once the task ID is known and before the write; it is not
/// called for skipped duplicates.
pub fn upsert_with<S, F>(
    store: &mut S,
    cfg: &Config,
    opts: IngestOptions,
    mut record: JobRecord,
    has_blobs: bool,
    finalize: F,
) -> Result<Ingested>
where
    S: TaskStore,
    F: FnOnce(&mut S, &mut JobRecord) -> Result<()>,
{
    if opts.simulate {
        if has_blobs {
            extract_blobs(cfg, &mut record)?;
        }
        record.task_id = 0;
        record.last_updated = Some(now_rfc3339());
        finalize(store, &mut record)?;
        info!(
            "Simulated insert into database for {} with task_id {}",
            record.dir_name, record.task_id
        );
        return Ok(Ingested {
            outcome: Outcome::Simulated,
            dir_name: record.dir_name.clone(),
            task_id: 0,
            record: Some(record),
        });
    }

    let existing = store
        .find_task_id(&record.dir_name)
        .with_context(|| format!("looking up {}", record.dir_name))?;
    if let Some(task_id) = existing {
        if !opts.update_duplicates {
            info!("Skipping duplicate {} (task_id = {task_id})", record.dir_name);
            return Ok(skipped(record.dir_name, task_id));
        }
    }

    if has_blobs {
        for blob in extract_blobs(cfg, &mut record)? {
            store
                .put_blob(&blob.bucket, &blob.blob_id, &blob.data)
                .with_context(|| format!("storing blob {} for {}", blob.blob_id, record.dir_name))?;
        }
    }

    record.last_updated = Some(now_rfc3339());
    let outcome = match existing {
        Some(task_id) => {
            record.task_id = task_id;
            info!("Updating {} with task_id = {}", record.dir_name, task_id);
            Outcome::Updated
        }
        None => {
            record.task_id = store
                .increment_counter(TASK_COUNTER)
                .with_context(|| "issuing task id")?;
            info!("Inserting {} with task_id = {}", record.dir_name, record.task_id);
            Outcome::Inserted
        }
    };

    finalize(store, &mut record)?;

    match store
        .write_task(&record)
        .with_context(|| format!("writing task record {}", record.dir_name))?
    {
        WriteOutcome::Written => Ok(Ingested {
            outcome,
            dir_name: record.dir_name.clone(),
            task_id: record.task_id,
            record: Some(record),
        }),
        WriteOutcome::Conflict { existing_task_id } => {
            warn!(
                "{} was inserted concurrently with task_id = {existing_task_id}; dropping task_id = {}",
                record.dir_name, record.task_id
            );
            Ok(skipped(record.dir_name, existing_task_id))
        }
    }
}

fn skipped(dir_name: String, task_id: i64) -> Ingested {
    Ingested {
        outcome: Outcome::SkippedDuplicate,
        dir_name,
        task_id,
        record: None,
    }
}
