mod common;

use common::{StubParser, finished_run, manifest, memory_config, write};
use serde_json::json;
use taskdrone::{
    error::IngestError,
    ingest::{IngestOptions, Outcome},
    pipeline::Pipeline,
    policy::JobState,
    store::{SqliteStore, TASK_COUNTER, TaskStore},
};

const OPTIMIZE: &str = "GGA optimize structure (2x)";

fn modern_job(root: &std::path::Path, name: &str, task_type: &str) -> std::path::PathBuf {
    let job = root.join(name);
    finished_run(&job);
    write(&job, "FW.json", &manifest(task_type, 5).to_string());
    job
}

#[test]
fn optimized_structure_is_registered_with_final_task_id() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "block_1", OPTIMIZE);
    let mut store = SqliteStore::open(&cfg).unwrap();
    store.set_counter(TASK_COUNTER, 41).unwrap();

    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let done = pipeline.run_job(&mut store, &job).unwrap();

    assert_eq!(done.outcome, Outcome::Inserted);
    assert_eq!(done.task_id, 42);

    let stored = store.get_task(&done.dir_name).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Successful);
    assert_eq!(stored.fw_id, Some(17));
    assert_eq!(stored.task_type.as_deref(), Some(OPTIMIZE));
    assert_eq!(stored.run_tags, vec!["auto generation v1.0"]);
    assert_eq!(stored.signals.as_ref().unwrap().num_signals, 0);

    let snl_final = stored.snl_final.unwrap();
    assert_eq!(snl_final["structure"], json!({ "sites": ["Si", "Si"], "a": 5.43 }));
    let history = snl_final["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1]["description"]["task_id"], json!(42));
    assert_eq!(history[1]["description"]["fw_id"], json!(17));
    assert_eq!(snl_final["snl_id"], json!(1));

    assert_eq!(stored.snlgroup_id_final, Some(1));
    assert_eq!(stored.snlgroup_changed, Some(true));
}

#[test]
fn same_structure_shares_a_group() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let mut store = SqliteStore::open(&cfg).unwrap();
    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());

    let a = pipeline
        .run_job(&mut store, &modern_job(tmp.path(), "a", OPTIMIZE))
        .unwrap();
    let b = pipeline
        .run_job(&mut store, &modern_job(tmp.path(), "b", OPTIMIZE))
        .unwrap();

    let a = a.record.unwrap();
    let b = b.record.unwrap();
    assert_eq!(a.snlgroup_id_final, b.snlgroup_id_final);
    assert_ne!(a.snl_final.unwrap()["snl_id"], b.snl_final.unwrap()["snl_id"]);
}

#[test]
fn non_optimizing_job_derives_nothing() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "static", "GGA static");
    let mut store = SqliteStore::open(&cfg).unwrap();

    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let done = pipeline.run_job(&mut store, &job).unwrap();
    let record = done.record.unwrap();
    assert!(record.snl_final.is_none());
    assert!(record.snlgroup_changed.is_none());
}

#[test]
fn critical_signal_marks_stored_record_as_error() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "killed", "GGA static");
    write(&job, "job.error", "slurmstepd: *** JOB 12 CANCELLED DUE TO TIME LIMIT ***\n");
    let mut store = SqliteStore::open(&cfg).unwrap();

    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let done = pipeline.run_job(&mut store, &job).unwrap();

    let stored = store.get_task(&done.dir_name).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Error);
    let signals = stored.signals.unwrap();
    assert_eq!(signals.critical_signals, vec!["WALLTIME_EXCEEDED"]);
    assert_eq!(signals.num_critical, 1);
}

#[test]
fn manifest_without_task_type_aborts() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = tmp.path().join("broken");
    finished_run(&job);
    let mut m = manifest(OPTIMIZE, 5);
    m["spec"].as_object_mut().unwrap().remove("task_type");
    write(&job, "FW.json", &m.to_string());
    let mut store = SqliteStore::open(&cfg).unwrap();

    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let err = pipeline.run_job(&mut store, &job).unwrap_err();

    match err.downcast_ref::<IngestError>() {
        Some(IngestError::MissingManifest { field, .. }) => assert_eq!(field, "spec.task_type"),
        other => panic!("expected MissingManifest, got {other:?}"),
    }
    assert_eq!(store.count_tasks().unwrap(), 0);
    assert_eq!(store.counter_value(TASK_COUNTER).unwrap(), 0);
}

#[test]
fn legacy_job_without_manifest() {
    let mut cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = tmp.path().join("old");
    finished_run(&job);
    finished_run(&job.join("relax2"));
    let mut store = SqliteStore::open(&cfg).unwrap();

    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let done = pipeline.run_job(&mut store, &job).unwrap();
    let record = done.record.unwrap();
    assert!(record.fw_id.is_none());
    assert_eq!(
        record.signals.unwrap().last_relax_dir,
        job.join("relax2").display().to_string()
    );

    cfg.ingest.require_manifest = true;
    let strict = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());
    let err = strict.run_job(&mut store, &tmp.path().join("old")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IngestError>(),
        Some(IngestError::MissingManifest { .. })
    ));
}

#[test]
fn simulated_run_builds_but_does_not_register() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "preview", OPTIMIZE);
    let mut store = SqliteStore::open(&cfg).unwrap();

    let opts = IngestOptions {
        simulate: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(&cfg, opts, StubParser::successful());
    let done = pipeline.run_job(&mut store, &job).unwrap();

    assert_eq!(done.outcome, Outcome::Simulated);
    assert_eq!(done.task_id, 0);
    let record = done.record.unwrap();
    let snl_final = record.snl_final.unwrap();
    assert_eq!(snl_final["history"][1]["description"]["task_id"], json!(0));
    assert!(snl_final.get("snl_id").is_none());
    assert!(record.snlgroup_id_final.is_none());

    assert_eq!(store.counter_value(TASK_COUNTER).unwrap(), 0);
    assert_eq!(store.counter_value("snl_id").unwrap(), 0);
    assert_eq!(store.count_tasks().unwrap(), 0);
}

#[test]
fn skipped_duplicate_does_not_register_again() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "twice", OPTIMIZE);
    let mut store = SqliteStore::open(&cfg).unwrap();
    let pipeline = Pipeline::new(&cfg, IngestOptions::default(), StubParser::successful());

    pipeline.run_job(&mut store, &job).unwrap();
    let again = pipeline.run_job(&mut store, &job).unwrap();

    assert_eq!(again.outcome, Outcome::SkippedDuplicate);
    assert_eq!(again.task_id, 1);
    assert_eq!(store.counter_value("snl_id").unwrap(), 1);
}

#[test]
fn update_reingest_keeps_registered_structure() {
    let cfg = memory_config();
    let tmp = tempfile::tempdir().unwrap();
    let job = modern_job(tmp.path(), "rerun", OPTIMIZE);
    let mut store = SqliteStore::open(&cfg).unwrap();
    let opts = IngestOptions {
        update_duplicates: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(&cfg, opts, StubParser::successful());

    let first = pipeline.run_job(&mut store, &job).unwrap();
    let mut a = store.get_task(&first.dir_name).unwrap().unwrap();
    let second = pipeline.run_job(&mut store, &job).unwrap();
    let mut b = store.get_task(&second.dir_name).unwrap().unwrap();

    assert_eq!(first.outcome, Outcome::Inserted);
    assert_eq!(second.outcome, Outcome::Updated);
    assert_eq!(store.counter_value("snl_id").unwrap(), 1);
    assert_eq!(store.counter_value("snlgroup_id").unwrap(), 1);
    assert_eq!(b.snl_final.as_ref().unwrap()["snl_id"], json!(1));

    a.last_updated = None;
    b.last_updated = None;
    assert_eq!(a, b);
}
