mod common;

use common::{finished_run, write};
use taskdrone::{
    config::Config,
    layout::{JobLayout, is_valid_dir, select_last_relax_dir},
};

#[test]
fn missing_kpoints_is_invalid() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    finished_run(tmp.path());
    assert!(is_valid_dir(&cfg, tmp.path()));

    std::fs::remove_file(tmp.path().join("KPOINTS")).unwrap();
    assert!(!is_valid_dir(&cfg, tmp.path()));
}

#[test]
fn zero_byte_marker_is_invalid() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    finished_run(tmp.path());
    write(tmp.path(), "OUTCAR", "");
    assert!(!is_valid_dir(&cfg, tmp.path()));
}

#[test]
fn each_marker_is_required() {
    let cfg = Config::default();
    for marker in &cfg.layout.marker_files {
        let tmp = tempfile::tempdir().unwrap();
        finished_run(tmp.path());
        std::fs::remove_file(tmp.path().join(marker)).unwrap();
        assert!(!is_valid_dir(&cfg, tmp.path()), "{marker} should be required");
    }
}

#[test]
fn second_stage_wins_over_base() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    finished_run(tmp.path());
    finished_run(&tmp.path().join("relax2"));

    let layout = JobLayout::resolve(&cfg, tmp.path());
    assert_eq!(layout, JobLayout::Legacy);
    assert_eq!(
        select_last_relax_dir(&cfg, tmp.path(), &layout),
        tmp.path().join("relax2")
    );
}

#[test]
fn base_used_when_second_stage_is_broken() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    finished_run(tmp.path());
    finished_run(&tmp.path().join("relax2"));
    write(&tmp.path().join("relax2"), "POSCAR", "");

    let layout = JobLayout::resolve(&cfg, tmp.path());
    assert_eq!(select_last_relax_dir(&cfg, tmp.path(), &layout), tmp.path());
}

#[test]
fn falls_back_to_first_stage_even_when_invalid() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    write(&tmp.path().join("relax1"), "INCAR", "ENCUT = 520\n");

    let layout = JobLayout::resolve(&cfg, tmp.path());
    assert_eq!(
        select_last_relax_dir(&cfg, tmp.path(), &layout),
        tmp.path().join("relax1")
    );
}

#[test]
fn modern_jobs_are_analyzed_in_place() {
    let cfg = Config::default();
    let tmp = tempfile::tempdir().unwrap();
    finished_run(&tmp.path().join("relax2"));
    write(tmp.path(), "FW.json", "{}");

    let layout = JobLayout::resolve(&cfg, tmp.path());
    assert!(!layout.is_legacy());
    assert_eq!(select_last_relax_dir(&cfg, tmp.path(), &layout), tmp.path());
}
