use crate::{
    config::Config,
    error::IngestError,
    ingest::{self, IngestOptions, Ingested},
    layout::JobLayout,
    manifest::Manifest,
    parser::OutputParser,
    record::JobRecord,
    report::{self, SignalReport},
    store::{StructureRegistry, TaskStore},
};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

/// Ingests one finished job: classify, assemble, store.
pub struct Pipeline<P: OutputParser> {
    cfg: Config,
    opts: IngestOptions,
    parser: P,
}

impl<P: OutputParser> Pipeline<P> {
    pub fn new(cfg: &Config, opts: IngestOptions, parser: P) -> Self {
        Self {
            cfg: cfg.clone(),
            opts,
            parser,
        }
    }

    pub fn run_job<S>(&self, store: &mut S, job_dir: &Path) -> Result<Ingested>
    where
        S: TaskStore + StructureRegistry,
    {
        let layout = JobLayout::resolve(&self.cfg, job_dir);
        debug!(?layout, "job {}", job_dir.display());

        let manifest = self.load_manifest(job_dir, &layout)?;

        let parsed = self
            .parser
            .parse(job_dir, self.opts.parse_dos)
            .with_context(|| format!("parsing {}", job_dir.display()))?;
        let mut record = JobRecord::from_parsed(parsed.doc)?;
        if let Some(m) = &manifest {
            record.apply_manifest(m);
        }

        let signals = self.classify(job_dir, &layout);
        info!(
            "{} signals={:?} critical={:?}",
            record.dir_name, signals.signals, signals.critical_signals
        );
        record.apply_signals(signals);

        let cfg = &self.cfg;
        let simulate = self.opts.simulate;
        ingest::upsert_with(
            store,
            cfg,
            self.opts,
            record,
            parsed.parse_dos,
            |store, rec| {
                let Some(derived) = rec.derive_structure(cfg) else {
                    return Ok(());
                };
                if simulate {
                    rec.snl_final = Some(derived);
                    return Ok(());
                }
                // An update keeps the structure registered by the first ingest.
                let prior = store
                    .get_task(&rec.dir_name)
                    .with_context(|| format!("reading prior record for {}", rec.dir_name))?;
                if prior.is_some_and(|p| rec.carry_registration(p)) {
                    debug!("{} keeps its registered structure", rec.dir_name);
                    return Ok(());
                }
                let (registered, group_id) = store
                    .register(&derived)
                    .with_context(|| format!("registering structure for {}", rec.dir_name))?;
                rec.apply_registration(registered, group_id);
                Ok(())
            },
        )
    }

    pub fn classify(&self, job_dir: &Path, layout: &JobLayout) -> SignalReport {
        report::detect_all(&self.cfg, job_dir, layout)
    }

    fn load_manifest(&self, job_dir: &Path, layout: &JobLayout) -> Result<Option<Manifest>> {
        match layout {
            JobLayout::Modern { manifest } => Ok(Some(Manifest::load(manifest)?)),
            JobLayout::Legacy if self.cfg.ingest.require_manifest => {
                Err(IngestError::MissingManifest {
                    path: job_dir.join(&self.cfg.layout.manifest_filename),
                    field: "the manifest file".into(),
                }
                .into())
            }
            JobLayout::Legacy => Ok(None),
        }
    }
}
