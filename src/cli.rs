use crate::{
    config::Config,
    ingest::{IngestOptions, Ingested},
    layout::{JobLayout, is_valid_dir, select_last_relax_dir},
    parser::CommandParser,
    pipeline::Pipeline,
    report,
    store::{SqliteStore, TASK_COUNTER, TaskStore},
    util::ensure_dir,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskdrone")]
#[command(about = "Classify finished simulation jobs and record them in the task store")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./taskdrone.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show store and parser status.
    Doctor {},
    /// Show the job layout and which directory would be analyzed.
    Check {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Run the anomaly detectors over a job and print the signal report.
    Signals {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Parse, classify and store one or more jobs.
    Ingest {
        #[arg(long = "dir", required = true)]
        dirs: Vec<PathBuf>,
        #[arg(long)]
        simulate: bool,
        #[arg(long)]
        update_duplicates: bool,
        #[arg(long)]
        parse_dos: bool,
        /// Number of jobs ingested at once, each with its own store connection.
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Print a stored task record.
    Show {
        #[arg(long)]
        dir_name: String,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref());
    let cfg = Config::load_or_default(&cfg_path)?;
    let _guard = init_logging(&args, &cfg, resolve_log_path(&cfg).as_deref())?;
    info!("config={}", cfg_path.display());

    if cfg.debug.dump_effective_config {
        let raw = toml::to_string(&cfg).unwrap_or_default();
        println!("{raw}");
    }

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Check { dir } => check(&cfg, dir),
        Command::Signals { dir } => signals(&cfg, dir),
        Command::Ingest {
            dirs,
            simulate,
            update_duplicates,
            parse_dos,
            parallel,
        } => {
            let mut opts = IngestOptions::from_config(&cfg);
            opts.simulate |= *simulate;
            opts.update_duplicates |= *update_duplicates;
            opts.parse_dos |= *parse_dos;
            let parallel = parallel.unwrap_or(cfg.ingest.max_parallel_jobs);
            ingest(&cfg, opts, dirs, parallel)
        }
        Command::Show { dir_name } => show(&cfg, dir_name),
    }
}

fn resolve_config_path(user: Option<&Path>) -> PathBuf {
    if let Some(p) = user {
        return p.to_path_buf();
    }
    let default = PathBuf::from("taskdrone.toml");
    if default.exists() {
        default
    } else {
        PathBuf::from("taskdrone.example.toml")
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from("taskdrone.log"))
}

fn doctor(cfg: &Config) -> Result<()> {
    let store = SqliteStore::open(cfg)?;
    let parser = CommandParser::new(cfg)?;
    let program = parser.program();
    let parser_found = program.is_file() || which(program).is_some();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "store": cfg.store.path,
            "task_counter": store.counter_value(TASK_COUNTER)?,
            "tasks": store.count_tasks()?,
            "parser": program,
            "parser_found": parser_found,
        }))?
    );
    Ok(())
}

fn which(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return None;
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn check(cfg: &Config, dir: &Path) -> Result<()> {
    let layout = JobLayout::resolve(cfg, dir);
    let candidates = [
        dir.join(&cfg.layout.second_stage_dir),
        dir.to_path_buf(),
        dir.join(&cfg.layout.first_stage_dir),
    ];
    let validity: Vec<_> = candidates
        .iter()
        .map(|c| serde_json::json!({ "dir": c, "valid": is_valid_dir(cfg, c) }))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "layout": layout,
            "candidates": validity,
            "selected": select_last_relax_dir(cfg, dir, &layout),
        }))?
    );
    Ok(())
}

fn signals(cfg: &Config, dir: &Path) -> Result<()> {
    let layout = JobLayout::resolve(cfg, dir);
    let report = report::detect_all(cfg, dir, &layout);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn ingest(cfg: &Config, opts: IngestOptions, dirs: &[PathBuf], parallel: usize) -> Result<()> {
    let workers = parallel.clamp(1, dirs.len().max(1));

    // Create the schema once before workers race to open the same file.
    drop(SqliteStore::open(cfg)?);

    let mut results: Vec<(usize, Result<Ingested>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                scope.spawn(move || {
                    let mine: Vec<usize> = (w..dirs.len()).step_by(workers).collect();
                    ingest_worker(cfg, opts, dirs, &mine)
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| {
                h.join()
                    .unwrap_or_else(|_| vec![(usize::MAX, Err(anyhow!("ingest worker panicked")))])
            })
            .collect()
    });
    results.sort_by_key(|(i, _)| *i);

    let mut failed = 0usize;
    for (i, res) in results {
        let dir = dirs.get(i).map(|d| d.display().to_string()).unwrap_or_default();
        match res {
            Ok(done) => {
                let summary = serde_json::json!({
                    "dir": dir,
                    "dir_name": done.dir_name,
                    "task_id": done.task_id,
                    "outcome": done.outcome,
                });
                println!("{}", serde_json::to_string(&summary)?);
                if let (true, Some(record)) = (opts.simulate, done.record.as_ref()) {
                    println!("{}", serde_json::to_string_pretty(record)?);
                }
            }
            Err(err) => {
                failed += 1;
                error!("ingest failed for {dir}: {err:#}");
                println!(
                    "{}",
                    serde_json::to_string(&serde_json::json!({
                        "dir": dir,
                        "error": format!("{err:#}"),
                    }))?
                );
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} of {} jobs failed", dirs.len()));
    }
    Ok(())
}

fn ingest_worker(
    cfg: &Config,
    opts: IngestOptions,
    dirs: &[PathBuf],
    indices: &[usize],
) -> Vec<(usize, Result<Ingested>)> {
    let setup = SqliteStore::open(cfg).and_then(|store| Ok((store, CommandParser::new(cfg)?)));
    let (mut store, parser) = match setup {
        Ok(s) => s,
        Err(err) => {
            let msg = format!("{err:#}");
            return indices
                .iter()
                .map(|&i| (i, Err(anyhow!("store setup failed: {msg}"))))
                .collect();
        }
    };
    let pipeline = Pipeline::new(cfg, opts, parser);
    indices
        .iter()
        .map(|&i| (i, pipeline.run_job(&mut store, &dirs[i])))
        .collect()
}

fn show(cfg: &Config, dir_name: &str) -> Result<()> {
    let store = SqliteStore::open(cfg)?;
    let record = store
        .get_task(dir_name)?
        .ok_or_else(|| anyhow!("no task stored for dir_name {dir_name}"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
