use super::{OutputParser, ParsedRun};
use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Runs an external parser process: request JSON on stdin, task JSON on stdout.
pub struct CommandParser {
    cfg: Config,
    program: PathBuf,
}

#[derive(Debug, Serialize)]
struct ParseRequest<'a> {
    dir: &'a Path,
    parse_dos: bool,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    doc: Option<serde_json::Value>,
    #[serde(default)]
    parse_dos: bool,
}

impl CommandParser {
    pub fn new(cfg: &Config) -> Result<Self> {
        let raw = cfg.parser.command.trim();
        if raw.is_empty() {
            return Err(anyhow!("parser.command is empty"));
        }
        Ok(Self {
            cfg: cfg.clone(),
            program: expand_tilde(raw),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run_json(&self, input: &ParseRequest<'_>) -> Result<ParseResponse> {
        let timeout = self.cfg.parser.timeout_seconds;
        debug!(
            "parser run {} {:?} timeout={}s",
            self.program.display(),
            self.cfg.parser.args,
            timeout
        );
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.cfg.parser.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning parser: {}", self.program.display()))?;

        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
            let bytes = serde_json::to_vec(input)?;
            stdin.write_all(&bytes)?;
            stdin.flush().ok();
        }

        let output = if timeout > 0 {
            wait_with_timeout(&mut child, Duration::from_secs(timeout))?
        } else {
            child
                .wait_with_output()
                .with_context(|| "waiting for parser")?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "parser failed for {}: {}\n{}",
                input.dir.display(),
                output.status,
                stderr
            ));
        }

        if self.cfg.debug.keep_parser_stderr && !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("parser stderr {}: {}", input.dir.display(), stderr.trim());
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("parsing parser JSON output for {}", input.dir.display()))
    }
}

impl OutputParser for CommandParser {
    fn parse(&self, dir: &Path, parse_dos: bool) -> Result<ParsedRun> {
        let out = self.run_json(&ParseRequest { dir, parse_dos })?;
        if let Some(err) = out.error.as_deref() {
            return Err(anyhow!("parser error for {}: {err}", dir.display()));
        }
        let doc = out
            .doc
            .ok_or_else(|| anyhow!("parser returned no document for {}", dir.display()))?;
        Ok(ParsedRun {
            doc,
            parse_dos: parse_dos && out.parse_dos,
        })
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output> {
    // Drain both pipes while waiting; a chatty parser would otherwise block on a
    // full pipe buffer and never exit.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout_reader {
            out.read_to_end(&mut buf).with_context(|| "read stdout")?;
        }
        Ok(buf)
    });

    let stderr_thread = std::thread::spawn(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr_reader {
            err.read_to_end(&mut buf).with_context(|| "read stderr")?;
        }
        Ok(buf)
    });

    let join = |h: std::thread::JoinHandle<Result<Vec<u8>>>, what: &str| -> Result<Vec<u8>> {
        h.join()
            .map_err(|_| anyhow!("{what} reader thread panicked"))?
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().with_context(|| "try_wait")? {
            return Ok(Output {
                status,
                stdout: join(stdout_thread, "stdout")?,
                stderr: join(stderr_thread, "stderr")?,
            });
        }

        if start.elapsed() > timeout {
            warn!("parser process timed out after {:?}", timeout);
            let _ = child.kill();
            child.wait().with_context(|| "wait after kill")?;
            let _ = join(stdout_thread, "stdout");
            let stderr = join(stderr_thread, "stderr").unwrap_or_default();
            return Err(anyhow!(
                "parser exceeded timeout ({:?}); stderr: {}",
                timeout,
                String::from_utf8_lossy(&stderr)
            ));
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}
