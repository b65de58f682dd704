pub mod command;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use command::CommandParser;

/// A parsed run as handed over by the output parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRun {
    /// Task document; must carry `dir_name` and `state`.
    pub doc: serde_json::Value,
    /// Whether density-of-states data was requested and parsed.
    #[serde(default)]
    pub parse_dos: bool,
}

/// Turns a finished job directory into a task document.
pub trait OutputParser {
    fn parse(&self, dir: &Path, parse_dos: bool) -> Result<ParsedRun>;
}
