pub mod cli;
pub mod config;
pub mod error;
pub mod ingest;
pub mod layout;
pub mod manifest;
pub mod parser;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod report;
pub mod signals;
pub mod store;
pub mod util;
