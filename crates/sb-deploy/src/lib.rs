//! Deployment descriptor (`docker-compose.yml`) model and validator.

pub mod model;
pub mod validate;
pub mod vars;

pub use model::ComposeFile;
pub use validate::{validate, Issue, Report};
pub use vars::{referenced_variables, substitute, VarRef};

use sb_core::{errors::Error, Result};

pub fn parse(src: &str) -> Result<ComposeFile> {
    serde_yaml::from_str(src).map_err(|e| Error::InvalidInput(format!("compose file: {e}")))
}

/// Read and parse a compose file from disk.
pub fn load(path: &std::path::Path) -> Result<ComposeFile> {
    let src = std::fs::read_to_string(path)?;
    parse(&src)
}
