//! Merge publication setup — an explicit unsupported gap.
//!
//! The variant exists so manifests naming a merge step compile and fail
//! loudly at execution, clearly distinguishable from transient failures.
//! It never issues a remote operation.

use crate::core::types::Instance;
use crate::error::ExecuteError;

/// Configure a merge publication. Not implemented; always fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureMerge {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
}

impl ConfigureMerge {
    pub fn execute(&self) -> Result<(), ExecuteError> {
        Err(ExecuteError::Unsupported {
            operation: format!(
                "merge publication '{}' on '{}'",
                self.publication, self.database
            ),
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "configure_merge '{}' on '{}' @ {} (unsupported)",
            self.publication, self.database, self.instance
        )
    }
}
