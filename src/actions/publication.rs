//! Publication actions — create and drop a publication on a database.

use crate::core::types::{Instance, PublicationKind};
use crate::sql::{CommandVerb, SqlCommand};

/// Register a publication on the bound instance's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePublication {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
    pub kind: PublicationKind,
    /// Snapshot directory, already resolved against the manifest location.
    pub snapshot_dir: Option<String>,
}

impl CreatePublication {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::CreatePublication)
            .param("database", &self.database)
            .param("publication", &self.publication)
            .param("replication", self.kind.to_string())
            .param(
                "snapshot_dir",
                self.snapshot_dir.clone().unwrap_or_default(),
            )
    }

    pub fn describe(&self) -> String {
        format!(
            "create_publication '{}' ({}) on '{}' @ {}",
            self.publication, self.kind, self.database, self.instance
        )
    }
}

/// Remove a publication from the bound instance's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropPublication {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
}

impl DropPublication {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::DropPublication)
            .param("database", &self.database)
            .param("publication", &self.publication)
    }

    pub fn describe(&self) -> String {
        format!(
            "drop_publication '{}' on '{}' @ {}",
            self.publication, self.database, self.instance
        )
    }
}
