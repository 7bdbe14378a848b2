//! Database actions — create a database, set a database-level option.

use crate::core::types::Instance;
use crate::sql::{CommandVerb, SqlCommand};

/// Create a database on the bound instance. Idempotent server-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDatabase {
    pub instance: Instance,
    pub database: String,
}

impl CreateDatabase {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::CreateDatabase).param("database", &self.database)
    }

    pub fn describe(&self) -> String {
        format!("create_database '{}' @ {}", self.database, self.instance)
    }
}

/// Set a replication-relevant database option (e.g. publish = true).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterDatabase {
    pub instance: Instance,
    pub database: String,
    pub option: String,
    pub value: String,
}

impl AlterDatabase {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::AlterDatabase)
            .param("database", &self.database)
            .param("option", &self.option)
            .param("value", &self.value)
    }

    pub fn describe(&self) -> String {
        format!(
            "alter_database '{}' set {}={} @ {}",
            self.database, self.option, self.value, self.instance
        )
    }
}
