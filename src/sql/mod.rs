//! SQL session abstraction — the seam between actions and live servers.
//!
//! Actions never build statement text. They describe the remote operation as
//! a [`SqlCommand`] (verb + named parameters) and the session maps it onto
//! whatever the server side installs. The advisory application lock RPC pair
//! rides the same trait so the whole surface can be faked in tests.

pub mod applock;
pub mod postgres;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::types::Instance;

/// The closed set of remote operations replicar issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandVerb {
    CreateDatabase,
    AlterDatabase,
    CreatePublication,
    DropPublication,
    AddArticle,
    DropArticle,
    CreateSubscription,
    DropSubscription,
    ConfigureMerge,
}

impl CommandVerb {
    /// Name of the server-installed procedure carrying this verb.
    pub fn procedure(&self) -> &'static str {
        match self {
            Self::CreateDatabase => "replicar_create_database",
            Self::AlterDatabase => "replicar_alter_database",
            Self::CreatePublication => "replicar_create_publication",
            Self::DropPublication => "replicar_drop_publication",
            Self::AddArticle => "replicar_add_article",
            Self::DropArticle => "replicar_drop_article",
            Self::CreateSubscription => "replicar_create_subscription",
            Self::DropSubscription => "replicar_drop_subscription",
            Self::ConfigureMerge => "replicar_configure_merge",
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateDatabase => "create_database",
            Self::AlterDatabase => "alter_database",
            Self::CreatePublication => "create_publication",
            Self::DropPublication => "drop_publication",
            Self::AddArticle => "add_article",
            Self::DropArticle => "drop_article",
            Self::CreateSubscription => "create_subscription",
            Self::DropSubscription => "drop_subscription",
            Self::ConfigureMerge => "configure_merge",
        };
        write!(f, "{}", name)
    }
}

/// One remote operation: a verb plus ordered named parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCommand {
    pub verb: CommandVerb,
    pub params: Vec<(&'static str, String)>,
}

impl SqlCommand {
    pub fn new(verb: CommandVerb) -> Self {
        Self {
            verb,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Requested exclusion mode for an application lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Owner scope of an application lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    Session,
    Transaction,
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// Parameters of the advisory-lock acquire RPC.
#[derive(Debug, Clone)]
pub struct AppLockRequest {
    pub resource: String,
    pub mode: LockMode,
    pub owner: LockOwner,
    pub timeout: Duration,
}

/// Errors raised by a session talking to a remote instance.
#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("connection to instance '{instance}' failed: {message}")]
    Connect { instance: String, message: String },

    #[error("{verb} on instance '{instance}' failed: {message}")]
    Execute {
        instance: String,
        verb: CommandVerb,
        message: String,
    },

    #[error("advisory lock rpc on instance '{instance}' failed: {message}")]
    Lock { instance: String, message: String },
}

/// A connection surface onto one or more SQL instances.
///
/// Status codes for the lock RPCs follow the advisory-lock contract: `0`
/// granted immediately, `1` granted after waiting, negative values are
/// timeout/cancel/deadlock/error and must not be retried automatically.
#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Issue one remote operation against `instance`.
    async fn execute(&self, instance: &Instance, command: &SqlCommand) -> Result<(), SqlError>;

    /// Acquire the named advisory application lock.
    async fn acquire_applock(
        &self,
        instance: &Instance,
        request: &AppLockRequest,
    ) -> Result<i32, SqlError>;

    /// Release the named advisory application lock.
    async fn release_applock(
        &self,
        instance: &Instance,
        resource: &str,
        owner: LockOwner,
    ) -> Result<i32, SqlError>;
}
