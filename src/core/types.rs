//! Topology manifest types and the compiled plan.
//!
//! The manifest (`replicar.yaml`) declares SQL instances and named targets;
//! each target holds an ordered list of declarative steps that compile to
//! actions. Maps are order-preserving: plan order is declaration order.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::expand::Expression;
use crate::actions::Action;

// ============================================================================
// Top-level replicar.yaml
// ============================================================================

/// Root manifest — the desired replication topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable topology name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Default argument values (overridable from the command line)
    #[serde(default)]
    pub args: HashMap<String, String>,

    /// SQL instance inventory
    #[serde(default)]
    pub instances: IndexMap<String, InstanceSpec>,

    /// Named deployment targets (order-preserving)
    pub targets: IndexMap<String, Target>,
}

/// Connection descriptor for one instance, as declared in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Connection string; may contain `[name]` placeholders
    pub dsn: Expression,
}

/// A logical SQL server endpoint, resolved at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub dsn: String,
}

impl Instance {
    pub fn new(name: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dsn: dsn.into(),
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ============================================================================
// Targets and steps
// ============================================================================

/// A named, independently invocable subset of the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Instance the target's actions bind to
    pub instance: String,

    /// Default database name passed to each step
    #[serde(default)]
    pub database: Option<Expression>,

    /// Default publication name passed to each step
    #[serde(default)]
    pub publication: Option<Expression>,

    /// Targets deployed first when this one is requested (one level deep)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Ordered declarative steps
    pub steps: Vec<Step>,
}

/// One declarative step; compiles to one or more actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    CreateDatabase {
        #[serde(default)]
        database: Option<Expression>,
    },
    AlterDatabase {
        option: Expression,
        value: Expression,
    },
    Publication {
        #[serde(default)]
        publication: Option<Expression>,
        /// Publication kind; parsed as [`PublicationKind`] after expansion
        #[serde(default)]
        replication: Option<Expression>,
        /// Snapshot directory; relative paths resolve against the manifest
        #[serde(default)]
        snapshot_dir: Option<Expression>,
    },
    DropPublication {
        #[serde(default)]
        publication: Option<Expression>,
    },
    Article {
        table: Expression,
        #[serde(default)]
        name: Option<Expression>,
        #[serde(default)]
        filter: Option<Expression>,
    },
    DropArticle {
        name: Expression,
    },
    Subscription {
        subscriber: String,
        #[serde(default)]
        database: Option<Expression>,
    },
    DropSubscription {
        subscriber: String,
    },
    Merge {},
}

impl Step {
    /// Step kind name, for validation and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CreateDatabase { .. } => "create_database",
            Self::AlterDatabase { .. } => "alter_database",
            Self::Publication { .. } => "publication",
            Self::DropPublication { .. } => "drop_publication",
            Self::Article { .. } => "article",
            Self::DropArticle { .. } => "drop_article",
            Self::Subscription { .. } => "subscription",
            Self::DropSubscription { .. } => "drop_subscription",
            Self::Merge {} => "merge",
        }
    }
}

/// Replication kind of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationKind {
    Transactional,
    Snapshot,
}

impl FromStr for PublicationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactional" => Ok(Self::Transactional),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PublicationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transactional => write!(f, "transactional"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Compiled, ready-to-run topology: target name → ordered action list.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Topology name
    pub name: String,

    /// BLAKE3 fingerprint of the manifest source, recorded in event logs
    pub fingerprint: String,

    /// Compiled targets in declaration order
    pub targets: IndexMap<String, PlanTarget>,
}

impl Plan {
    pub fn get(&self, name: &str) -> Option<&PlanTarget> {
        self.targets.get(name)
    }

    /// Target names in plan order.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }
}

/// One compiled target.
#[derive(Debug, Clone)]
pub struct PlanTarget {
    pub name: String,
    pub instance: Instance,
    pub depends_on: Vec<String>,
    pub actions: Vec<Action>,
}

// ============================================================================
// Execution outcomes
// ============================================================================

/// Result of one target's run, shared verbatim by every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: String,
    pub actions_executed: usize,
    pub duration: Duration,
}

/// Result of a whole deployment invocation.
#[derive(Debug, Clone)]
pub struct DeploySummary {
    pub outcomes: Vec<TargetOutcome>,
    pub duration: Duration,
}
