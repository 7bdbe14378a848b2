//! Manifest parsing and validation.
//!
//! Parses `replicar.yaml` and validates structural constraints:
//! - Version must be "1.0"
//! - Instance references in targets and subscription steps must exist
//! - depends_on references must exist and not be self-references
//! - Required names per step kind (database, publication)

use std::path::Path;

use super::types::*;
use crate::error::CompileError;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a replicar.yaml file from disk.
pub fn parse_manifest_file(path: &Path) -> Result<Topology, CompileError> {
    let content = std::fs::read_to_string(path).map_err(|e| CompileError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_manifest(&content)
}

/// Parse a replicar.yaml from a string.
pub fn parse_manifest(yaml: &str) -> Result<Topology, CompileError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| CompileError::Manifest(e.to_string()))
}

/// Validate a parsed topology. Returns a list of errors (empty = valid).
pub fn validate_topology(topology: &Topology) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if topology.version != "1.0" {
        push(format!(
            "version must be \"1.0\", got \"{}\"",
            topology.version
        ));
    }

    if topology.name.is_empty() {
        push("name must not be empty".to_string());
    }

    for (name, spec) in &topology.instances {
        if name.is_empty() {
            push("instance names must not be empty".to_string());
        }
        if spec.dsn.raw().is_empty() {
            push(format!("instance '{}' has an empty dsn", name));
        }
    }

    for (name, target) in &topology.targets {
        if !topology.instances.contains_key(&target.instance) {
            push(format!(
                "target '{}' references unknown instance '{}'",
                name, target.instance
            ));
        }

        for dep in &target.depends_on {
            if !topology.targets.contains_key(dep) {
                push(format!(
                    "target '{}' depends on unknown target '{}'",
                    name, dep
                ));
            }
            if dep == name {
                push(format!("target '{}' depends on itself", name));
            }
        }

        if target.steps.is_empty() {
            push(format!("target '{}' has no steps", name));
        }

        for step in &target.steps {
            validate_step(topology, name, target, step, &mut push);
        }
    }

    errors
}

fn validate_step(
    topology: &Topology,
    target_name: &str,
    target: &Target,
    step: &Step,
    push: &mut impl FnMut(String),
) {
    let has_database =
        target.database.is_some() || matches!(step, Step::CreateDatabase { database: Some(_) });
    if !has_database {
        push(format!(
            "target '{}' step '{}' has no database (set it on the target or the step)",
            target_name,
            step.kind_name()
        ));
    }

    match step {
        Step::Publication { publication, .. } | Step::DropPublication { publication } => {
            if publication.is_none() && target.publication.is_none() {
                push(format!(
                    "target '{}' step '{}' has no publication name",
                    target_name,
                    step.kind_name()
                ));
            }
        }
        Step::Article { table, .. } => {
            if table.raw().is_empty() {
                push(format!(
                    "target '{}' step 'article' has an empty table",
                    target_name
                ));
            }
            if target.publication.is_none() {
                push(format!(
                    "target '{}' step 'article' needs a target publication",
                    target_name
                ));
            }
        }
        Step::DropArticle { .. } | Step::Merge {} => {
            if target.publication.is_none() {
                push(format!(
                    "target '{}' step '{}' needs a target publication",
                    target_name,
                    step.kind_name()
                ));
            }
        }
        Step::Subscription { subscriber, .. } | Step::DropSubscription { subscriber } => {
            if !topology.instances.contains_key(subscriber) {
                push(format!(
                    "target '{}' step '{}' references unknown subscriber instance '{}'",
                    target_name,
                    step.kind_name(),
                    subscriber
                ));
            }
            if target.publication.is_none() {
                push(format!(
                    "target '{}' step '{}' needs a target publication",
                    target_name,
                    step.kind_name()
                ));
            }
        }
        Step::CreateDatabase { .. } | Step::AlterDatabase { .. } => {}
    }
}
