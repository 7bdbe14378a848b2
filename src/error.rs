//! Error taxonomy — compile-time, lock, job, and deployment errors.
//!
//! Compile errors are reported before any remote side effect occurs.
//! Execution errors are captured per target; `DeployError::Aggregate` names
//! every failing target when several run together.

use std::sync::Arc;
use std::time::Duration;

use crate::sql::SqlError;

/// Errors raised while turning a topology manifest into a plan.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate target '{0}'")]
    DuplicateTarget(String),

    #[error("undefined variable '[{variable}]' in {element}")]
    UndefinedVariable { variable: String, element: String },

    #[error("cyclic variable reference while expanding '{template}'")]
    CyclicVariable { template: String },

    #[error("'{value}' is not a valid {expected} in {element}")]
    Format {
        value: String,
        expected: &'static str,
        element: String,
    },

    #[error("cannot convert '{value}' to {expected} in {element}")]
    Conversion {
        value: String,
        expected: &'static str,
        element: String,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a single action against a single instance.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("{operation} is not supported")]
    Unsupported { operation: String },

    #[error("action canceled")]
    Canceled,
}

/// Errors raised while acquiring or holding an exclusion gate.
///
/// Negative advisory-lock status codes map onto these fail-fast; they are
/// never retried silently.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for lock '{resource}'")]
    Timeout { resource: String, timeout: Duration },

    #[error("wait for lock '{resource}' was canceled")]
    Canceled { resource: String },

    #[error("deadlock victim while acquiring lock '{resource}'")]
    Deadlock { resource: String },

    #[error("lock rpc returned status {status} for '{resource}'")]
    Protocol { resource: String, status: i32 },

    #[error("lock rpc failed: {0}")]
    Rpc(#[source] SqlError),
}

/// Errors observed by one waiter of a shared job.
///
/// `Canceled` is local to the waiter whose signal fired; it never surfaces
/// to, or affects, the other waiters of the same run.
#[derive(Debug, thiserror::Error)]
pub enum JobError<E>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    #[error("wait canceled by caller")]
    Canceled,

    #[error("job disposed")]
    Disposed,

    #[error("{0}")]
    Faulted(Arc<E>),
}

impl<E> Clone for JobError<E>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    fn clone(&self) -> Self {
        match self {
            Self::Canceled => Self::Canceled,
            Self::Disposed => Self::Disposed,
            Self::Faulted(e) => Self::Faulted(Arc::clone(e)),
        }
    }
}

/// One failing target inside a composite deployment failure.
#[derive(Debug, Clone)]
pub struct TargetFailure {
    pub target: String,
    pub error: Arc<DeployError>,
}

/// Errors raised while executing a plan.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("target '{target}' failed at {action}: {source}")]
    Action {
        target: String,
        action: String,
        #[source]
        source: ExecuteError,
    },

    #[error("target '{target}': {source}")]
    Lock {
        target: String,
        #[source]
        source: LockError,
    },

    #[error("dependency '{dependency}' of target '{target}' failed: {error}")]
    CatchUp {
        target: String,
        dependency: String,
        error: Arc<DeployError>,
    },

    #[error("deployment canceled")]
    Canceled,

    #[error("executor disposed")]
    Disposed,

    #[error("deployment failed for {} target(s): {}", .0.len(), format_failures(.0))]
    Aggregate(Vec<TargetFailure>),
}

fn format_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.target, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::CommandVerb;

    #[test]
    fn test_compile_error_display() {
        let e = CompileError::UndefinedVariable {
            variable: "env".to_string(),
            element: "target 'publisher-init'".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "undefined variable '[env]' in target 'publisher-init'"
        );
    }

    #[test]
    fn test_lock_error_display() {
        let e = LockError::Protocol {
            resource: "replicar/primary".to_string(),
            status: -999,
        };
        assert!(e.to_string().contains("-999"));
        assert!(e.to_string().contains("replicar/primary"));
    }

    #[test]
    fn test_job_error_clone_shares_fault() {
        let inner = Arc::new(SqlError::Execute {
            instance: "primary".to_string(),
            verb: CommandVerb::AddArticle,
            message: "boom".to_string(),
        });
        let e: JobError<SqlError> = JobError::Faulted(Arc::clone(&inner));
        let c = e.clone();
        match (e, c) {
            (JobError::Faulted(a), JobError::Faulted(b)) => {
                assert!(Arc::ptr_eq(&a, &b));
            }
            other => panic!("unexpected clone: {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_names_each_target() {
        let e = DeployError::Aggregate(vec![
            TargetFailure {
                target: "a".to_string(),
                error: Arc::new(DeployError::Canceled),
            },
            TargetFailure {
                target: "b".to_string(),
                error: Arc::new(DeployError::UnknownTarget("c".to_string())),
            },
        ]);
        let msg = e.to_string();
        assert!(msg.contains("2 target(s)"));
        assert!(msg.contains("a: deployment canceled"));
        assert!(msg.contains("b: unknown target 'c'"));
    }
}
