//! Deployment execution — single-flight targets gated by locks.
//!
//! Each requested target runs through a per-target [`AsyncJob`], so
//! concurrent requests for the same name share one run. The job's underlying
//! operation serializes on the target instance twice: an in-process named
//! mutex, then the cross-process advisory application lock. Actions run
//! strictly in compiled order and the first failure aborts the rest of the
//! target. Sibling targets are independent; their failures are collected
//! into one aggregate.
//!
//! The job registry is owned by the executor — never global — so executors
//! in tests do not interfere. The registry lock is held only for state
//! inspection, never across an awaited remote call.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{self, DeployEvent, EventLog};
use super::types::*;
use crate::actions::ExecuteContext;
use crate::error::{DeployError, JobError, TargetFailure};
use crate::sql::applock::AppLock;
use crate::sql::{LockMode, LockOwner, SqlSession};
use crate::sync::{AsyncJob, NamedMutexes};

/// Tunables for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Timeout for both the in-process gate and the application lock.
    pub lock_timeout: Duration,

    /// Deployment event log directory; `None` disables event logging.
    pub log_dir: Option<std::path::PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            log_dir: None,
        }
    }
}

type TargetJob = AsyncJob<TargetOutcome, DeployError>;

/// Runs a compiled plan against live instances.
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    plan: Plan,
    session: Arc<dyn SqlSession>,
    options: ExecutorOptions,
    events: EventLog,
    jobs: StdMutex<FxHashMap<String, TargetJob>>,
    gates: NamedMutexes,
    run_id: String,
}

impl Executor {
    pub fn new(plan: Plan, session: Arc<dyn SqlSession>, options: ExecutorOptions) -> Self {
        let events = EventLog::new(options.log_dir.clone());
        Self {
            inner: Arc::new(Inner {
                plan,
                session,
                options,
                events,
                jobs: StdMutex::new(FxHashMap::default()),
                gates: NamedMutexes::new(),
                run_id: events::generate_run_id(),
            }),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.inner.plan
    }

    /// Execute the requested targets; an empty slice runs every target in
    /// plan order.
    ///
    /// `cancel` withdraws only this caller's interest in each target's
    /// shared run. Independent targets run concurrently; a failing target
    /// never cancels its siblings, and all failures are reported together.
    pub async fn deploy(
        &self,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<DeploySummary, DeployError> {
        let started = Instant::now();
        let requested: Vec<String> = if targets.is_empty() {
            self.inner.plan.target_names()
        } else {
            targets.to_vec()
        };
        for name in &requested {
            if self.inner.plan.get(name).is_none() {
                return Err(DeployError::UnknownTarget(name.clone()));
            }
        }

        let _ = self.inner.events.append(
            "deploy",
            DeployEvent::DeployStarted {
                topology: self.inner.plan.name.clone(),
                run_id: self.inner.run_id.clone(),
                replicar_version: env!("CARGO_PKG_VERSION").to_string(),
                fingerprint: self.inner.plan.fingerprint.clone(),
            },
        );
        info!(
            topology = %self.inner.plan.name,
            targets = requested.len(),
            "deployment started"
        );

        let waits = requested.iter().map(|name| {
            let name = name.clone();
            let cancel = cancel.child_token();
            async move {
                let result = self.run_with_catchup(&name, &cancel).await;
                (name, result)
            }
        });
        let results = join_all(waits).await;

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => failures.push(TargetFailure {
                    target: name,
                    error,
                }),
            }
        }

        let duration = started.elapsed();
        let _ = self.inner.events.append(
            "deploy",
            DeployEvent::DeployCompleted {
                topology: self.inner.plan.name.clone(),
                run_id: self.inner.run_id.clone(),
                targets_succeeded: outcomes.len() as u32,
                targets_failed: failures.len() as u32,
                total_seconds: duration.as_secs_f64(),
            },
        );

        if failures.is_empty() {
            info!(
                topology = %self.inner.plan.name,
                targets = outcomes.len(),
                "deployment complete"
            );
            Ok(DeploySummary { outcomes, duration })
        } else {
            warn!(
                topology = %self.inner.plan.name,
                failed = failures.len(),
                "deployment completed with failures"
            );
            Err(DeployError::Aggregate(failures))
        }
    }

    /// Cancel every outstanding waiter and retire all jobs.
    pub fn dispose(&self) {
        let jobs: Vec<TargetJob> = {
            let jobs = self
                .inner
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            jobs.values().cloned().collect()
        };
        for job in jobs {
            job.dispose();
        }
    }

    /// Deploy the target's direct dependencies first, then the target.
    ///
    /// Catch-up is one level deep: dependencies of dependencies are not
    /// followed.
    async fn run_with_catchup(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome, Arc<DeployError>> {
        let depends_on = match self.inner.plan.get(name) {
            Some(target) => target.depends_on.clone(),
            None => return Err(Arc::new(DeployError::UnknownTarget(name.to_string()))),
        };

        for dependency in &depends_on {
            if self.inner.plan.get(dependency).is_none() {
                return Err(Arc::new(DeployError::UnknownTarget(dependency.clone())));
            }
            if let Err(error) = self.deploy_single(dependency, cancel).await {
                return Err(Arc::new(DeployError::CatchUp {
                    target: name.to_string(),
                    dependency: dependency.clone(),
                    error,
                }));
            }
        }

        self.deploy_single(name, cancel).await
    }

    /// Wait on the target's shared job, creating it on first request.
    async fn deploy_single(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome, Arc<DeployError>> {
        let job = self.job_for(name);
        let result = job.wait(cancel).await;

        // Settled and fully drained means the next request gets a fresh run.
        {
            let mut jobs = self
                .inner
                .jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = jobs.get(name) {
                if existing.try_retire() {
                    jobs.remove(name);
                }
            }
        }

        result.map_err(|e| match e {
            JobError::Canceled => Arc::new(DeployError::Canceled),
            JobError::Disposed => Arc::new(DeployError::Disposed),
            JobError::Faulted(error) => error,
        })
    }

    fn job_for(&self, name: &str) -> TargetJob {
        let mut jobs = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.get(name) {
            return job.clone();
        }

        let weak = Arc::downgrade(&self.inner);
        let target = name.to_string();
        let job = AsyncJob::new(move |run_cancel| {
            let weak: Weak<Inner> = weak.clone();
            let target = target.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(DeployError::Disposed);
                };
                Inner::run_target(inner, target, run_cancel).await
            }
        });
        jobs.insert(name.to_string(), job.clone());
        job
    }
}

impl Inner {
    /// One shared run of one target: gate, app lock, actions in order.
    async fn run_target(
        inner: Arc<Inner>,
        name: String,
        cancel: CancellationToken,
    ) -> Result<TargetOutcome, DeployError> {
        let target = inner
            .plan
            .get(&name)
            .ok_or_else(|| DeployError::UnknownTarget(name.clone()))?;
        let started = Instant::now();

        let _ = inner.events.append(
            &name,
            DeployEvent::TargetStarted {
                target: name.clone(),
                instance: target.instance.name.clone(),
                run_id: inner.run_id.clone(),
            },
        );
        info!(target = %name, instance = %target.instance, "target started");

        let gate_name = format!("instance/{}", target.instance.name);
        let _gate = inner
            .gates
            .lock_timeout(&gate_name, inner.options.lock_timeout)
            .await
            .map_err(|e| DeployError::Lock {
                target: name.clone(),
                source: e,
            })?;

        let resource = format!("replicar/{}", target.instance.name);
        let applock = AppLock::acquire(
            Arc::clone(&inner.session),
            &target.instance,
            &resource,
            LockMode::Exclusive,
            LockOwner::Session,
            inner.options.lock_timeout,
        )
        .await
        .map_err(|e| DeployError::Lock {
            target: name.clone(),
            source: e,
        })?;

        let result = Self::run_actions(&inner, target, &cancel).await;
        applock.release().await;

        match &result {
            Ok(executed) => {
                let _ = inner.events.append(
                    &name,
                    DeployEvent::TargetCompleted {
                        target: name.clone(),
                        actions_executed: *executed,
                        duration_seconds: started.elapsed().as_secs_f64(),
                    },
                );
                info!(target = %name, actions = executed, "target completed");
            }
            Err(error) => {
                let _ = inner.events.append(
                    &name,
                    DeployEvent::TargetFailed {
                        target: name.clone(),
                        error: error.to_string(),
                    },
                );
                warn!(target = %name, error = %error, "target failed");
            }
        }

        result.map(|actions_executed| TargetOutcome {
            target: name,
            actions_executed,
            duration: started.elapsed(),
        })
    }

    /// Run the action list strictly in order; the first failure aborts the
    /// remainder.
    async fn run_actions(
        inner: &Arc<Inner>,
        target: &PlanTarget,
        cancel: &CancellationToken,
    ) -> Result<usize, DeployError> {
        let ctx = ExecuteContext::new(Arc::clone(&inner.session));

        for (seq, action) in target.actions.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DeployError::Canceled);
            }
            let action_started = Instant::now();
            action
                .execute(&ctx, cancel)
                .await
                .map_err(|e| DeployError::Action {
                    target: target.name.clone(),
                    action: action.describe(),
                    source: e,
                })?;
            let _ = inner.events.append(
                &target.name,
                DeployEvent::ActionSucceeded {
                    target: target.name.clone(),
                    action: action.describe(),
                    seq,
                    duration_seconds: action_started.elapsed().as_secs_f64(),
                },
            );
        }

        Ok(target.actions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;
    use crate::core::parser::parse_manifest;
    use crate::sql::testing::{ExecutedCommand, RecordingSession};
    use crate::sql::CommandVerb;
    use std::collections::HashMap;
    use std::path::Path;

    fn plan_from(yaml: &str) -> Plan {
        let topology = parse_manifest(yaml).unwrap();
        compile(&topology, &HashMap::new(), Path::new("/srv")).unwrap()
    }

    fn two_target_plan() -> Plan {
        plan_from(
            r#"
version: "1.0"
name: pair
instances:
  primary:
    dsn: "postgres://primary"
targets:
  a:
    instance: primary
    database: db_a
    steps:
      - kind: create_database
  b:
    instance: primary
    database: db_b
    steps:
      - kind: create_database
      - kind: alter_database
        option: publish
        value: "true"
"#,
        )
    }

    fn commands_for<'a>(
        commands: &'a [ExecutedCommand],
        database: &str,
    ) -> Vec<&'a ExecutedCommand> {
        commands
            .iter()
            .filter(|c| c.params.iter().any(|(n, v)| *n == "database" && v == database))
            .collect()
    }

    #[tokio::test]
    async fn test_deploy_runs_actions_in_order() {
        let plan = plan_from(
            r#"
version: "1.0"
name: one
instances:
  primary:
    dsn: "postgres://primary"
targets:
  init:
    instance: primary
    database: ledger
    publication: ledger-pub
    steps:
      - kind: create_database
      - kind: publication
      - kind: article
        table: accounts
"#,
        );
        let session = Arc::new(RecordingSession::new());
        let executor = Executor::new(plan, session.clone(), ExecutorOptions::default());

        let summary = executor
            .deploy(&["init".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].actions_executed, 4);

        let verbs: Vec<CommandVerb> = session.commands().iter().map(|c| c.verb).collect();
        assert_eq!(
            verbs,
            vec![
                CommandVerb::CreateDatabase,
                CommandVerb::AlterDatabase,
                CommandVerb::CreatePublication,
                CommandVerb::AddArticle,
            ]
        );

        // The application lock was taken and released around the run.
        assert_eq!(session.acquires.lock().unwrap().len(), 1);
        assert_eq!(session.releases.lock().unwrap().len(), 1);
        assert_eq!(session.acquires.lock().unwrap()[0], "replicar/primary");
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_actions() {
        let plan = plan_from(
            r#"
version: "1.0"
name: abort
instances:
  primary:
    dsn: "postgres://primary"
targets:
  init:
    instance: primary
    database: ledger
    steps:
      - kind: create_database
      - kind: alter_database
        option: publish
        value: "true"
      - kind: alter_database
        option: trustworthy
        value: "false"
"#,
        );
        let session = Arc::new(RecordingSession::new().fail_at(1));
        let executor = Executor::new(plan, session.clone(), ExecutorOptions::default());

        let err = executor
            .deploy(&["init".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();

        // Second action failed, third never ran.
        assert_eq!(session.commands().len(), 2);
        match err {
            DeployError::Aggregate(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].target, "init");
                let message = failures[0].error.to_string();
                assert!(message.contains("init"));
                assert!(message.contains("alter_database"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The lock is still released on the failure path.
        assert_eq!(session.releases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sibling_target_failures_are_isolated() {
        let session = Arc::new(RecordingSession::new().fail_value("db_a"));
        let executor = Executor::new(two_target_plan(), session.clone(), ExecutorOptions::default());

        let err = executor
            .deploy(
                &["a".to_string(), "b".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            DeployError::Aggregate(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].target, "a");
            }
            other => panic!("unexpected error: {}", other),
        }

        // b executed both actions, in order, despite a failing.
        let commands = session.commands();
        let b_commands = commands_for(&commands, "db_b");
        assert_eq!(b_commands.len(), 2);
        assert_eq!(b_commands[0].verb, CommandVerb::CreateDatabase);
        assert_eq!(b_commands[1].verb, CommandVerb::AlterDatabase);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_run() {
        let session = Arc::new(RecordingSession::new().delay(Duration::from_millis(40)));
        let executor = Arc::new(Executor::new(
            two_target_plan(),
            session.clone(),
            ExecutorOptions::default(),
        ));

        let first = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .deploy(&["b".to_string()], &CancellationToken::new())
                    .await
            })
        };
        let second = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .deploy(&["b".to_string()], &CancellationToken::new())
                    .await
            })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first.is_ok() && second.is_ok());
        // Two actions for b, executed once despite two concurrent requests.
        assert_eq!(session.commands().len(), 2);
        assert_eq!(session.acquires.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_after_completion_is_fresh() {
        let session = Arc::new(RecordingSession::new());
        let executor = Executor::new(two_target_plan(), session.clone(), ExecutorOptions::default());

        executor
            .deploy(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        executor
            .deploy(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        // Re-run, not replay: the second request executed again.
        assert_eq!(commands_for(&session.commands(), "db_a").len(), 2);
    }

    #[tokio::test]
    async fn test_catchup_runs_dependency_first() {
        let plan = plan_from(
            r#"
version: "1.0"
name: chained
instances:
  primary:
    dsn: "postgres://primary"
targets:
  base:
    instance: primary
    database: db_base
    steps:
      - kind: create_database
  dependent:
    instance: primary
    database: db_dep
    depends_on: [base]
    steps:
      - kind: create_database
"#,
        );
        let session = Arc::new(RecordingSession::new());
        let executor = Executor::new(plan, session.clone(), ExecutorOptions::default());

        let summary = executor
            .deploy(&["dependent".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.outcomes.len(), 1);

        let commands = session.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].params[0].1, "db_base");
        assert_eq!(commands[1].params[0].1, "db_dep");
    }

    #[tokio::test]
    async fn test_catchup_failure_stops_dependent_target() {
        let plan = plan_from(
            r#"
version: "1.0"
name: chained
instances:
  primary:
    dsn: "postgres://primary"
targets:
  base:
    instance: primary
    database: db_base
    steps:
      - kind: create_database
  dependent:
    instance: primary
    database: db_dep
    depends_on: [base]
    steps:
      - kind: create_database
"#,
        );
        let session = Arc::new(RecordingSession::new().fail_value("db_base"));
        let executor = Executor::new(plan, session.clone(), ExecutorOptions::default());

        let err = executor
            .deploy(&["dependent".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DeployError::Aggregate(failures) => {
                assert_eq!(failures[0].target, "dependent");
                let message = failures[0].error.to_string();
                assert!(message.contains("dependency 'base'"));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The dependent target's own actions never ran.
        assert!(commands_for(&session.commands(), "db_dep").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_any_side_effect() {
        let session = Arc::new(RecordingSession::new());
        let executor = Executor::new(two_target_plan(), session.clone(), ExecutorOptions::default());

        let err = executor
            .deploy(
                &["a".to_string(), "ghost".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::UnknownTarget(name) if name == "ghost"));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_empty_request_runs_every_target() {
        let session = Arc::new(RecordingSession::new());
        let executor = Executor::new(two_target_plan(), session.clone(), ExecutorOptions::default());

        let summary = executor.deploy(&[], &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.outcomes.len(), 2);

        let commands = session.commands();
        // One action for a, two for b; the shared instance gate keeps each
        // target's actions contiguous.
        assert_eq!(commands.len(), 3);
        assert_eq!(commands_for(&commands, "db_a").len(), 1);
        assert_eq!(commands_for(&commands, "db_b").len(), 2);
    }

    #[tokio::test]
    async fn test_caller_cancellation_does_not_abort_shared_run() {
        let session = Arc::new(RecordingSession::new().delay(Duration::from_millis(60)));
        let executor = Arc::new(Executor::new(
            two_target_plan(),
            session.clone(),
            ExecutorOptions::default(),
        ));

        let token = CancellationToken::new();
        let canceled_caller = {
            let executor = Arc::clone(&executor);
            let token = token.clone();
            tokio::spawn(async move { executor.deploy(&["b".to_string()], &token).await })
        };
        let steady_caller = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .deploy(&["b".to_string()], &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let canceled = canceled_caller.await.unwrap().unwrap_err();
        match canceled {
            DeployError::Aggregate(failures) => {
                assert!(matches!(*failures[0].error, DeployError::Canceled));
            }
            other => panic!("unexpected error: {}", other),
        }

        let steady = steady_caller.await.unwrap().unwrap();
        assert_eq!(steady.outcomes[0].actions_executed, 2);
        // The run survived the first caller's cancellation and ran once.
        assert_eq!(session.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_dispose_cancels_outstanding_waiters() {
        let session = Arc::new(RecordingSession::new().delay(Duration::from_secs(5)));
        let executor = Arc::new(Executor::new(
            two_target_plan(),
            session,
            ExecutorOptions::default(),
        ));

        let waiter = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .deploy(&["a".to_string()], &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.dispose();

        let err = waiter.await.unwrap().unwrap_err();
        match err {
            DeployError::Aggregate(failures) => {
                assert!(matches!(*failures[0].error, DeployError::Disposed));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_failure_is_fatal_for_the_attempt() {
        let session = Arc::new(RecordingSession::new().acquire_status(-3));
        let executor = Executor::new(two_target_plan(), session.clone(), ExecutorOptions::default());

        let err = executor
            .deploy(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DeployError::Aggregate(failures) => {
                let message = failures[0].error.to_string();
                assert!(message.contains("deadlock"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_writes_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(RecordingSession::new());
        let options = ExecutorOptions {
            log_dir: Some(dir.path().to_path_buf()),
            ..ExecutorOptions::default()
        };
        let executor = Executor::new(two_target_plan(), session, options);

        executor
            .deploy(&["a".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        let target_log = std::fs::read_to_string(dir.path().join("a/events.jsonl")).unwrap();
        assert!(target_log.contains("target_started"));
        assert!(target_log.contains("action_succeeded"));
        assert!(target_log.contains("target_completed"));

        let deploy_log = std::fs::read_to_string(dir.path().join("deploy/events.jsonl")).unwrap();
        assert!(deploy_log.contains("deploy_started"));
        assert!(deploy_log.contains("deploy_completed"));
    }
}
