//! Action variants — one remote operation per kind, bound to one instance.
//!
//! A closed set of operation kinds dispatched through a single `execute`
//! entry point. Each variant builds exactly one [`SqlCommand`]; the merge
//! variant is an explicit unsupported gap and always fails.

pub mod article;
pub mod database;
pub mod merge;
pub mod publication;
pub mod subscription;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::types::Instance;
use crate::error::ExecuteError;
use crate::sql::{SqlCommand, SqlSession};

pub use article::{AddArticle, DropArticle};
pub use database::{AlterDatabase, CreateDatabase};
pub use merge::ConfigureMerge;
pub use publication::{CreatePublication, DropPublication};
pub use subscription::{CreateSubscription, DropSubscription};

/// Environment an action executes in.
#[derive(Clone)]
pub struct ExecuteContext {
    pub session: Arc<dyn SqlSession>,
}

impl ExecuteContext {
    pub fn new(session: Arc<dyn SqlSession>) -> Self {
        Self { session }
    }
}

/// One remote operation against a single SQL instance.
///
/// Immutable once compiled; consumed exactly once during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDatabase(CreateDatabase),
    AlterDatabase(AlterDatabase),
    CreatePublication(CreatePublication),
    DropPublication(DropPublication),
    AddArticle(AddArticle),
    DropArticle(DropArticle),
    CreateSubscription(CreateSubscription),
    DropSubscription(DropSubscription),
    ConfigureMerge(ConfigureMerge),
}

impl Action {
    /// The instance this action binds to.
    pub fn instance(&self) -> &Instance {
        match self {
            Self::CreateDatabase(a) => &a.instance,
            Self::AlterDatabase(a) => &a.instance,
            Self::CreatePublication(a) => &a.instance,
            Self::DropPublication(a) => &a.instance,
            Self::AddArticle(a) => &a.instance,
            Self::DropArticle(a) => &a.instance,
            Self::CreateSubscription(a) => &a.instance,
            Self::DropSubscription(a) => &a.instance,
            Self::ConfigureMerge(a) => &a.instance,
        }
    }

    /// One-line description for plan output and failure messages.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateDatabase(a) => a.describe(),
            Self::AlterDatabase(a) => a.describe(),
            Self::CreatePublication(a) => a.describe(),
            Self::DropPublication(a) => a.describe(),
            Self::AddArticle(a) => a.describe(),
            Self::DropArticle(a) => a.describe(),
            Self::CreateSubscription(a) => a.describe(),
            Self::DropSubscription(a) => a.describe(),
            Self::ConfigureMerge(a) => a.describe(),
        }
    }

    /// Issue the remote operation, honoring cancellation at the await point.
    pub async fn execute(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        let command = match self {
            Self::CreateDatabase(a) => a.command(),
            Self::AlterDatabase(a) => a.command(),
            Self::CreatePublication(a) => a.command(),
            Self::DropPublication(a) => a.command(),
            Self::AddArticle(a) => a.command(),
            Self::DropArticle(a) => a.command(),
            Self::CreateSubscription(a) => a.command(),
            Self::DropSubscription(a) => a.command(),
            Self::ConfigureMerge(a) => return a.execute(),
        };

        self.issue(ctx, cancel, &command).await
    }

    async fn issue(
        &self,
        ctx: &ExecuteContext,
        cancel: &CancellationToken,
        command: &SqlCommand,
    ) -> Result<(), ExecuteError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecuteError::Canceled),
            res = ctx.session.execute(self.instance(), command) => {
                res.map_err(ExecuteError::from)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::testing::RecordingSession;
    use crate::sql::CommandVerb;

    fn instance() -> Instance {
        Instance::new("primary", "postgres://primary")
    }

    #[tokio::test]
    async fn test_execute_records_one_command() {
        let session = Arc::new(RecordingSession::new());
        let ctx = ExecuteContext::new(session.clone());
        let action = Action::CreateDatabase(CreateDatabase {
            instance: instance(),
            database: "ledger".to_string(),
        });

        action
            .execute(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        let commands = session.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].verb, CommandVerb::CreateDatabase);
        assert_eq!(commands[0].instance, "primary");
    }

    #[tokio::test]
    async fn test_execute_canceled_before_issuing() {
        let session = Arc::new(RecordingSession::new());
        let ctx = ExecuteContext::new(session.clone());
        let action = Action::CreateDatabase(CreateDatabase {
            instance: instance(),
            database: "ledger".to_string(),
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = action.execute(&ctx, &cancel).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Canceled));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_execute_merge_is_unsupported() {
        let session = Arc::new(RecordingSession::new());
        let ctx = ExecuteContext::new(session.clone());
        let action = Action::ConfigureMerge(ConfigureMerge {
            instance: instance(),
            database: "ledger".to_string(),
            publication: "ledger-pub".to_string(),
        });

        let err = action
            .execute(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Unsupported { .. }));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_execute_surfaces_sql_failure() {
        let session = Arc::new(RecordingSession::new().fail_at(0));
        let ctx = ExecuteContext::new(session);
        let action = Action::DropArticle(DropArticle {
            instance: instance(),
            database: "ledger".to_string(),
            publication: "ledger-pub".to_string(),
            article: "accounts".to_string(),
        });

        let err = action
            .execute(&ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Sql(_)));
    }
}
