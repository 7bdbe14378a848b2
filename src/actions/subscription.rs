//! Subscription actions — connect a subscriber instance to a publication.

use crate::core::types::Instance;
use crate::sql::{CommandVerb, SqlCommand};

/// Register a subscription at the publisher, pointing at `subscriber`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSubscription {
    /// Publisher instance the command runs on
    pub instance: Instance,
    pub database: String,
    pub publication: String,
    pub subscriber: Instance,
    pub subscriber_database: String,
}

impl CreateSubscription {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::CreateSubscription)
            .param("database", &self.database)
            .param("publication", &self.publication)
            .param("subscriber", &self.subscriber.name)
            .param("subscriber_dsn", &self.subscriber.dsn)
            .param("subscriber_database", &self.subscriber_database)
    }

    pub fn describe(&self) -> String {
        format!(
            "create_subscription '{}' -> {}/'{}' @ {}",
            self.publication, self.subscriber, self.subscriber_database, self.instance
        )
    }
}

/// Remove a subscriber from a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropSubscription {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
    pub subscriber: String,
}

impl DropSubscription {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::DropSubscription)
            .param("database", &self.database)
            .param("publication", &self.publication)
            .param("subscriber", &self.subscriber)
    }

    pub fn describe(&self) -> String {
        format!(
            "drop_subscription '{}' for '{}' @ {}",
            self.subscriber, self.publication, self.instance
        )
    }
}
