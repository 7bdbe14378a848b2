//! Article actions — add and drop a published article.

use crate::core::types::Instance;
use crate::sql::{CommandVerb, SqlCommand};

/// Register a table as an article of a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddArticle {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
    pub article: String,
    pub table: String,
    /// Optional row filter clause applied at the publisher.
    pub filter: Option<String>,
}

impl AddArticle {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::AddArticle)
            .param("database", &self.database)
            .param("publication", &self.publication)
            .param("article", &self.article)
            .param("table", &self.table)
            .param("filter", self.filter.clone().unwrap_or_default())
    }

    pub fn describe(&self) -> String {
        format!(
            "add_article '{}' ({}) to '{}' on '{}' @ {}",
            self.article, self.table, self.publication, self.database, self.instance
        )
    }
}

/// Remove an article from a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropArticle {
    pub instance: Instance,
    pub database: String,
    pub publication: String,
    pub article: String,
}

impl DropArticle {
    pub fn command(&self) -> SqlCommand {
        SqlCommand::new(CommandVerb::DropArticle)
            .param("database", &self.database)
            .param("publication", &self.publication)
            .param("article", &self.article)
    }

    pub fn describe(&self) -> String {
        format!(
            "drop_article '{}' from '{}' on '{}' @ {}",
            self.article, self.publication, self.database, self.instance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_article_command() {
        let a = AddArticle {
            instance: Instance::new("primary", "postgres://primary"),
            database: "ledger".to_string(),
            publication: "ledger-pub".to_string(),
            article: "accounts".to_string(),
            table: "public.accounts".to_string(),
            filter: Some("region = 'eu'".to_string()),
        };
        let cmd = a.command();
        assert_eq!(cmd.verb, CommandVerb::AddArticle);
        assert_eq!(cmd.get("table"), Some("public.accounts"));
        assert_eq!(cmd.get("filter"), Some("region = 'eu'"));
    }

    #[test]
    fn test_drop_article_command() {
        let a = DropArticle {
            instance: Instance::new("primary", "postgres://primary"),
            database: "ledger".to_string(),
            publication: "ledger-pub".to_string(),
            article: "accounts".to_string(),
        };
        let cmd = a.command();
        assert_eq!(cmd.verb, CommandVerb::DropArticle);
        assert_eq!(cmd.get("article"), Some("accounts"));
        assert!(a.describe().contains("'accounts'"));
    }
}
