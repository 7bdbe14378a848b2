//! Plan compilation — compile contexts, step expansion, duplicate detection.
//!
//! Walks targets in declaration order and compiles each step into one or
//! more actions, preserving step order and within-step action order. All
//! manifest expressions are expanded here; compilation never touches the
//! network, so every compile error is reported before any remote side
//! effect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::expand::{self, Expression};
use super::types::*;
use crate::actions::{
    Action, AddArticle, AlterDatabase, ConfigureMerge, CreateDatabase, CreatePublication,
    CreateSubscription, DropArticle, DropPublication, DropSubscription,
};
use crate::error::CompileError;

/// Immutable compilation environment for one target.
pub struct CompileContext {
    /// Merged argument map: manifest defaults under command-line overrides,
    /// plus per-target convenience keys (target, instance, database,
    /// publication). Never null; defaults to empty.
    pub args: HashMap<String, String>,

    /// Instance the compiled actions bind to
    pub instance: Instance,

    /// Directory relative manifest resources resolve against
    pub base_path: PathBuf,
}

impl CompileContext {
    pub fn new(args: HashMap<String, String>, instance: Instance, base_path: PathBuf) -> Self {
        Self {
            args,
            instance,
            base_path,
        }
    }

    /// Expand an expression, rejecting unresolved placeholders.
    pub fn expand(&self, expr: &Expression, element: &str) -> Result<String, CompileError> {
        expand::expand_checked(expr.raw(), &self.args, element)
    }

    /// Expand an optional expression, falling back to `default`.
    pub fn expand_or(
        &self,
        expr: Option<&Expression>,
        default: &str,
        element: &str,
    ) -> Result<String, CompileError> {
        match expr {
            Some(e) => self.expand(e, element),
            None => Ok(default.to_string()),
        }
    }

    /// Resolve a possibly-relative path against the manifest directory.
    pub fn resolve_path(&self, value: &str) -> String {
        let path = Path::new(value);
        if path.is_absolute() {
            value.to_string()
        } else {
            self.base_path.join(path).display().to_string()
        }
    }
}

/// Compile one topology into a plan.
pub fn compile(
    topology: &Topology,
    overrides: &HashMap<String, String>,
    base_path: &Path,
) -> Result<Plan, CompileError> {
    compile_all(std::slice::from_ref(topology), overrides, base_path)
}

/// Compile several topology documents into one plan.
///
/// Target names must be unique across all documents; plan order is document
/// order, then declaration order within a document.
pub fn compile_all(
    topologies: &[Topology],
    overrides: &HashMap<String, String>,
    base_path: &Path,
) -> Result<Plan, CompileError> {
    let name = topologies
        .first()
        .map(|t| t.name.clone())
        .unwrap_or_default();
    let mut targets: IndexMap<String, PlanTarget> = IndexMap::new();

    for topology in topologies {
        let mut args = topology.args.clone();
        args.extend(overrides.clone());

        for (target_name, target) in &topology.targets {
            if targets.contains_key(target_name) {
                return Err(CompileError::DuplicateTarget(target_name.clone()));
            }
            let compiled = compile_target(topology, target_name, target, &args, base_path)?;
            targets.insert(target_name.clone(), compiled);
        }
    }

    Ok(Plan {
        name,
        fingerprint: fingerprint(topologies)?,
        targets,
    })
}

fn compile_target(
    topology: &Topology,
    name: &str,
    target: &Target,
    args: &HashMap<String, String>,
    base_path: &Path,
) -> Result<PlanTarget, CompileError> {
    let spec = topology.instances.get(&target.instance).ok_or_else(|| {
        CompileError::Manifest(format!(
            "target '{}' references unknown instance '{}'",
            name, target.instance
        ))
    })?;

    let element = format!("target '{}'", name);
    let mut ctx_args = args.clone();
    ctx_args.insert("target".to_string(), name.to_string());
    ctx_args.insert("instance".to_string(), target.instance.clone());

    let dsn = expand::expand_checked(
        spec.dsn.raw(),
        &ctx_args,
        &format!("instance '{}'", target.instance),
    )?;
    let instance = Instance::new(target.instance.clone(), dsn);

    let database = match &target.database {
        Some(e) => expand::expand_checked(e.raw(), &ctx_args, &element)?,
        None => String::new(),
    };
    let publication = match &target.publication {
        Some(e) => expand::expand_checked(e.raw(), &ctx_args, &element)?,
        None => String::new(),
    };
    if !database.is_empty() {
        ctx_args.insert("database".to_string(), database.clone());
    }
    if !publication.is_empty() {
        ctx_args.insert("publication".to_string(), publication.clone());
    }

    let ctx = CompileContext::new(ctx_args, instance.clone(), base_path.to_path_buf());

    let mut actions = Vec::new();
    for step in &target.steps {
        actions.extend(step.compile(name, &database, &publication, &ctx, &topology.instances)?);
    }

    Ok(PlanTarget {
        name: name.to_string(),
        instance,
        depends_on: target.depends_on.clone(),
        actions,
    })
}

impl Step {
    /// Compile one step into its actions. Producers decide count and order.
    pub fn compile(
        &self,
        target_name: &str,
        database: &str,
        publication: &str,
        ctx: &CompileContext,
        instances: &IndexMap<String, InstanceSpec>,
    ) -> Result<Vec<Action>, CompileError> {
        let element = format!("target '{}' step '{}'", target_name, self.kind_name());
        let instance = ctx.instance.clone();

        match self {
            Self::CreateDatabase { database: step_db } => {
                let database = ctx.expand_or(step_db.as_ref(), database, &element)?;
                Ok(vec![Action::CreateDatabase(CreateDatabase {
                    instance,
                    database,
                })])
            }

            Self::AlterDatabase { option, value } => Ok(vec![Action::AlterDatabase(
                AlterDatabase {
                    instance,
                    database: database.to_string(),
                    option: ctx.expand(option, &element)?,
                    value: ctx.expand(value, &element)?,
                },
            )]),

            Self::Publication {
                publication: step_pub,
                replication,
                snapshot_dir,
            } => {
                let publication = ctx.expand_or(step_pub.as_ref(), publication, &element)?;
                let kind = match replication {
                    Some(e) => {
                        let value = ctx.expand(e, &element)?;
                        match value.parse::<PublicationKind>() {
                            Ok(kind) => kind,
                            Err(()) => {
                                return Err(CompileError::Format {
                                    value,
                                    expected: "publication kind",
                                    element,
                                })
                            }
                        }
                    }
                    None => PublicationKind::Transactional,
                };
                let snapshot_dir = match snapshot_dir {
                    Some(e) => Some(ctx.resolve_path(&ctx.expand(e, &element)?)),
                    None => None,
                };

                // Publishing must be switched on before the publication is
                // registered, so this step compiles to two actions.
                Ok(vec![
                    Action::AlterDatabase(AlterDatabase {
                        instance: instance.clone(),
                        database: database.to_string(),
                        option: "publish".to_string(),
                        value: "true".to_string(),
                    }),
                    Action::CreatePublication(CreatePublication {
                        instance,
                        database: database.to_string(),
                        publication,
                        kind,
                        snapshot_dir,
                    }),
                ])
            }

            Self::DropPublication {
                publication: step_pub,
            } => {
                let publication = ctx.expand_or(step_pub.as_ref(), publication, &element)?;
                Ok(vec![Action::DropPublication(DropPublication {
                    instance,
                    database: database.to_string(),
                    publication,
                })])
            }

            Self::Article {
                table,
                name,
                filter,
            } => {
                let table = ctx.expand(table, &element)?;
                let article = match name {
                    Some(e) => ctx.expand(e, &element)?,
                    // Default article name: the table without its schema.
                    None => table.rsplit('.').next().unwrap_or(&table).to_string(),
                };
                let filter = match filter {
                    Some(e) => Some(ctx.expand(e, &element)?),
                    None => None,
                };
                Ok(vec![Action::AddArticle(AddArticle {
                    instance,
                    database: database.to_string(),
                    publication: publication.to_string(),
                    article,
                    table,
                    filter,
                })])
            }

            Self::DropArticle { name } => Ok(vec![Action::DropArticle(DropArticle {
                instance,
                database: database.to_string(),
                publication: publication.to_string(),
                article: ctx.expand(name, &element)?,
            })]),

            Self::Subscription {
                subscriber,
                database: sub_db,
            } => {
                let spec = instances.get(subscriber).ok_or_else(|| {
                    CompileError::Manifest(format!(
                        "{} references unknown subscriber instance '{}'",
                        element, subscriber
                    ))
                })?;
                let subscriber_dsn = expand::expand_checked(
                    spec.dsn.raw(),
                    &ctx.args,
                    &format!("instance '{}'", subscriber),
                )?;
                let subscriber_database = ctx.expand_or(sub_db.as_ref(), database, &element)?;
                Ok(vec![Action::CreateSubscription(CreateSubscription {
                    instance,
                    database: database.to_string(),
                    publication: publication.to_string(),
                    subscriber: Instance::new(subscriber.clone(), subscriber_dsn),
                    subscriber_database,
                })])
            }

            Self::DropSubscription { subscriber } => {
                Ok(vec![Action::DropSubscription(DropSubscription {
                    instance,
                    database: database.to_string(),
                    publication: publication.to_string(),
                    subscriber: subscriber.clone(),
                })])
            }

            Self::Merge {} => Ok(vec![Action::ConfigureMerge(ConfigureMerge {
                instance,
                database: database.to_string(),
                publication: publication.to_string(),
            })]),
        }
    }
}

fn fingerprint(topologies: &[Topology]) -> Result<String, CompileError> {
    let mut hasher = blake3::Hasher::new();
    for topology in topologies {
        let serialized = serde_yaml_ng::to_string(topology)
            .map_err(|e| CompileError::Manifest(e.to_string()))?;
        hasher.update(serialized.as_bytes());
        hasher.update(b"\0");
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_manifest;

    fn manifest() -> Topology {
        parse_manifest(
            r#"
version: "1.0"
name: accounting
args:
  env: dev
instances:
  primary:
    dsn: "postgres://deploy@pub.internal/[env]"
  replica-eu:
    dsn: "postgres://deploy@eu.internal/[env]"
targets:
  publisher-init:
    instance: primary
    database: "ledger_[env]"
    publication: ledger-pub
    steps:
      - kind: create_database
      - kind: publication
        snapshot_dir: snapshots
      - kind: article
        table: public.accounts
        filter: "tenant = '[env]'"
      - kind: subscription
        subscriber: replica-eu
  cleanup:
    instance: primary
    database: "ledger_[env]"
    publication: ledger-pub
    depends_on: [publisher-init]
    steps:
      - kind: drop_subscription
        subscriber: replica-eu
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_orders_targets_and_actions() {
        let plan = compile(&manifest(), &HashMap::new(), Path::new("/srv/manifests")).unwrap();
        assert_eq!(plan.name, "accounting");
        assert_eq!(plan.target_names(), vec!["publisher-init", "cleanup"]);

        let target = plan.get("publisher-init").unwrap();
        // publication step expands to alter + create, so 5 actions total.
        assert_eq!(target.actions.len(), 5);
        assert!(matches!(target.actions[0], Action::CreateDatabase(_)));
        assert!(matches!(target.actions[1], Action::AlterDatabase(_)));
        assert!(matches!(target.actions[2], Action::CreatePublication(_)));
        assert!(matches!(target.actions[3], Action::AddArticle(_)));
        assert!(matches!(target.actions[4], Action::CreateSubscription(_)));
    }

    #[test]
    fn test_compile_expands_arguments() {
        let mut overrides = HashMap::new();
        overrides.insert("env".to_string(), "prod".to_string());
        let plan = compile(&manifest(), &overrides, Path::new("/srv/manifests")).unwrap();

        let target = plan.get("publisher-init").unwrap();
        assert_eq!(target.instance.dsn, "postgres://deploy@pub.internal/prod");
        match &target.actions[0] {
            Action::CreateDatabase(a) => assert_eq!(a.database, "ledger_prod"),
            other => panic!("unexpected action: {:?}", other),
        }
        match &target.actions[3] {
            Action::AddArticle(a) => {
                assert_eq!(a.filter.as_deref(), Some("tenant = 'prod'"));
                assert_eq!(a.article, "accounts");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_compile_resolves_snapshot_dir_against_base_path() {
        let plan = compile(&manifest(), &HashMap::new(), Path::new("/srv/manifests")).unwrap();
        match &plan.get("publisher-init").unwrap().actions[2] {
            Action::CreatePublication(a) => {
                assert_eq!(a.snapshot_dir.as_deref(), Some("/srv/manifests/snapshots"));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_compile_subscription_carries_subscriber_dsn() {
        let plan = compile(&manifest(), &HashMap::new(), Path::new("/srv")).unwrap();
        match &plan.get("publisher-init").unwrap().actions[4] {
            Action::CreateSubscription(a) => {
                assert_eq!(a.subscriber.name, "replica-eu");
                assert_eq!(a.subscriber.dsn, "postgres://deploy@eu.internal/dev");
                assert_eq!(a.subscriber_database, "ledger_dev");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_compile_undefined_variable_names_element() {
        let mut topology = manifest();
        topology.args.clear();
        let err = compile(&topology, &HashMap::new(), Path::new("/srv")).unwrap_err();
        match err {
            CompileError::UndefinedVariable { variable, element } => {
                assert_eq!(variable, "env");
                assert!(element.contains("instance 'primary'") || element.contains("target"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_compile_duplicate_target_across_documents() {
        let a = manifest();
        let b = manifest();
        let err = compile_all(&[a, b], &HashMap::new(), Path::new("/srv")).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateTarget(name) if name == "publisher-init"));
    }

    #[test]
    fn test_compile_bad_publication_kind_is_format_error() {
        let topology = parse_manifest(
            r#"
version: "1.0"
name: t
instances:
  i:
    dsn: "postgres://i"
targets:
  init:
    instance: i
    database: db
    publication: p
    steps:
      - kind: publication
        replication: sideways
"#,
        )
        .unwrap();
        let err = compile(&topology, &HashMap::new(), Path::new("/")).unwrap_err();
        match err {
            CompileError::Format { value, expected, .. } => {
                assert_eq!(value, "sideways");
                assert_eq!(expected, "publication kind");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_compile_merge_step() {
        let topology = parse_manifest(
            r#"
version: "1.0"
name: t
instances:
  i:
    dsn: "postgres://i"
targets:
  m:
    instance: i
    database: db
    publication: p
    steps:
      - kind: merge
"#,
        )
        .unwrap();
        let plan = compile(&topology, &HashMap::new(), Path::new("/")).unwrap();
        assert!(matches!(
            plan.get("m").unwrap().actions[0],
            Action::ConfigureMerge(_)
        ));
    }

    #[test]
    fn test_fingerprint_stable() {
        let plan1 = compile(&manifest(), &HashMap::new(), Path::new("/")).unwrap();
        let plan2 = compile(&manifest(), &HashMap::new(), Path::new("/")).unwrap();
        assert_eq!(plan1.fingerprint, plan2.fingerprint);
        assert!(plan1.fingerprint.starts_with("blake3:"));
    }
}
