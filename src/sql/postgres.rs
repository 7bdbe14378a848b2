//! Production session over Postgres.
//!
//! Commands map onto server-installed `replicar_*` procedures with bound
//! parameters; no statement text is assembled from manifest values. The
//! advisory-lock RPC pair is synthesized from session advisory locks: a
//! deadline-bounded `pg_try_advisory_lock` poll yields the status codes the
//! contract promises (0 immediate, 1 after wait, -1 timeout, -3 deadlock).
//! Each held lock pins its pool connection until released, since session
//! advisory locks belong to the connection that took them.

use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::time::Instant;
use tracing::debug;

use super::{AppLockRequest, LockMode, LockOwner, SqlCommand, SqlError, SqlSession};
use crate::core::types::Instance;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_CONNECTIONS: u32 = 4;

/// Lazily connected session; one pool per instance, created on first use.
#[derive(Default)]
pub struct PgSession {
    pools: StdMutex<FxHashMap<String, PgPool>>,
    held: StdMutex<FxHashMap<(String, i64), HeldLock>>,
}

/// A granted advisory lock and the connection that owns it.
struct HeldLock {
    conn: PoolConnection<Postgres>,
    mode: LockMode,
}

impl PgSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, instance: &Instance) -> Result<PgPool, SqlError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&instance.name) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_lazy(&instance.dsn)
            .map_err(|e| SqlError::Connect {
                instance: instance.name.clone(),
                message: e.to_string(),
            })?;
        pools.insert(instance.name.clone(), pool.clone());
        Ok(pool)
    }

    fn take_held(&self, instance: &Instance, key: i64) -> Option<HeldLock> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(instance.name.clone(), key))
    }
}

/// Derive the 64-bit advisory lock key for a resource name.
pub fn applock_key(resource: &str) -> i64 {
    let hash = blake3::hash(resource.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    i64::from_le_bytes(bytes)
}

/// Render the procedure call for a command: `CALL replicar_x($1, .., $n)`.
pub fn procedure_call(command: &SqlCommand) -> String {
    let placeholders = (1..=command.params.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CALL {}({})", command.verb.procedure(), placeholders)
}

fn try_lock_sql(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Exclusive => "SELECT pg_try_advisory_lock($1)",
        LockMode::Shared => "SELECT pg_try_advisory_lock_shared($1)",
    }
}

fn unlock_sql(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Exclusive => "SELECT pg_advisory_unlock($1)",
        LockMode::Shared => "SELECT pg_advisory_unlock_shared($1)",
    }
}

fn is_deadlock(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("40P01"))
}

#[async_trait]
impl SqlSession for PgSession {
    async fn execute(&self, instance: &Instance, command: &SqlCommand) -> Result<(), SqlError> {
        let pool = self.pool(instance)?;
        let sql = procedure_call(command);
        debug!(instance = %instance, verb = %command.verb, "issuing remote operation");

        let mut query = sqlx::query(&sql);
        for (_, value) in &command.params {
            query = query.bind(value);
        }
        query
            .execute(&pool)
            .await
            .map_err(|e| SqlError::Execute {
                instance: instance.name.clone(),
                verb: command.verb,
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn acquire_applock(
        &self,
        instance: &Instance,
        request: &AppLockRequest,
    ) -> Result<i32, SqlError> {
        let pool = self.pool(instance)?;
        let key = applock_key(&request.resource);
        let mut conn = pool.acquire().await.map_err(|e| SqlError::Connect {
            instance: instance.name.clone(),
            message: e.to_string(),
        })?;

        let deadline = Instant::now() + request.timeout;
        let mut waited = false;
        loop {
            let granted: Result<bool, sqlx::Error> = sqlx::query_scalar(try_lock_sql(request.mode))
                .bind(key)
                .fetch_one(&mut *conn)
                .await;
            match granted {
                Ok(true) => {
                    // The lock belongs to this connection; pin it until release.
                    self.held
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(
                            (instance.name.clone(), key),
                            HeldLock {
                                conn,
                                mode: request.mode,
                            },
                        );
                    return Ok(if waited { 1 } else { 0 });
                }
                Ok(false) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(-1);
                    }
                    waited = true;
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(e) if is_deadlock(&e) => return Ok(-3),
                Err(e) => {
                    return Err(SqlError::Lock {
                        instance: instance.name.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn release_applock(
        &self,
        instance: &Instance,
        resource: &str,
        _owner: LockOwner,
    ) -> Result<i32, SqlError> {
        let key = applock_key(resource);
        let Some(mut held) = self.take_held(instance, key) else {
            // Not held by this session; nothing to unlock.
            return Ok(-999);
        };
        let released: bool = sqlx::query_scalar(unlock_sql(held.mode))
            .bind(key)
            .fetch_one(&mut *held.conn)
            .await
            .map_err(|e| SqlError::Lock {
                instance: instance.name.clone(),
                message: e.to_string(),
            })?;
        Ok(if released { 0 } else { -999 })
    }
}
