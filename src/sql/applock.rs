//! Scoped advisory application locks.
//!
//! The server enforces the exclusion; this is the client half. Status codes
//! follow the advisory-lock contract: `0` granted immediately, `1` granted
//! after waiting, negative values fail fast and are never retried here.
//! A failed release is logged, not rethrown — the lock-owner session
//! teardown clears it server-side.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{AppLockRequest, LockMode, LockOwner, SqlSession};
use crate::core::types::Instance;
use crate::error::LockError;

/// Ownership of one server-side application lock.
///
/// Release explicitly with [`release`](AppLock::release); if the handle is
/// dropped while still held, a best-effort release is spawned instead.
pub struct AppLock {
    session: Arc<dyn SqlSession>,
    instance: Instance,
    resource: String,
    owner: LockOwner,
    released: bool,
}

impl AppLock {
    /// Acquire `resource` on `instance`, waiting at most `timeout`.
    pub async fn acquire(
        session: Arc<dyn SqlSession>,
        instance: &Instance,
        resource: &str,
        mode: LockMode,
        owner: LockOwner,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let request = AppLockRequest {
            resource: resource.to_string(),
            mode,
            owner,
            timeout,
        };
        let status = session
            .acquire_applock(instance, &request)
            .await
            .map_err(LockError::Rpc)?;

        match status {
            0 => {}
            1 => warn!(resource, instance = %instance, "application lock granted after waiting"),
            -1 => {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    timeout,
                })
            }
            -2 => {
                return Err(LockError::Canceled {
                    resource: resource.to_string(),
                })
            }
            -3 => {
                return Err(LockError::Deadlock {
                    resource: resource.to_string(),
                })
            }
            other => {
                return Err(LockError::Protocol {
                    resource: resource.to_string(),
                    status: other,
                })
            }
        }

        Ok(Self {
            session,
            instance: instance.clone(),
            resource: resource.to_string(),
            owner,
            released: false,
        })
    }

    /// Release the lock. The normal exit path; never fails the caller.
    pub async fn release(mut self) {
        self.released = true;
        release_quietly(&self.session, &self.instance, &self.resource, self.owner).await;
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Abnormal exit: release from a spawned task since drop cannot await.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(&self.session);
            let instance = self.instance.clone();
            let resource = std::mem::take(&mut self.resource);
            let owner = self.owner;
            handle.spawn(async move {
                release_quietly(&session, &instance, &resource, owner).await;
            });
        } else {
            warn!(
                resource = %self.resource,
                "application lock dropped outside a runtime; relying on session teardown"
            );
        }
    }
}

async fn release_quietly(
    session: &Arc<dyn SqlSession>,
    instance: &Instance,
    resource: &str,
    owner: LockOwner,
) {
    match session.release_applock(instance, resource, owner).await {
        Ok(status) if status >= 0 => {}
        Ok(status) => warn!(
            resource,
            instance = %instance,
            status,
            "application lock release returned failure status"
        ),
        Err(e) => warn!(
            resource,
            instance = %instance,
            error = %e,
            "application lock release failed"
        ),
    }
}
