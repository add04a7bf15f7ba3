use std::time::Duration;

use super::Allocation;
use crate::container::ContainerID;
use crate::introspection::{self, ContainerIntrospector};
use crate::netns::{self, Attacher};

/// How often, and how patiently, an allocation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-indexed): `attempt` back-off units, saturating at
    /// [`Duration::MAX`].
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .checked_mul(attempt)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Why a single attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("container not resolvable: {0}")]
    Introspection(#[from] introspection::Error),
    #[error("attachment failed: {0}")]
    Attach(#[from] netns::Error),
}

/// Final result of handling one [`Allocation`].
#[derive(Debug)]
pub enum Outcome {
    Attached {
        container_id: ContainerID,
        pid: u32,
        /// Number of attempts it took, including the successful one.
        attempts: u32,
    },
    Abandoned(AbandonReason),
}

#[derive(Debug)]
pub enum AbandonReason {
    RetriesExhausted {
        attempts: u32,
        last_error: Option<AttemptError>,
    },
    /// The attachment left its execution context in an unknown namespace.
    Fatal(netns::Error),
}

/// Resolves the container that received `allocation` and attaches the interface to it.
///
/// Attempt `n` is preceded by a sleep of [`RetryPolicy::delay_before`]`(n)`; the loop stops on
/// the first success, on a fatal attachment error, or once the attempts are used up.
pub async fn resolve_and_attach<I, A>(
    allocation: &Allocation,
    introspector: &I,
    attacher: &A,
    policy: &RetryPolicy,
) -> Outcome
where
    I: ContainerIntrospector,
    A: Attacher,
{
    let mut last_error = None;
    for attempt in 0..policy.attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match try_attach(allocation, introspector, attacher).await {
            Ok((container_id, pid)) => {
                return Outcome::Attached {
                    container_id,
                    pid,
                    attempts: attempt + 1,
                };
            }
            Err(AttemptError::Attach(err)) if err.is_fatal() => {
                return Outcome::Abandoned(AbandonReason::Fatal(err));
            }
            Err(err) => {
                log::debug!(
                    "Attempt {}/{} for device `{}` failed: {}",
                    attempt + 1,
                    policy.attempts,
                    allocation.device_id,
                    err
                );
                last_error = Some(err);
            }
        }
    }

    Outcome::Abandoned(AbandonReason::RetriesExhausted {
        attempts: policy.attempts,
        last_error,
    })
}

async fn try_attach<I, A>(
    allocation: &Allocation,
    introspector: &I,
    attacher: &A,
) -> Result<(ContainerID, u32), AttemptError>
where
    I: ContainerIntrospector,
    A: Attacher,
{
    let container_id = introspector
        .container_id_by_device(&allocation.container_path)
        .await?;
    let pid = introspector.pid_by_container_id(&container_id).await?;
    log::trace!(
        "Device `{}` belongs to container `{}` (pid {})",
        allocation.device_id,
        container_id,
        pid
    );
    attacher.attach(pid).await?;

    Ok((container_id, pid))
}
