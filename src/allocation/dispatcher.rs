use tokio::sync::{mpsc, watch};

use super::retry::{AbandonReason, Outcome, RetryPolicy, resolve_and_attach};
use super::{Allocation, Receiver};
use crate::error::{Error, ResultOkLogExt};
use crate::introspection::ContainerIntrospector;
use crate::netns::Attacher;

/// Outcome of one allocation, as published to the report sink.
#[derive(Debug)]
pub struct Report {
    pub allocation: Allocation,
    pub outcome: Outcome,
}

/// Single consumer of the allocation queue.
///
/// Allocations are handled one at a time in queue order: the next one is only dequeued once
/// the previous one was attached or abandoned. As a side effect no two attachments ever
/// switch namespaces concurrently.
pub struct Dispatcher<I, A> {
    rx: Receiver,
    introspector: I,
    attacher: A,
    policy: RetryPolicy,
    reports: Option<mpsc::UnboundedSender<Report>>,
}

impl<I, A> Dispatcher<I, A>
where
    I: ContainerIntrospector,
    A: Attacher,
{
    pub fn new(rx: Receiver, introspector: I, attacher: A, policy: RetryPolicy) -> Self {
        Self {
            rx,
            introspector,
            attacher,
            policy,
            reports: None,
        }
    }

    /// Publishes the outcome of every non-fatal allocation to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<Report>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Processes allocations until the queue is closed or `shutdown` fires.
    ///
    /// An allocation in flight when `shutdown` fires is abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalAttachment`] if an attachment could not restore its namespace;
    /// the dispatcher stops processing in that case.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        log::info!("Allocation dispatcher started");
        loop {
            let allocation = tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("Allocation dispatcher shutting down");
                    return Ok(());
                }
                allocation = self.rx.recv() => match allocation {
                    Some(allocation) => allocation,
                    None => {
                        log::info!("Allocation queue closed, dispatcher exiting");
                        return Ok(());
                    }
                },
            };
            log::debug!("New allocation request: {:?}", allocation);

            let outcome = tokio::select! {
                _ = shutdown.changed() => {
                    log::warn!(
                        "Shutting down, abandoning in-flight allocation of device `{}`",
                        allocation.device_id
                    );
                    return Ok(());
                }
                outcome = resolve_and_attach(
                    &allocation,
                    &self.introspector,
                    &self.attacher,
                    &self.policy,
                ) => outcome,
            };

            log_outcome(&allocation, &outcome);
            match outcome {
                Outcome::Abandoned(AbandonReason::Fatal(source)) => {
                    return Err(Error::FatalAttachment {
                        device_id: allocation.device_id,
                        source,
                    });
                }
                outcome => {
                    if let Some(reports) = &self.reports {
                        reports
                            .send(Report {
                                allocation,
                                outcome,
                            })
                            .ok_log();
                    }
                }
            }
        }
    }
}

/// Tally of allocation outcomes over the lifetime of the plugin.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub attached: usize,
    pub abandoned: usize,
}

impl Summary {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Attached { .. } => self.attached += 1,
            Outcome::Abandoned(_) => self.abandoned += 1,
        }
    }
}

/// Consumes `reports` until every sender is gone and returns the tally.
pub async fn summarize(mut reports: mpsc::UnboundedReceiver<Report>) -> Summary {
    let mut summary = Summary::default();
    while let Some(report) = reports.recv().await {
        summary.record(&report.outcome);
    }
    summary
}

fn log_outcome(allocation: &Allocation, outcome: &Outcome) {
    match outcome {
        Outcome::Attached {
            container_id,
            pid,
            attempts,
        } => log::info!(
            "Attached vcan interface for device `{}` to container `{}` (pid {}) after {} attempt(s)",
            allocation.device_id,
            container_id,
            pid,
            attempts
        ),
        Outcome::Abandoned(AbandonReason::RetriesExhausted {
            attempts,
            last_error,
        }) => match last_error {
            Some(err) => log::warn!(
                "Abandoning device `{}` after {} attempts, last error: {}",
                allocation.device_id,
                attempts,
                err
            ),
            None => log::warn!(
                "Abandoning device `{}` after {} attempts",
                allocation.device_id,
                attempts
            ),
        },
        Outcome::Abandoned(AbandonReason::Fatal(err)) => log::error!(
            "Fatal error while attaching device `{}`: {}",
            allocation.device_id,
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::{FakeAttacher, FakeIntrospector, allocation};
    use super::*;
    use crate::netns;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_processes_allocations_in_order() {
        let first = allocation("vcan-first");
        let second = allocation("vcan-second");
        // The first container never shows up, the second one immediately.
        let introspector = FakeIntrospector::default().with_container(&second.container_path, 0);
        let attacher = FakeAttacher::default();
        let (tx, rx) = super::super::channel();
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(rx, introspector.clone(), attacher.clone(), quick_policy())
            .with_reports(reports_tx);
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(first.clone()).await.unwrap();
        tx.send(second.clone()).await.unwrap();
        drop(tx);
        handle.await.unwrap().expect("dispatcher should exit cleanly");

        assert_eq!(
            introspector.lookup_paths(),
            vec![
                first.container_path.clone(),
                first.container_path.clone(),
                first.container_path.clone(),
                second.container_path.clone(),
            ]
        );

        let report = reports_rx.recv().await.unwrap();
        assert_eq!(report.allocation, first);
        assert!(matches!(
            report.outcome,
            Outcome::Abandoned(AbandonReason::RetriesExhausted { attempts: 3, .. })
        ));
        let report = reports_rx.recv().await.unwrap();
        assert_eq!(report.allocation, second);
        assert!(matches!(report.outcome, Outcome::Attached { attempts: 1, .. }));
        assert!(reports_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarize_counts_outcomes() {
        let attached = allocation("vcan-attached");
        let introspector = FakeIntrospector::default().with_container(&attached.container_path, 1);
        let (tx, rx) = super::super::channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(rx, introspector, FakeAttacher::default(), quick_policy())
            .with_reports(reports_tx);
        let summary = tokio::spawn(summarize(reports_rx));
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        tx.send(allocation("vcan-missing")).await.unwrap();
        tx.send(attached).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(
            summary.await.unwrap(),
            Summary {
                attached: 1,
                abandoned: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_stops_on_fatal_attachment() {
        let first = allocation("vcan-first");
        let second = allocation("vcan-second");
        let introspector = FakeIntrospector::default()
            .with_container(&first.container_path, 0)
            .with_container(&second.container_path, 0);
        let attacher = FakeAttacher::default().then(Err(netns::Error::RestoreNamespace {
            source: Box::new(netns::Error::EnterNamespace(nix::Error::EINVAL)),
        }));
        let (tx, rx) = super::super::channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            Dispatcher::new(rx, introspector.clone(), attacher.clone(), quick_policy())
                .run(shutdown_rx),
        );
        tx.send(first).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::FatalAttachment { ref device_id, .. } if device_id == "vcan-first"
        ));
        assert_eq!(attacher.call_count(), 1);
        // The queue's consumer is gone, so nothing else is processed.
        assert!(tx.send(second).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_shutdown_abandons_in_flight_allocation() {
        let introspector = FakeIntrospector::default();
        let (tx, rx) = super::super::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            Dispatcher::new(
                rx,
                introspector.clone(),
                FakeAttacher::default(),
                RetryPolicy::default(),
            )
            .run(shutdown_rx),
        );
        tx.send(allocation("vcan-a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown_tx.send(true).unwrap();

        handle.await.unwrap().expect("shutdown is not an error");
        let lookups = introspector.lookup_paths().len();
        assert!(lookups > 0 && lookups < 60, "lookups: {lookups}");
    }
}
