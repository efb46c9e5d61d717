//! The receive → forward → delete loop.
//!
//! Each cycle receives one batch from the source, forwards it to the
//! destination and deletes it from the source only when every message of the
//! batch was forwarded. Delivery is at-least-once: a message can end up in
//! both queues, but a message is never deleted before it was forwarded.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mapper;
use crate::queue::{
    BatchFailure, BatchOutcome, Message, MessageId, QueueAddress, QueueError, QueueService,
    ReceiveOptions, MAX_BATCH_SIZE,
};

/// Failure code used for batch entries missing from a batch response.
pub const UNACCOUNTED: &str = "Unaccounted";

const MAX_WAIT_SECONDS: i32 = 20;
const MAX_VISIBILITY_TIMEOUT: i32 = 43_200;

/// Tuning of the transfer loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Messages requested per receive, 1..=10.
    pub batch_size: i32,
    /// Long-poll wait of each receive, 1..=20. A zero wait is a short poll,
    /// which may sample only part of the queue and come back empty early.
    pub wait_seconds: i32,
    /// Must cover a full forward + delete round trip, or the source may
    /// redeliver the batch before it is deleted.
    pub visibility_timeout: i32,
    /// Retries of a transient receive error before giving up. `0` makes any
    /// receive error fatal.
    pub receive_retries: u32,
    pub receive_retry_delay: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            wait_seconds: 1,
            visibility_timeout: 15,
            receive_retries: 0,
            receive_retry_delay: Duration::from_secs(1),
        }
    }
}

impl TransferConfig {
    /// Checks every field against the limits SQS and the loop accept.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of the first field out of range:
    ///
    /// * `batch_size` outside 1..=10
    /// * `wait_seconds` outside 1..=20
    /// * `visibility_timeout` outside 1..=43200
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        if !(1..=MAX_WAIT_SECONDS).contains(&self.wait_seconds) {
            return Err(ConfigError::WaitSeconds(self.wait_seconds));
        }
        if !(1..=MAX_VISIBILITY_TIMEOUT).contains(&self.visibility_timeout) {
            return Err(ConfigError::VisibilityTimeout(self.visibility_timeout));
        }
        Ok(())
    }

    fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.batch_size,
            wait_seconds: self.wait_seconds,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch size must be between 1 and 10, got {0}")]
    BatchSize(i32),
    #[error("wait time must be between 1 and 20 seconds, got {0}")]
    WaitSeconds(i32),
    #[error("visibility timeout must be between 1 and 43200 seconds, got {0}")]
    VisibilityTimeout(i32),
}

/// How a successful run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// A receive returned no messages.
    Drained,
    /// The cancellation token fired between two cycles.
    Cancelled,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drained => "drained",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Counters accumulated over a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferStats {
    /// Receive calls issued, including the final empty one.
    pub cycles: u64,
    pub received: u64,
    pub forwarded: u64,
    pub deleted: u64,
    /// Messages known to exist in both queues.
    pub duplicated: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TransferReport {
    pub completion: Completion,
    #[serde(flatten)]
    pub stats: TransferStats,
}

/// Fatal termination of a run. Every variant carries the stats gathered
/// before the failure.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("fatal: receive failed")]
    Receive {
        source: QueueError,
        stats: TransferStats,
    },

    #[error("fatal: send failed")]
    Send {
        source: QueueError,
        stats: TransferStats,
    },

    #[error(
        "fatal: partial send failure, {} message(s) not forwarded: {}",
        .failed.len(),
        join(.failed)
    )]
    PartialSend {
        failed: Vec<BatchFailure>,
        /// Forwarded members of the failed batch, now present in both queues.
        forwarded: Vec<MessageId>,
        stats: TransferStats,
    },

    #[error("fatal: delete failed, {} forwarded message(s) remain in the source", .duplicated.len())]
    Delete {
        source: QueueError,
        duplicated: Vec<MessageId>,
        stats: TransferStats,
    },
}

impl TransferError {
    pub fn stats(&self) -> &TransferStats {
        match self {
            Self::Receive { stats, .. }
            | Self::Send { stats, .. }
            | Self::PartialSend { stats, .. }
            | Self::Delete { stats, .. } => stats,
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Moves every message from one queue to another.
///
/// # Example
///
/// ```no_run
/// use sqsmv::{QueueAddress, SqsQueueService, Transfer, TransferConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: SqsQueueService, source: QueueAddress, dest: QueueAddress) -> Result<(), Box<dyn std::error::Error>> {
/// let cancel = CancellationToken::new();
/// let transfer = Transfer::new(&service, TransferConfig::default())?.with_cancellation(cancel.clone());
///
/// // cancel.cancel() from another task stops the run between two batches
/// let report = transfer.run(&source, &dest).await?;
/// println!("{:?}: {} duplicated", report.completion, report.stats.duplicated.len());
/// # Ok(())
/// # }
/// ```
pub struct Transfer<'a, Q: ?Sized> {
    service: &'a Q,
    config: TransferConfig,
    cancel: CancellationToken,
}

impl<'a, Q> Transfer<'a, Q>
where
    Q: QueueService + ?Sized,
{
    /// Creates a transfer over `service` with a validated `config`.
    ///
    /// # Arguments
    ///
    /// * `service` - Queue service used for every receive, send and delete
    /// * `config` - Batch size, receive timings and retry policy
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails [`TransferConfig::validate`].
    pub fn new(service: &'a Q, config: TransferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            service,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Stops the run at the start of the next cycle once `token` is cancelled.
    /// A batch already received is always finished first.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Runs cycles until the source is drained, the run is cancelled, or a
    /// fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError`] naming the fatal step. A failed receive,
    /// send or delete call and any message the destination did not accept are
    /// fatal; messages the source failed to delete are only recorded in
    /// [`TransferStats::duplicated`].
    pub async fn run(
        &self,
        source: &QueueAddress,
        dest: &QueueAddress,
    ) -> Result<TransferReport, TransferError> {
        let options = self.config.receive_options();
        let mut stats = TransferStats::default();

        loop {
            if self.cancel.is_cancelled() {
                log::warn!("transfer cancelled after {} cycle(s)", stats.cycles);
                return Ok(TransferReport {
                    completion: Completion::Cancelled,
                    stats,
                });
            }

            stats.cycles += 1;
            let cycle = stats.cycles;
            log::info!("cycle {cycle}: starting new batch");

            let messages = match self.receive(source, &options).await {
                Ok(messages) => messages,
                Err(source) => {
                    log::error!("cycle {cycle}: receive failed: {source}");
                    return Err(TransferError::Receive { source, stats });
                }
            };

            if messages.is_empty() {
                log::info!("cycle {cycle}: batch has no messages, transfer complete");
                return Ok(TransferReport {
                    completion: Completion::Drained,
                    stats,
                });
            }

            stats.received += messages.len() as u64;
            log::info!("cycle {cycle}: received {} message(s)", messages.len());
            log::debug!("cycle {cycle}: messages to transfer: {}", join(&ids(&messages)));

            let outcome = match self
                .service
                .send_batch(dest, mapper::to_forward_entries(&messages))
                .await
            {
                Ok(outcome) => outcome,
                Err(source) => {
                    log::error!("cycle {cycle}: failed to send batch to {dest}: {source}");
                    return Err(TransferError::Send { source, stats });
                }
            };

            let failed = unconfirmed(&messages, &outcome);
            if !failed.is_empty() {
                let failed_ids: HashSet<&MessageId> = failed.iter().map(|f| &f.id).collect();
                let forwarded: Vec<MessageId> = ids(&messages)
                    .into_iter()
                    .filter(|id| !failed_ids.contains(id))
                    .collect();

                stats.forwarded += forwarded.len() as u64;
                stats.duplicated.extend(forwarded.iter().cloned());
                log::error!(
                    "cycle {cycle}: failed to forward {} message(s): {}",
                    failed.len(),
                    join(&failed)
                );
                if !forwarded.is_empty() {
                    log::warn!(
                        "cycle {cycle}: not deleting forwarded message(s), they now exist in both queues: {}",
                        join(&forwarded)
                    );
                }
                return Err(TransferError::PartialSend {
                    failed,
                    forwarded,
                    stats,
                });
            }

            stats.forwarded += messages.len() as u64;
            log::info!("cycle {cycle}: forwarded {} message(s) to {dest}", messages.len());

            let outcome = match self
                .service
                .delete_batch(source, mapper::to_delete_entries(&messages))
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    let duplicated = ids(&messages);
                    stats.duplicated.extend(duplicated.iter().cloned());
                    log::error!(
                        "cycle {cycle}: error deleting messages from {source}, {} message(s) exist in both queues: {err}",
                        duplicated.len()
                    );
                    return Err(TransferError::Delete {
                        source: err,
                        duplicated,
                        stats,
                    });
                }
            };

            let not_deleted = unconfirmed(&messages, &outcome);
            let deleted = messages.len().saturating_sub(not_deleted.len());
            stats.deleted += deleted as u64;
            if !not_deleted.is_empty() {
                stats
                    .duplicated
                    .extend(not_deleted.iter().map(|f| f.id.clone()));
                log::warn!(
                    "cycle {cycle}: the following were not deleted and will be delivered again: {}",
                    join(&not_deleted)
                );
            }
            log::info!("cycle {cycle}: deleted {deleted} message(s)");
        }
    }

    async fn receive(
        &self,
        source: &QueueAddress,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        let mut attempt = 0;
        loop {
            match self.service.receive(source, options).await {
                Ok(messages) => return Ok(messages),
                Err(err) if err.is_transient() && attempt < self.config.receive_retries => {
                    attempt += 1;
                    log::warn!(
                        "receive from {source} failed ({err}), retry {attempt}/{}",
                        self.config.receive_retries
                    );
                    tokio::time::sleep(self.config.receive_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn ids(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id.clone()).collect()
}

/// Entries of `messages` not confirmed by `outcome`: the reported failures
/// plus any id the response does not mention at all.
fn unconfirmed(messages: &[Message], outcome: &BatchOutcome) -> Vec<BatchFailure> {
    let mentioned: HashSet<&MessageId> = outcome
        .successful
        .iter()
        .chain(outcome.failed.iter().map(|f| &f.id))
        .collect();

    let mut failures = outcome.failed.clone();
    failures.extend(
        messages
            .iter()
            .filter(|m| !mentioned.contains(&m.id))
            .map(|m| BatchFailure {
                id: m.id.clone(),
                code: UNACCOUNTED.to_string(),
                message: Some("missing from batch response".to_string()),
                sender_fault: false,
            }),
    );
    failures
}
