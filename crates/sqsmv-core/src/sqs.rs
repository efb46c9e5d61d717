//! AWS SQS implementation of [`QueueService`].

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs as sqs;
use sqs::config::Credentials;
use sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use sqs::types::{BatchResultErrorEntry, DeleteMessageBatchRequestEntry, SendMessageBatchRequestEntry};

use crate::queue::{
    BatchFailure, BatchOutcome, DeleteEntry, ForwardEntry, Message, MessageId, QueueAddress,
    QueueError, QueueService, ReceiptHandle, ReceiveOptions,
};

const DEFAULT_LOCAL_REGION: &str = "us-east-1";

/// Builds an AWS config for LocalStack or another SQS-compatible endpoint.
///
/// Credentials are the static `test`/`test` pair LocalStack accepts, so the
/// default credential chain is never consulted.
///
/// # Arguments
///
/// * `endpoint_url` - Base URL of the endpoint, e.g. `http://localhost:4566`
/// * `region` - Region to sign requests for; `us-east-1` when `None`
///
/// # Example
///
/// ```no_run
/// use sqsmv::SqsQueueService;
///
/// # async fn example() {
/// let config = sqsmv::local_config("http://localhost:4566", None).load().await;
/// let service = SqsQueueService::from_config(&config);
/// # }
/// ```
pub fn local_config(endpoint_url: &str, region: Option<String>) -> aws_config::ConfigLoader {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .endpoint_url(endpoint_url)
        .region(aws_config::Region::new(
            region.unwrap_or_else(|| DEFAULT_LOCAL_REGION.to_string()),
        ))
        .credentials_provider(Credentials::new("test", "test", None, None, "static"))
}

/// [`QueueService`] backed by the AWS SDK SQS client.
///
/// # Example
///
/// ```no_run
/// use sqsmv::{QueueService, SqsQueueService};
///
/// # async fn example() -> Result<(), sqsmv::QueueError> {
/// let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
/// let service = SqsQueueService::from_config(&config);
///
/// let url = service.resolve("my-dlq").await?;
/// println!("Queue: {}", url);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SqsQueueService {
    pub client: sqs::Client,
}

impl SqsQueueService {
    /// Creates the service from a pre-built AWS SDK config.
    ///
    /// # Arguments
    ///
    /// * `config` - AWS config, either from the default chain or [`local_config`]
    pub fn from_config(config: &SdkConfig) -> Self {
        Self::from_client(sqs::Client::new(config))
    }

    /// Wraps an existing SQS client.
    pub fn from_client(client: sqs::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueService for SqsQueueService {
    async fn resolve(&self, queue_name: &str) -> Result<QueueAddress, QueueError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_queue_does_not_exist() || is_missing_queue_code(e.code()))
                    .unwrap_or(false);
                if missing {
                    QueueError::NotFound {
                        queue: queue_name.to_string(),
                    }
                } else {
                    service_error("GetQueueUrl", err)
                }
            })?;

        let url = output.queue_url.ok_or_else(|| {
            QueueError::InvalidResponse(format!("no queue url returned for `{queue_name}`"))
        })?;
        log::debug!("resolved queue {queue_name} to {url}");
        Ok(QueueAddress::new(url))
    }

    async fn receive(
        &self,
        address: &QueueAddress,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(address.as_str())
            .max_number_of_messages(options.max_messages)
            .wait_time_seconds(options.wait_seconds)
            .visibility_timeout(options.visibility_timeout)
            .send()
            .await
            .map_err(|err| service_error("ReceiveMessage", err))?;

        // no messages comes back as `None` rather than an empty list
        output
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(from_aws_message)
            .collect()
    }

    async fn send_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<ForwardEntry>,
    ) -> Result<BatchOutcome, QueueError> {
        // SQS rejects empty batch requests
        if entries.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let entries = entries
            .into_iter()
            .map(|entry| {
                SendMessageBatchRequestEntry::builder()
                    .id(entry.id.as_str())
                    .message_body(entry.body)
                    .build()
                    .map_err(|e| QueueError::InvalidRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .send_message_batch()
            .queue_url(address.as_str())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|err| service_error("SendMessageBatch", err))?;

        Ok(BatchOutcome {
            successful: output
                .successful()
                .iter()
                .map(|entry| MessageId::new(entry.id()))
                .collect(),
            failed: failures(output.failed()),
        })
    }

    async fn delete_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchOutcome, QueueError> {
        if entries.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let entries = entries
            .into_iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.id.as_str())
                    .receipt_handle(entry.receipt.as_str())
                    .build()
                    .map_err(|e| QueueError::InvalidRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(address.as_str())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|err| service_error("DeleteMessageBatch", err))?;

        Ok(BatchOutcome {
            successful: output
                .successful()
                .iter()
                .map(|entry| MessageId::new(entry.id()))
                .collect(),
            failed: failures(output.failed()),
        })
    }
}

/// Converts an AWS SDK message into a [`Message`].
///
/// SQS always populates the id, receipt handle and body of a received
/// message; a message missing any of them is reported as an invalid response.
fn from_aws_message(message: sqs::types::Message) -> Result<Message, QueueError> {
    let id = message
        .message_id
        .ok_or_else(|| QueueError::InvalidResponse("message without MessageId".into()))?;
    let receipt = message.receipt_handle.ok_or_else(|| {
        QueueError::InvalidResponse(format!("message {id} without ReceiptHandle"))
    })?;
    let body = message
        .body
        .ok_or_else(|| QueueError::InvalidResponse(format!("message {id} without Body")))?;

    Ok(Message {
        id: MessageId::new(id),
        receipt: ReceiptHandle::new(receipt),
        body,
    })
}

fn failures(entries: &[BatchResultErrorEntry]) -> Vec<BatchFailure> {
    entries
        .iter()
        .map(|entry| BatchFailure {
            id: MessageId::new(entry.id()),
            code: entry.code().to_string(),
            message: entry.message().map(str::to_string),
            sender_fault: entry.sender_fault(),
        })
        .collect()
}

fn is_missing_queue_code(code: Option<&str>) -> bool {
    matches!(
        code,
        Some("QueueDoesNotExist" | "AWS.SimpleQueueService.NonExistentQueue")
    )
}

const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "ExpiredToken",
];

const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "KmsThrottled",
];

fn service_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();

    if let Some(code) = code.as_deref() {
        if PERMISSION_CODES.contains(&code) {
            return QueueError::PermissionDenied { operation, message };
        }
    }

    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => code
            .as_deref()
            .map(|code| TRANSIENT_CODES.contains(&code))
            .unwrap_or(false),
        _ => false,
    };

    QueueError::Service {
        operation,
        source: message.into(),
        transient,
    }
}
