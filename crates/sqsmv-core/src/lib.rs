//! # sqsmv-core
//!
//! Core library for moving every message of one AWS SQS queue into another.
//!
//! The transfer is a loop of batched receive, batched forward and conditional
//! batched delete. A batch is deleted from the source only after every one of
//! its messages was accepted by the destination, so delivery is at-least-once:
//! failures can leave a message in both queues, never in neither.
//!
//! ## Features
//!
//! - **Queue contract**: [`QueueService`] describes the four queue operations the loop needs
//! - **SQS client**: [`SqsQueueService`] implements the contract with the AWS SDK
//! - **Transfer loop**: [`Transfer`] drains the source and reports what moved
//!
//! ## Example
//!
//! ```no_run
//! use sqsmv::{QueueService, SqsQueueService, Transfer, TransferConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Load AWS configuration
//! let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//! let service = SqsQueueService::from_config(&config);
//!
//! let source = service.resolve("orders-dlq").await?;
//! let dest = service.resolve("orders").await?;
//!
//! let report = Transfer::new(&service, TransferConfig::default())?
//!     .run(&source, &dest)
//!     .await?;
//! println!("moved {} messages", report.stats.deleted);
//! # Ok(())
//! # }
//! ```

pub mod mapper;
mod queue;
mod sqs;
mod transfer;

#[cfg(test)]
mod test_utils;

pub use queue::*;
pub use sqs::*;
pub use transfer::*;
