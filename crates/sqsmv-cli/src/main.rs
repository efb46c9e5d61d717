use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqsmv::{
    Completion, QueueAddress, QueueService, SqsQueueService, Transfer, TransferConfig,
    TransferStats,
};
use tokio_util::sync::CancellationToken;

const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

/// Exit status of a fatal transfer.
const EXIT_FATAL: u8 = 1;
/// Exit status of a failure before any message was received.
const EXIT_SETUP: u8 = 2;
/// Exit status of an interrupted run; the source may still hold messages.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
pub async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    Cli::parse().run().await
}

#[derive(Debug, Parser)]
#[command(name = "sqsmv")]
#[command(about = "move every message from one aws sqs queue to another", long_about = None)]
pub struct Cli {
    /// Source queue name
    #[arg(long, env = "SQSMV_SOURCE")]
    source: String,

    /// Destination queue name
    #[arg(long, env = "SQSMV_DEST")]
    dest: String,

    /// Messages received per batch
    #[arg(long, env = "SQSMV_BATCH_SIZE", default_value_t = 10, value_parser = clap::value_parser!(i32).range(1..=10))]
    batch_size: i32,

    /// Long-poll wait of each receive, in seconds
    #[arg(long, env = "SQSMV_WAIT_SECONDS", default_value_t = 1, value_parser = clap::value_parser!(i32).range(1..=20))]
    wait_seconds: i32,

    /// Seconds a received batch stays hidden; must cover a forward and a delete
    #[arg(long, env = "SQSMV_VISIBILITY_TIMEOUT", default_value_t = 15, value_parser = clap::value_parser!(i32).range(1..=43200))]
    visibility_timeout: i32,

    /// Retries of a transient receive error before the transfer fails
    #[arg(long, env = "SQSMV_RECEIVE_RETRIES", default_value_t = 0)]
    receive_retries: u32,

    /// AWS region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Override the SQS endpoint (e.g. LocalStack)
    #[arg(long, env = "SQSMV_ENDPOINT")]
    endpoint: Option<String>,

    /// Use static test credentials, for LocalStack
    #[arg(long, action)]
    local: bool,

    /// Print the final report as JSON on stdout
    #[arg(long, action)]
    json: bool,
}

struct Setup {
    service: SqsQueueService,
    source: QueueAddress,
    dest: QueueAddress,
}

impl Cli {
    pub async fn run(self) -> ExitCode {
        let config = self.transfer_config();

        let setup = match self.setup().await {
            Ok(setup) => setup,
            Err(e) => {
                eprintln!("error: {e:#}");
                return ExitCode::from(EXIT_SETUP);
            }
        };

        let transfer = match Transfer::new(&setup.service, config) {
            Ok(transfer) => transfer.with_cancellation(cancel_on_ctrl_c()),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(EXIT_SETUP);
            }
        };

        log::info!(
            "transferring messages from {} to {}",
            setup.source,
            setup.dest
        );

        match transfer.run(&setup.source, &setup.dest).await {
            Ok(report) => {
                if self.json {
                    print_json(&report);
                } else {
                    println!("transfer {}", report.completion.as_str());
                    print_stats(&report.stats);
                }
                ExitCode::from(completion_code(report.completion))
            }
            Err(e) => {
                let stats = e.stats().clone();
                eprintln!("{:#}", anyhow::Error::from(e));
                if self.json {
                    print_json(&stats);
                } else {
                    print_stats(&stats);
                }
                ExitCode::from(EXIT_FATAL)
            }
        }
    }

    fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            batch_size: self.batch_size,
            wait_seconds: self.wait_seconds,
            visibility_timeout: self.visibility_timeout,
            receive_retries: self.receive_retries,
            receive_retry_delay: Duration::from_secs(1),
        }
    }

    async fn setup(&self) -> anyhow::Result<Setup> {
        let service = SqsQueueService::from_config(&self.aws_config().await);

        let source = service
            .resolve(&self.source)
            .await
            .with_context(|| format!("failed to resolve source queue `{}`", self.source))?;
        let dest = service
            .resolve(&self.dest)
            .await
            .with_context(|| format!("failed to resolve destination queue `{}`", self.dest))?;

        Ok(Setup {
            service,
            source,
            dest,
        })
    }

    async fn aws_config(&self) -> aws_config::SdkConfig {
        if self.local {
            let endpoint = self.endpoint.as_deref().unwrap_or(LOCALSTACK_ENDPOINT);
            return sqsmv::local_config(endpoint, self.region.clone()).load().await;
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        loader.load().await
    }
}

/// Only a drained source counts as success.
fn completion_code(completion: Completion) -> u8 {
    match completion {
        Completion::Drained => 0,
        Completion::Cancelled => EXIT_CANCELLED,
    }
}

/// Cancels the returned token on the first Ctrl-C, so the transfer stops
/// before its next receive. A second Ctrl-C exits the process right away,
/// leaving the in-flight batch to reappear once its visibility timeout expires.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if trigger.is_cancelled() {
                log::error!("received second Ctrl-C, exiting without finishing the current batch");
                std::process::exit(EXIT_CANCELLED.into());
            }
            log::warn!("received Ctrl-C, stopping after the current batch (press again to exit now)");
            trigger.cancel();
        }
    });

    token
}

fn print_stats(stats: &TransferStats) {
    println!(
        "cycles: {}, received: {}, forwarded: {}, deleted: {}",
        stats.cycles, stats.received, stats.forwarded, stats.deleted
    );
    if !stats.duplicated.is_empty() {
        let ids: Vec<&str> = stats.duplicated.iter().map(|id| id.as_str()).collect();
        println!("present in both queues: {}", ids.join(", "));
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize report: {e}"),
    }
}
