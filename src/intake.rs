use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesOrdered, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use crate::error::EngineError;
use crate::limits::MAX_PENDING_REPLIES;
use crate::model::{BookingRequest, JobId};
use crate::queue::JobQueue;
use crate::service::BookingService;

/// Upper bound for a client-supplied `wait` timeout.
const MAX_WAIT_MS: u64 = 60_000;

/// One line of client input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    /// Admit a booking request.
    Book(BookingRequest),
    /// Current status of a job.
    #[serde(rename_all = "camelCase")]
    Status { job_id: JobId },
    /// Raw job result, `{success, booking}` or `{success, reason}`.
    #[serde(rename = "result", rename_all = "camelCase")]
    JobResult { job_id: JobId },
    /// Status once the job settles, or `pending` after `timeout_ms`.
    #[serde(rename_all = "camelCase")]
    Wait {
        job_id: JobId,
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
    },
}

fn default_wait_ms() -> u64 {
    5_000
}

pub fn parse(line: &str) -> Result<Command, String> {
    serde_json::from_str(line).map_err(|e| format!("invalid command: {e}"))
}

fn error_reply(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

fn status_reply(result: Result<crate::model::StatusReport, EngineError>) -> Value {
    match result {
        Ok(report) => serde_json::to_value(report).unwrap_or_else(error_reply),
        Err(e) => error_reply(e),
    }
}

pub async fn execute(service: &BookingService, command: Command) -> Value {
    match command {
        Command::Book(request) => match service.submit(request).await {
            Ok(job_id) => json!({ "jobId": job_id }),
            Err(e) => error_reply(e),
        },
        Command::Status { job_id } => status_reply(service.status(job_id)),
        Command::JobResult { job_id } => match service.queue().get(job_id) {
            None => error_reply(EngineError::JobNotFound(job_id)),
            Some(record) => match record.outcome {
                Some(outcome) => outcome.to_json(),
                None => error_reply("job has no result"),
            },
        },
        Command::Wait { job_id, timeout_ms } => {
            let timeout = Duration::from_millis(timeout_ms.min(MAX_WAIT_MS));
            status_reply(service.tracker().wait(job_id, timeout).await)
        }
    }
}

/// Handle one raw input line and produce the reply object.
pub async fn handle_line(service: &BookingService, line: &str) -> Value {
    match parse(line) {
        Ok(command) => execute(service, command).await,
        Err(message) => error_reply(message),
    }
}

/// Read commands from `input` until EOF or `shutdown`, writing one reply per
/// non-blank line to `output`.
///
/// Every command runs on its own task, so a long `wait` only holds back the
/// replies queued behind it. Replies keep input order. On EOF the remaining
/// replies are still written; on `shutdown` they are abandoned.
pub async fn serve<R, W>(
    service: Arc<BookingService>,
    input: R,
    mut output: W,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut replies = FuturesOrdered::new();
    let mut reading = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if reading && replies.len() < MAX_PENDING_REPLIES => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        let service = service.clone();
                        replies.push_back(tokio::spawn(async move {
                            handle_line(&service, &line).await
                        }));
                    }
                    Ok(None) => {
                        info!("end of input, stopping intake");
                        reading = false;
                    }
                    Err(e) => {
                        error!("input read error: {e}");
                        reading = false;
                    }
                }
            }
            Some(reply) = replies.next() => {
                let reply = reply.unwrap_or_else(error_reply);
                output.write_all(format!("{reply}\n").as_bytes()).await?;
                output.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping intake");
                break;
            }
        }
        if !reading && replies.is_empty() {
            break;
        }
    }
    Ok(())
}
