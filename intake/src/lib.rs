use anyhow::{Context, Result, anyhow};
use aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse};
use aws_lambda_events::encodings::Body;
use aws_sdk_sqs as sqs;
use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use base64::prelude::*;
use http::HeaderValue;
use http::header::CONTENT_TYPE;
use lambda_runtime::tracing;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const PERMITS: usize = 20;
const SQS_BATCH_LIMIT: usize = 10;

pub const DEFAULT_MAX_BATCH: u64 = 1000;

/// The intake request body.
#[derive(Deserialize, Debug, PartialEq, Eq)]
pub struct Message {
    pub batch: u64,
}

impl Message {
    pub fn from_request(request: &ApiGatewayProxyRequest) -> Result<Message> {
        let body = request
            .body
            .as_deref()
            .ok_or_else(|| anyhow!("request has no body"))?;

        let message = if request.is_base64_encoded {
            let bytes = BASE64_STANDARD
                .decode(body)
                .context("body is not valid base64")?;
            serde_json::from_slice(&bytes)
        } else {
            serde_json::from_str(body)
        };

        message.context("body is not a valid batch request")
    }
}

#[derive(Serialize)]
struct JobBody {
    seq: u64,
    batch: u64,
}

/// One message to enqueue. `id` only has to be unique within a send.
pub struct Job {
    pub id: String,
    pub body: String,
}

impl Job {
    fn new(seq: u64, batch: u64) -> Result<Job> {
        Ok(Job {
            id: uuid::Uuid::new_v4().to_string(),
            body: serde_json::to_string(&JobBody { seq, batch })?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sent {
    pub successful: usize,
    pub failed: usize,
}

/// Destination for enqueued jobs. One call sends at most ten jobs.
pub trait JobQueue: Send + Sync + 'static {
    fn send(&self, jobs: Vec<Job>) -> impl Future<Output = Result<Sent>> + Send;
}

pub struct SqsQueue {
    sqs_client: sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(sqs_client: sqs::Client, queue_url: String) -> SqsQueue {
        SqsQueue {
            sqs_client,
            queue_url,
        }
    }
}

impl JobQueue for SqsQueue {
    async fn send(&self, jobs: Vec<Job>) -> Result<Sent> {
        let entries = jobs
            .into_iter()
            .map(|job| {
                SendMessageBatchRequestEntry::builder()
                    .id(job.id)
                    .message_body(job.body)
                    .build()
                    .map_err(anyhow::Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .sqs_client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| e.into_service_error())?;

        for failure in out.failed() {
            tracing::error!(
                id = failure.id(),
                code = failure.code(),
                "Failed sending job: {}",
                failure.message().unwrap_or_default()
            );
        }

        Ok(Sent {
            successful: out.successful().len(),
            failed: out.failed().len(),
        })
    }
}

pub struct Process<Q> {
    tasks: JoinSet<Result<Sent>>,
    semaphore: Arc<Semaphore>,
    queue: Arc<Q>,
    scheduled: usize,
}

impl<Q: JobQueue> Process<Q> {
    pub fn new(queue: Arc<Q>) -> Process<Q> {
        Process {
            tasks: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(PERMITS)),
            queue,
            scheduled: 0,
        }
    }

    /// Enqueues `count` jobs of a `batch` in chunks of ten and waits for every send.
    /// Every scheduled job ends up counted as either successful or failed.
    pub async fn run(&mut self, count: u64, batch: u64) -> Result<Sent> {
        let started = self.start_work(count, batch).await;

        let mut successful = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(out)) => successful += out.successful,
                Ok(Err(err)) => tracing::error!("Failed sending SQS batch: {:#}", err),
                Err(err) => tracing::error!("SQS send task failed: {}", err),
            }
        }
        started?;

        let sent = Sent {
            successful,
            failed: self.scheduled.saturating_sub(successful),
        };
        tracing::info!("Number of successful messages sent: {}", sent.successful);
        tracing::info!("Number of failed messages sent: {}", sent.failed);

        Ok(sent)
    }

    async fn start_work(&mut self, count: u64, batch: u64) -> Result<()> {
        let mut provisional = Vec::with_capacity(SQS_BATCH_LIMIT);

        for seq in 0..count {
            provisional.push(Job::new(seq, batch)?);

            if provisional.len() == SQS_BATCH_LIMIT {
                self.work(std::mem::take(&mut provisional)).await?;
            }
        }

        if !provisional.is_empty() {
            self.work(provisional).await?;
        }

        Ok(())
    }

    async fn work(&mut self, jobs: Vec<Job>) -> Result<()> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let queue = Arc::clone(&self.queue);
        self.scheduled += jobs.len();

        self.tasks.spawn(async move {
            let out = queue.send(jobs).await;
            drop(permit);
            out
        });

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub queue_url: Option<String>,
    pub max_batch: u64,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // SQS_QUEUE_NAME is the older name for the queue URL.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let queue_url = lookup("SQS_QUEUE_URL")
            .or_else(|| lookup("SQS_QUEUE_NAME"))
            .filter(|url| !url.is_empty());

        let max_batch = lookup("MAX_BATCH")
            .map(|value| value.trim().parse::<u64>())
            .transpose()
            .context("invalid MAX_BATCH")?
            .unwrap_or(DEFAULT_MAX_BATCH);

        Ok(Config {
            queue_url,
            max_batch,
        })
    }
}

pub struct Intake<Q> {
    queue: Option<Arc<Q>>,
    max_batch: u64,
}

impl<Q: JobQueue> Intake<Q> {
    pub fn new(queue: Option<Arc<Q>>, max_batch: u64) -> Intake<Q> {
        Intake { queue, max_batch }
    }

    /// Answers 200 for every well-formed request, whatever happens downstream,
    /// and 400 for a missing or malformed body. At most `max_batch` jobs are
    /// enqueued per request.
    pub async fn handle(&self, request: &ApiGatewayProxyRequest) -> ApiGatewayProxyResponse {
        let message = match Message::from_request(request) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("Rejected request: {:#}", err);
                return respond(400, format!("Bad Request: {err:#}"));
            }
        };

        tracing::info!("Batch requested: {}", message.batch);

        let Some(queue) = &self.queue else {
            tracing::warn!("No queue configured, nothing enqueued");
            return respond(200, format!("Job Accepted: batch of {}", message.batch));
        };

        let mut accepted = format!("Job Accepted: batch of {}", message.batch);
        let count = if message.batch > self.max_batch {
            tracing::warn!("Batch of {} capped at {}", message.batch, self.max_batch);
            accepted.push_str(&format!(", capped at {}", self.max_batch));
            self.max_batch
        } else {
            message.batch
        };

        let body = match Process::new(Arc::clone(queue))
            .run(count, message.batch)
            .await
        {
            Ok(sent) => format!(
                "{accepted}, {} queued, {} failed",
                sent.successful, sent.failed
            ),
            Err(err) => {
                tracing::error!("Enqueue aborted: {:#}", err);
                format!("{accepted}, enqueue aborted")
            }
        };

        respond(200, body)
    }
}

fn respond(status_code: i64, body: String) -> ApiGatewayProxyResponse {
    let mut response = ApiGatewayProxyResponse::default();
    response.status_code = status_code;
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
    response.body = Some(Body::Text(body));
    response
}
