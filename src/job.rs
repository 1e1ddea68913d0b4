//! Polling asynchronous server-side operations to completion.
//!
//! A [`JobPoll`] runs in a background task. Warnings from every non-terminal
//! poll are delivered as soon as they arrive through its [`Stream`]
//! implementation; the terminal response (or the error that ended polling) is
//! returned by [`JobPoll::outcome`] together with its own warnings.
//!
//! ```no_run
//! use cplane::{Client, Job, JobHandle};
//! use futures::StreamExt;
//!
//! # async fn example(client: Client) -> Result<(), cplane::Failure> {
//! let mut poll = client.poll_job::<Job>(JobHandle::new("https://api.example.com/v3/jobs/some-guid")?);
//! while let Some(warnings) = poll.next().await {
//!     for warning in warnings {
//!         eprintln!("warning: {}", warning);
//!     }
//! }
//! let job = poll.outcome().await?;
//! println!("job {} finished", job.data.guid);
//! # Ok(())
//! # }
//! ```

use crate::{
    error::{ApiErrorDetail, Failure},
    pagination::Link,
    CallResult, Chain, Envelope, Error, Request, Response, Result,
};
use futures::Stream;
use http::{header, Method};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Lifecycle of an asynchronous operation, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Queued, processing, staging or running.
    Pending,
    /// The server is waiting on an external system.
    Polling,
    /// Finished successfully.
    Complete,
    /// Finished unsuccessfully.
    Failed,
    /// A state this client does not know; treated as still running.
    Unknown(String),
}

impl JobState {
    /// Returns `true` once no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl From<&str> for JobState {
    fn from(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "QUEUED" | "PROCESSING" | "STAGING" | "RUNNING" | "PENDING" => JobState::Pending,
            "POLLING" => JobState::Polling,
            "COMPLETE" | "STAGED" | "SUCCEEDED" | "FINISHED" => JobState::Complete,
            "FAILED" => JobState::Failed,
            _ => JobState::Unknown(state.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let state = String::deserialize(deserializer)?;
        Ok(JobState::from(state.as_str()))
    }
}

/// A resource whose state the poller can track.
pub trait JobResource: DeserializeOwned + Send + 'static {
    /// The current state.
    fn state(&self) -> JobState;

    /// Why the operation failed, when it did.
    fn failure_reason(&self) -> Option<String>;

    /// Where to fetch the current state from.
    fn self_link(&self) -> Option<&str>;
}

/// The `links` object of a job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobLinks {
    /// Link to the job itself.
    #[serde(rename = "self")]
    pub self_link: Option<Link>,
}

/// An asynchronous control-plane job.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// Job identifier.
    pub guid: String,
    /// Current state.
    pub state: JobState,
    /// Errors reported for a failed job.
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
    /// Hypermedia links.
    #[serde(default)]
    pub links: JobLinks,
}

impl JobResource for Job {
    fn state(&self) -> JobState {
        self.state.clone()
    }

    fn failure_reason(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|e| e.detail.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    fn self_link(&self) -> Option<&str> {
        self.links.self_link.as_ref().map(|l| l.href.as_str())
    }
}

/// Where a job's status is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    url: Url,
}

impl JobHandle {
    /// Creates a handle from the job's absolute URL.
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url.as_ref())?,
        })
    }

    /// Reads the `Location` header of an accepted asynchronous request.
    pub fn from_location(envelope: &Envelope) -> Option<Self> {
        envelope
            .header(header::LOCATION.as_str())
            .and_then(|location| Self::new(location).ok())
    }

    /// The status URL.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Timing of a polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Wait between polls.
    pub interval: Duration,
    /// Give up after this long overall.
    pub timeout: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: None,
        }
    }
}

/// A running poll of an asynchronous operation.
///
/// Dropping it, or calling [`JobPoll::cancel`], stops the background task at
/// its next wait.
pub struct JobPoll<J> {
    warnings: mpsc::UnboundedReceiver<Vec<String>>,
    outcome: oneshot::Receiver<CallResult<Response<J>>>,
    cancel: CancellationToken,
}

impl<J> JobPoll<J> {
    /// Stops polling. The outcome becomes [`Error::Cancelled`] unless the job
    /// already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the terminal state.
    ///
    /// Warning batches not yet taken from the stream are discarded.
    pub async fn outcome(mut self) -> CallResult<Response<J>> {
        let outcome = (&mut self.outcome)
            .await
            .unwrap_or_else(|_| Err(Error::Cancelled.into()));
        outcome
    }
}

impl<J> Stream for JobPoll<J> {
    type Item = Vec<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.warnings.poll_recv(cx)
    }
}

impl<J> Drop for JobPoll<J> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Start {
    Submit(Request),
    Poll(JobHandle),
}

/// Spawns the polling task.
fn spawn_poll<J: JobResource>(chain: Chain, start: Start, settings: PollSettings) -> JobPoll<J> {
    let (warnings_tx, warnings) = mpsc::unbounded_channel();
    let (outcome_tx, outcome) = oneshot::channel();
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let result = run(&chain, start, settings, &warnings_tx, &task_cancel).await;
        let _ = outcome_tx.send(result);
    });

    JobPoll {
        warnings,
        outcome,
        cancel,
    }
}

pub(crate) fn submit<J: JobResource>(chain: Chain, request: Request, settings: PollSettings) -> JobPoll<J> {
    spawn_poll(chain, Start::Submit(request), settings)
}

pub(crate) fn poll<J: JobResource>(chain: Chain, handle: JobHandle, settings: PollSettings) -> JobPoll<J> {
    spawn_poll(chain, Start::Poll(handle), settings)
}

/// Sends one request and decodes the job, keeping the warnings on failure.
async fn fetch<J: JobResource>(chain: &Chain, request: &Request) -> CallResult<(J, Envelope)> {
    let envelope = chain.send(request).await?;
    match envelope.decode::<J>() {
        Ok(job) => Ok((job, envelope)),
        Err(error) => Err(Failure::new(error, envelope.warnings)),
    }
}

async fn run<J: JobResource>(
    chain: &Chain,
    start: Start,
    settings: PollSettings,
    warnings: &mpsc::UnboundedSender<Vec<String>>,
    cancel: &CancellationToken,
) -> CallResult<Response<J>> {
    let deadline = settings
        .timeout
        .map(|timeout| (Instant::now() + timeout, timeout));

    let (mut job, mut envelope, handle) = match start {
        Start::Submit(request) => {
            let envelope = chain.send(&request).await?;
            if let Some(error) = envelope.error() {
                return Err(Failure::new(error, envelope.warnings));
            }
            let location = JobHandle::from_location(&envelope);

            // An accepted request may answer with the job itself, or only
            // with a Location header and an empty (or unrelated) body.
            match (envelope.decode_optional::<J>(), location) {
                (Ok(Some(job)), location) => {
                    let handle = job
                        .self_link()
                        .and_then(|link| JobHandle::new(link).ok())
                        .or(location);
                    (job, envelope, handle)
                }
                (_, Some(handle)) => {
                    tracing::debug!(url = %handle.url, "Following Location header to job");
                    let _ = warnings.send(envelope.warnings);
                    let (job, envelope) =
                        fetch(chain, &Request::to_url(Method::GET, handle.url.clone())).await?;
                    (job, envelope, Some(handle))
                }
                (Ok(None), None) => {
                    return Err(Failure::new(
                        Error::ConfigurationError("Job has no status link to poll".to_string()),
                        envelope.warnings,
                    ))
                }
                (Err(error), None) => return Err(Failure::new(error, envelope.warnings)),
            }
        }
        Start::Poll(handle) => {
            let (job, envelope) = fetch(chain, &Request::to_url(Method::GET, handle.url.clone())).await?;
            (job, envelope, Some(handle))
        }
    };

    loop {
        match job.state() {
            JobState::Complete => {
                tracing::debug!(attempts = envelope.attempts, "Job complete");
                return Ok(envelope.into_response(job));
            }
            JobState::Failed => {
                let reason = job
                    .failure_reason()
                    .unwrap_or_else(|| "unknown failure".to_string());
                tracing::warn!(reason = %reason, "Job failed");
                return Err(Failure::new(Error::JobFailed { reason }, envelope.warnings));
            }
            state => {
                tracing::debug!(state = ?state, "Job still running");
            }
        }

        // Non-terminal: hand this poll's warnings over right away.
        let _ = warnings.send(envelope.warnings);

        let Some(handle) = handle.as_ref() else {
            return Err(Error::ConfigurationError(
                "Job has no status link to poll".to_string(),
            )
            .into());
        };

        let timed_out = || Error::JobTimeout {
            url: handle.url.to_string(),
            timeout: deadline.map(|(_, timeout)| timeout).unwrap_or_default(),
        };
        if deadline.is_some_and(|(at, _)| Instant::now() >= at) {
            return Err(timed_out().into());
        }

        // The wait never outlasts the overall deadline.
        let expiry = async {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            _ = expiry => return Err(timed_out().into()),
            _ = tokio::time::sleep(settings.interval) => {}
        }

        (job, envelope) = fetch(chain, &Request::to_url(Method::GET, handle.url.clone())).await?;
    }
}
