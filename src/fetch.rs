//! HTTP fetch/extract pipeline for download jobs.
//!
//! A response is either a zip archive, which is stream-parsed and only its
//! chart entries are written, or a single chart file written as-is. Network
//! progress fills 0-90%; the last 10% is reserved for finalization.

use std::future::Future;
use std::io;
use std::path::Path;
use std::task::Poll;
use std::time::Duration;

use futures::{StreamExt, stream};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

use crate::domain::{CHART_FILE_EXTENSION, JobStatus};
use crate::error::ChartError;
use crate::fs_util::{self, destination_filename};
use crate::jobs::{Fetcher, JobContext};

pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_redirects: usize,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, max_redirects: usize) -> Result<Self, ChartError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("chartkeeper/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ChartError::Http(err.to_string()))?,
        );
        // Redirects are followed by hand so the job sees the rewritten url.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| ChartError::Http(err.to_string()))?;
        Ok(Self {
            client,
            max_redirects,
        })
    }

    async fn run(&self, job: JobContext) -> Result<(), ChartError> {
        match self.download(&job).await {
            Err(_) if job.is_cancelled() => Err(ChartError::Cancelled),
            other => other,
        }
    }

    async fn download(&self, job: &JobContext) -> Result<(), ChartError> {
        tokio::fs::create_dir_all(job.target_directory())
            .await
            .map_err(|err| write_failure(job.target_directory(), err))?;

        let response = self.send_following_redirects(job).await?;
        job.set_total(response.content_length().unwrap_or(0));

        if is_archive(&response) {
            self.extract_archive(job, response).await
        } else {
            self.write_file(job, response).await
        }
    }

    async fn send_following_redirects(&self, job: &JobContext) -> Result<Response, ChartError> {
        let mut redirects = 0;
        loop {
            let url = job.url();
            let response = tokio::select! {
                biased;
                _ = job.cancellation().cancelled() => return Err(ChartError::Cancelled),
                response = self.client.get(&url).send() => {
                    response.map_err(|err| ChartError::Http(err.to_string()))?
                }
            };

            let status = response.status();
            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                {
                    if redirects >= self.max_redirects {
                        return Err(ChartError::TooManyRedirects(url));
                    }
                    let next = response
                        .url()
                        .join(location)
                        .map_err(|err| ChartError::InvalidUrl(format!("{location}: {err}")))?;
                    debug!(job = %job.id(), from = %url, to = %next, "following redirect");
                    job.redirect(next.as_str());
                    redirects += 1;
                    continue;
                }
            }

            if !status.is_success() {
                return Err(ChartError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            return Ok(response);
        }
    }

    async fn write_file(&self, job: &JobContext, mut response: Response) -> Result<(), ChartError> {
        let filename = destination_filename(job.requested_name(), &job.url())?;
        job.register_target(&filename)?;
        let path = job.target_directory().join(&filename);

        if let Err(err) = stream_to_file(job, &mut response, &path).await {
            fs_util::remove_file_quietly(&path);
            return Err(err);
        }

        job.mark_extracted(&filename);
        job.set_progress(100);
        info!(job = %job.id(), file = %filename, "chart file written");
        Ok(())
    }

    async fn extract_archive(&self, job: &JobContext, response: Response) -> Result<(), ChartError> {
        job.set_status(JobStatus::Extracting);

        // Cancellation ends the body at once and then yields an error that
        // readers do not retry, so the extractor stops without draining.
        let progress = job.clone();
        let token = job.cancellation().clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|chunk| {
                        progress.add_transferred(chunk.len() as u64);
                        chunk
                    })
                    .map_err(io::Error::other)
            })
            .take_until(token.clone().cancelled_owned())
            .chain(stream::poll_fn(move |_| {
                if token.is_cancelled() {
                    Poll::Ready(Some(Err(io::Error::other(ChartError::Cancelled))))
                } else {
                    Poll::Ready(None)
                }
            }));
        let reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));

        let observer = job.clone();
        let target = job.target_directory().to_path_buf();
        let written = tokio::task::spawn_blocking(move || {
            fs_util::extract_matching(reader, &target, CHART_FILE_EXTENSION, &observer)
        })
        .await
        .map_err(|err| ChartError::Archive(err.to_string()))??;

        job.set_progress(100);
        info!(job = %job.id(), files = written.len(), "archive extracted");
        Ok(())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, job: JobContext) -> impl Future<Output = Result<(), ChartError>> + Send {
        self.run(job)
    }
}

async fn stream_to_file(
    job: &JobContext,
    response: &mut Response,
    path: &Path,
) -> Result<(), ChartError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|err| write_failure(path, err))?;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = job.cancellation().cancelled() => return Err(ChartError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|err| ChartError::Http(err.to_string()))?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk)
            .await
            .map_err(|err| write_failure(path, err))?;
        job.add_transferred(chunk.len() as u64);
    }
    file.flush().await.map_err(|err| write_failure(path, err))?;
    file.sync_all().await.map_err(|err| write_failure(path, err))?;
    Ok(())
}

/// Zip archives are recognised by content type or by a `.zip` url suffix.
fn is_archive(response: &Response) -> bool {
    let zip_content = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("zip"))
        .unwrap_or(false);
    zip_content || response.url().path().to_ascii_lowercase().ends_with(".zip")
}

fn write_failure(path: &Path, err: io::Error) -> ChartError {
    ChartError::WriteFailure(format!("{}: {err}", path.display()))
}
