//! HTTP tests: `http-get` downloads a URL, `http-upload` POSTs a random payload.
//!
//! Both send through the worker's transport, so they run against a test proxy unchanged.

use crate::options::PerfTestOptions;
use crate::perftest::{GlobalOptions, GlobalPerfTest, PerfError, PerfTest, PerfTestFactory, RunContext};
use crate::random::RandomStream;
use crate::recording::Transport;
use async_trait::async_trait;
use reqwest::{Method, Request};
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const DEFAULT_UPLOAD_SIZE: usize = 1024;

pub struct HttpGetFactory;

#[async_trait]
impl PerfTestFactory for HttpGetFactory {
    fn name(&self) -> &str {
        "http-get"
    }

    fn description(&self) -> &str {
        "GETs `url` and drains the response body"
    }

    async fn global_setup(
        &self,
        _ctx: &RunContext,
        options: &GlobalOptions,
    ) -> Result<Box<dyn GlobalPerfTest>, PerfError> {
        let url = parse_url(options.args.require("url")?)?;
        info!("http-get target {}", url);
        Ok(Box::new(HttpGetGlobal { url }))
    }
}

struct HttpGetGlobal {
    url: Url,
}

#[async_trait]
impl GlobalPerfTest for HttpGetGlobal {
    async fn new_perf_test(
        &self,
        _ctx: &RunContext,
        options: Arc<PerfTestOptions>,
    ) -> Result<Box<dyn PerfTest>, PerfError> {
        Ok(Box::new(HttpGetTest {
            url: self.url.clone(),
            options,
        }))
    }
}

struct HttpGetTest {
    url: Url,
    options: Arc<PerfTestOptions>,
}

#[async_trait]
impl PerfTest for HttpGetTest {
    async fn run(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
        let request = Request::new(Method::GET, self.url.clone());
        let received = send(self.options.transport(), request).await?;
        debug!("GET {} returned {} bytes", self.url, received);
        Ok(())
    }
}

pub struct HttpUploadFactory;

#[async_trait]
impl PerfTestFactory for HttpUploadFactory {
    fn name(&self) -> &str {
        "http-upload"
    }

    fn description(&self) -> &str {
        "POSTs `size` random bytes (default 1024) to `url`"
    }

    async fn global_setup(
        &self,
        _ctx: &RunContext,
        options: &GlobalOptions,
    ) -> Result<Box<dyn GlobalPerfTest>, PerfError> {
        let url = parse_url(options.args.require("url")?)?;
        let size = options.args.parse_or("size", DEFAULT_UPLOAD_SIZE)?;
        info!("http-upload target {} with {} byte payloads", url, size);
        Ok(Box::new(HttpUploadGlobal { url, size }))
    }
}

struct HttpUploadGlobal {
    url: Url,
    size: usize,
}

#[async_trait]
impl GlobalPerfTest for HttpUploadGlobal {
    async fn new_perf_test(
        &self,
        _ctx: &RunContext,
        options: Arc<PerfTestOptions>,
    ) -> Result<Box<dyn PerfTest>, PerfError> {
        let payload = RandomStream::new(self.size)?;
        Ok(Box::new(HttpUploadTest {
            url: self.url.clone(),
            payload,
            options,
        }))
    }
}

struct HttpUploadTest {
    url: Url,
    payload: RandomStream,
    options: Arc<PerfTestOptions>,
}

#[async_trait]
impl PerfTest for HttpUploadTest {
    async fn run(&mut self, _ctx: &RunContext) -> Result<(), PerfError> {
        self.payload.seek(SeekFrom::Start(0))?;
        let body = self.payload.read_remaining();

        let mut request = Request::new(Method::POST, self.url.clone());
        *request.body_mut() = Some(body.into());
        send(self.options.transport(), request).await?;
        Ok(())
    }
}

fn parse_url(raw: &str) -> Result<Url, HttpError> {
    Url::parse(raw).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", raw, e)))
}

/// Send `request`, drain the body, and fail on a non-success status
async fn send(transport: &Transport, request: Request) -> Result<usize, PerfError> {
    let response = transport.execute(request).await?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| HttpError::Body(e.to_string()))?;

    if !status.is_success() {
        return Err(HttpError::UnexpectedStatus(status.as_u16()).into());
    }
    Ok(body.len())
}

#[derive(Debug)]
pub enum HttpError {
    InvalidUrl(String),
    Body(String),
    UnexpectedStatus(u16),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::InvalidUrl(e) => write!(f, "Invalid URL: {}", e),
            HttpError::Body(e) => write!(f, "Error reading response body: {}", e),
            HttpError::UnexpectedStatus(s) => write!(f, "Unexpected status code: {}", s),
        }
    }
}

impl std::error::Error for HttpError {}
