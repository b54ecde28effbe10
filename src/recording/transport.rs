use super::{RecordingError, RecordingHttpClient};
use reqwest::{Client, Request, Response};
use std::sync::Arc;

/// How a worker sends its requests
#[derive(Debug, Clone)]
pub enum Transport {
    /// Straight to the service; shared by every worker
    Direct(Client),
    /// Through a test proxy; one client per worker
    Recording(Arc<RecordingHttpClient>),
}

impl Transport {
    /// Client used to build requests
    pub fn client(&self) -> &Client {
        match self {
            Transport::Direct(client) => client,
            Transport::Recording(recording) => recording.client(),
        }
    }

    pub fn recording(&self) -> Option<&Arc<RecordingHttpClient>> {
        match self {
            Transport::Direct(_) => None,
            Transport::Recording(recording) => Some(recording),
        }
    }

    pub fn is_proxied(&self) -> bool {
        self.recording().is_some()
    }

    pub async fn execute(&self, request: Request) -> Result<Response, RecordingError> {
        match self {
            Transport::Direct(client) => client
                .execute(request)
                .await
                .map_err(|e| RecordingError::Request(e.to_string())),
            Transport::Recording(recording) => recording.execute(request).await,
        }
    }
}
