//! Test-proxy control: route requests through a record/playback proxy.
//!
//! Each worker that runs behind a proxy owns one [`RecordingHttpClient`]. The client keeps
//! the current mode and the proxy-assigned recording id, so concurrent workers never share
//! a recording.

mod transport;

pub use transport::Transport;

use reqwest::header::HeaderValue;
use reqwest::{Certificate, Client, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

pub const ID_HEADER: &str = "x-recording-id";
pub const MODE_HEADER: &str = "x-recording-mode";
pub const UPSTREAM_URI_HEADER: &str = "x-recording-upstream-base-uri";
pub const FILE_HEADER: &str = "x-recording-file";

/// Proxy operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    Live,
    Record,
    Playback,
}

impl RecordMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordMode::Live => "live",
            RecordMode::Record => "record",
            RecordMode::Playback => "playback",
        }
    }
}

impl std::fmt::Display for RecordMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordMode {
    type Err = RecordingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(RecordMode::Live),
            "record" => Ok(RecordMode::Record),
            "playback" => Ok(RecordMode::Playback),
            other => Err(RecordingError::InvalidMode(other.to_string())),
        }
    }
}

/// Where the proxy lives and how to trust it
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Default endpoint scheme when no explicit URL is given
    pub use_https: bool,
    /// Explicit proxy endpoint, overriding the localhost defaults
    pub proxy_url: Option<Url>,
    /// PEM certificate to add as a trusted root
    pub cert_path: Option<PathBuf>,
    /// Sent as a JSON body on stop so the proxy stores them with the recording
    pub variables: Map<String, Value>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            use_https: true,
            proxy_url: None,
            cert_path: None,
            variables: Map::new(),
        }
    }
}

impl ProxyOptions {
    pub fn for_url(url: Url) -> Self {
        Self {
            use_https: url.scheme() == "https",
            proxy_url: Some(url),
            cert_path: None,
            variables: Map::new(),
        }
    }

    pub fn with_cert(mut self, cert_path: Option<PathBuf>) -> Self {
        self.cert_path = cert_path;
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn scheme(&self) -> &str {
        match &self.proxy_url {
            Some(url) => url.scheme(),
            None if self.use_https => "https",
            None => "http",
        }
    }

    pub fn host(&self) -> String {
        if let Some(url) = &self.proxy_url {
            if let Some(host) = url.host_str() {
                return match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
            }
        }
        if self.use_https {
            "localhost:5001".to_string()
        } else {
            "localhost:5000".to_string()
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.host())
    }
}

#[derive(Debug)]
struct ProxyState {
    mode: RecordMode,
    recording_id: Option<String>,
    variables: Option<Map<String, Value>>,
}

/// HTTP client that sends traffic through a test proxy when not in live mode
#[derive(Debug)]
pub struct RecordingHttpClient {
    client: Client,
    options: ProxyOptions,
    recording_file: String,
    state: RwLock<ProxyState>,
}

impl RecordingHttpClient {
    /// Build a client that trusts the proxy's certificate.
    ///
    /// `recording_file` names the recording on the proxy side and should be unique per worker.
    pub fn new(
        options: ProxyOptions,
        recording_file: impl Into<String>,
    ) -> Result<Self, RecordingError> {
        let mut client_builder = Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);

        if let Some(path) = &options.cert_path {
            match load_certificate(path) {
                Ok(cert) => client_builder = client_builder.add_root_certificate(cert),
                Err(e) => warn!(
                    "Could not read proxy certificate at {}: {}; using system certs only",
                    path.display(),
                    e
                ),
            }
        }

        let client = client_builder
            .build()
            .map_err(|e| RecordingError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            options,
            recording_file: recording_file.into(),
            state: RwLock::new(ProxyState {
                mode: RecordMode::Live,
                recording_id: None,
                variables: None,
            }),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn mode(&self) -> RecordMode {
        self.state.read().map(|s| s.mode).unwrap_or(RecordMode::Live)
    }

    pub fn recording_id(&self) -> Option<String> {
        self.state.read().ok().and_then(|s| s.recording_id.clone())
    }

    /// Variables the proxy returned from the last start, if it sent any
    pub fn variables(&self) -> Option<Map<String, Value>> {
        self.state.read().ok().and_then(|s| s.variables.clone())
    }

    /// Switch mode by name.
    ///
    /// Unknown names are reported and ignored; the current mode stays in place.
    pub fn set_mode(&self, mode: &str) {
        match RecordMode::from_str(mode) {
            Ok(mode) => self.set_record_mode(mode),
            Err(_) => warn!(
                "{} is not a valid mode, options are live, record, or playback; keeping {}",
                mode,
                self.mode()
            ),
        }
    }

    pub fn set_record_mode(&self, mode: RecordMode) {
        if let Ok(mut state) = self.state.write() {
            state.mode = mode;
        }
    }

    /// Ask the proxy to begin recording or playback in the current mode
    pub async fn start(&self) -> Result<(), RecordingError> {
        let mode = self.mode();
        if mode == RecordMode::Live {
            debug!("Proxy start skipped in live mode");
            return Ok(());
        }

        let url = format!("{}/{}/start", self.options.base_url(), mode);
        let mut request = self
            .client
            .post(&url)
            .header(FILE_HEADER, self.recording_file.as_str());
        if mode == RecordMode::Playback {
            if let Some(id) = self.recording_id() {
                request = request.header(ID_HEADER, id);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| RecordingError::Request(e.to_string()))?;
        let response = check_status("start", response).await?;

        let recording_id = response
            .headers()
            .get(ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let Some(id) = recording_id else {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordingError::MissingRecordingId(body));
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| RecordingError::Request(e.to_string()))?;
        let variables = if body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice::<Map<String, Value>>(&body)
                    .map_err(|e| RecordingError::InvalidVariables(e.to_string()))?,
            )
        };

        debug!("Proxy {} started with recording id {}", mode, id);
        if let Ok(mut state) = self.state.write() {
            state.recording_id = Some(id);
            state.variables = variables;
        }
        Ok(())
    }

    /// Ask the proxy to finish the current recording or playback session
    pub async fn stop(&self) -> Result<(), RecordingError> {
        let mode = self.mode();
        if mode == RecordMode::Live {
            debug!("Proxy stop skipped in live mode");
            return Ok(());
        }

        let id = self.recording_id().ok_or(RecordingError::NotStarted)?;
        let url = format!("{}/{}/stop", self.options.base_url(), mode);
        let mut request = self.client.post(&url).header(ID_HEADER, id);
        if !self.options.variables.is_empty() {
            let body = serde_json::to_vec(&self.options.variables)
                .map_err(|e| RecordingError::InvalidVariables(e.to_string()))?;
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RecordingError::Request(e.to_string()))?;
        check_status("stop", response).await?;
        Ok(())
    }

    /// Point `request` at the proxy and tag it with the recording headers.
    ///
    /// Live mode leaves the request untouched.
    pub fn prepare(&self, request: &mut Request) -> Result<(), RecordingError> {
        let mode = self.mode();
        if mode == RecordMode::Live {
            return Ok(());
        }

        let original = request.url().clone();
        let upstream = match (original.host_str(), original.port()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", original.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", original.scheme(), host),
            (None, _) => return Err(RecordingError::UrlRewrite(original.to_string())),
        };

        let mut proxied = Url::parse(&format!("{}{}", self.options.base_url(), original.path()))
            .map_err(|e| RecordingError::UrlRewrite(e.to_string()))?;
        proxied.set_query(original.query());
        *request.url_mut() = proxied;

        let headers = request.headers_mut();
        headers.insert(UPSTREAM_URI_HEADER, header_value(&upstream)?);
        headers.insert(MODE_HEADER, header_value(mode.as_str())?);
        if let Some(id) = self.recording_id() {
            headers.insert(ID_HEADER, header_value(&id)?);
        }
        Ok(())
    }

    /// Send `request`, through the proxy unless in live mode
    pub async fn execute(&self, mut request: Request) -> Result<Response, RecordingError> {
        self.prepare(&mut request)?;
        self.client
            .execute(request)
            .await
            .map_err(|e| RecordingError::Request(e.to_string()))
    }
}

fn load_certificate(path: &PathBuf) -> Result<Certificate, String> {
    let pem = std::fs::read(path).map_err(|e| e.to_string())?;
    Certificate::from_pem(&pem).map_err(|e| e.to_string())
}

fn header_value(value: &str) -> Result<HeaderValue, RecordingError> {
    HeaderValue::from_str(value).map_err(|_| RecordingError::InvalidHeader(value.to_string()))
}

async fn check_status(action: &'static str, response: Response) -> Result<Response, RecordingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RecordingError::Status {
        action,
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug)]
pub enum RecordingError {
    ClientBuild(String),
    InvalidMode(String),
    Request(String),
    Status {
        action: &'static str,
        status: u16,
        body: String,
    },
    MissingRecordingId(String),
    NotStarted,
    UrlRewrite(String),
    InvalidHeader(String),
    InvalidVariables(String),
}

impl std::fmt::Display for RecordingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingError::ClientBuild(e) => write!(f, "Failed to build proxy client: {}", e),
            RecordingError::InvalidMode(m) => write!(f, "Invalid record mode: {}", m),
            RecordingError::Request(e) => write!(f, "Proxy request error: {}", e),
            RecordingError::Status {
                action,
                status,
                body,
            } => write!(
                f,
                "Proxy did not {} the recording properly (status {}): {}",
                action, status, body
            ),
            RecordingError::MissingRecordingId(body) => write!(
                f,
                "Recording ID was not returned by the response. Response body: {}",
                body
            ),
            RecordingError::NotStarted => {
                write!(f, "Recording ID was never set; start the recording first")
            }
            RecordingError::UrlRewrite(e) => write!(f, "Cannot route request to proxy: {}", e),
            RecordingError::InvalidHeader(v) => write!(f, "Invalid header value: {}", v),
            RecordingError::InvalidVariables(e) => write!(f, "Invalid recording variables: {}", e),
        }
    }
}

impl std::error::Error for RecordingError {}
