//! HTTP transport seam. The executor hands a fully resolved
//! [`PreparedRequest`] to a [`Transport`] and gets an [`HttpResponse`]
//! back; [`ReqwestTransport`] is the production implementation.

use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::TransportError;
use crate::model::HttpMethod;

/// Request with every template resolved.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Query parameters; list values are already expanded to repeats.
    pub params: Vec<(String, String)>,
    pub body: Option<PreparedBody>,
    pub timeout: Duration,
    pub allow_redirects: bool,
    pub tls: TlsSettings,
    pub credentials: Option<Credentials>,
}

impl PreparedRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            params: Vec::new(),
            body: None,
            timeout: Duration::from_secs(30),
            allow_redirects: true,
            tls: TlsSettings::default(),
            credentials: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Insert a header unless one with the same name is present.
    pub fn set_default_header(&mut self, name: &str, value: &str) {
        if self.header(name).is_none() {
            self.headers.insert(name.to_string(), value.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreparedBody {
    Json(Value),
    Xml(String),
    Form(Vec<(String, String)>),
    Raw(String),
    /// Multipart field name -> file on disk.
    Files(BTreeMap<String, PathBuf>),
}

impl PreparedBody {
    /// Textual rendering used in stage diagnostics.
    pub fn describe(&self) -> String {
        match self {
            PreparedBody::Json(value) => value.to_string(),
            PreparedBody::Xml(text) | PreparedBody::Raw(text) => text.clone(),
            PreparedBody::Form(pairs) => pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&"),
            PreparedBody::Files(files) => files
                .iter()
                .map(|(field, path)| format!("{field}=@{}", path.display()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Effective TLS settings of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsSettings {
    pub verify: bool,
    pub ca_bundle: Option<PathBuf>,
    pub client_cert: Option<ClientIdentity>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify: true,
            ca_bundle: None,
            client_cert: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// One PEM file with certificate and private key.
    Pem(PathBuf),
    Pair { cert: PathBuf, key: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Response as seen by the extractor and verifier.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parsed JSON body, if the body is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Headers folded into a map with lower-cased names.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()
    }
}

/// Sends one prepared request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &PreparedRequest,
    ) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    allow_redirects: bool,
    tls: TlsSettings,
}

/// [`Transport`] backed by `reqwest`, keeping one client per redirect
/// policy and TLS configuration so connections are pooled per session.
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client_for(
        &self,
        request: &PreparedRequest,
    ) -> Result<Client, TransportError> {
        let key = ClientKey {
            allow_redirects: request.allow_redirects,
            tls: request.tls.clone(),
        };
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(&key).await?;
        debug!(?key, "Built HTTP client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

async fn build_client(key: &ClientKey) -> Result<Client, TransportError> {
    let redirect = if key.allow_redirects {
        reqwest::redirect::Policy::default()
    } else {
        reqwest::redirect::Policy::none()
    };
    let mut builder = Client::builder().redirect(redirect);

    if !key.tls.verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(path) = &key.tls.ca_bundle {
        let pem = read_tls_file(path).await?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some(identity) = &key.tls.client_cert {
        let pem = match identity {
            ClientIdentity::Pem(path) => read_tls_file(path).await?,
            ClientIdentity::Pair { cert, key } => {
                let mut pem = read_tls_file(cert).await?;
                pem.push(b'\n');
                pem.extend(read_tls_file(key).await?);
                pem
            }
        };
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))
}

async fn read_tls_file(path: &PathBuf) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path).await.map_err(|e| {
        TransportError::Tls(format!("cannot read {}: {e}", path.display()))
    })
}

fn convert_method(method: HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

async fn multipart_form(
    files: &BTreeMap<String, PathBuf>,
) -> Result<reqwest::multipart::Form, TransportError> {
    let mut form = reqwest::multipart::Form::new();
    for (field, path) in files {
        let bytes = tokio::fs::read(path).await.map_err(|source| {
            TransportError::UploadFile {
                path: path.clone(),
                source,
            }
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| field.clone());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        form = form.part(field.clone(), part);
    }
    Ok(form)
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    async fn send(
        &self,
        request: &PreparedRequest,
    ) -> Result<HttpResponse, TransportError> {
        let client = self.client_for(request).await?;

        let mut req_builder = client
            .request(convert_method(request.method), &request.url)
            .timeout(request.timeout);

        for (name, value) in &request.headers {
            req_builder = req_builder.header(name, value);
        }

        if !request.params.is_empty() {
            req_builder = req_builder.query(&request.params);
        }

        match &request.credentials {
            Some(Credentials::Basic { username, password }) => {
                req_builder = req_builder.basic_auth(username, Some(password));
            }
            Some(Credentials::Bearer(token)) => {
                req_builder = req_builder.bearer_auth(token);
            }
            None => {}
        }

        match &request.body {
            Some(PreparedBody::Json(value)) => {
                req_builder = req_builder.json(value);
            }
            Some(PreparedBody::Xml(text)) => {
                if request.header("content-type").is_none() {
                    req_builder =
                        req_builder.header("Content-Type", "application/xml");
                }
                req_builder = req_builder.body(text.clone());
            }
            Some(PreparedBody::Form(pairs)) => {
                req_builder = req_builder.form(pairs);
            }
            Some(PreparedBody::Raw(text)) => {
                req_builder = req_builder.body(text.clone());
            }
            Some(PreparedBody::Files(files)) => {
                req_builder = req_builder.multipart(multipart_form(files).await?);
            }
            None => {}
        }

        debug!("Sending request to {}", request.url);
        let started = Instant::now();
        let response = req_builder
            .send()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, request.timeout))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }
}
