//! Wire-level request/response types exchanged with an HTTP transport.
//!
//! A transport is any `tower_service::Service<HttpRequest, Response = HttpResponse>`. The
//! dispatcher never talks to the network itself; tests drive it with scripted services and the
//! `reqwest` feature provides [`ReqwestTransport`].

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use http::{HeaderMap, Method, StatusCode};

/// Boxed error returned by transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Readable and seekable source for a file attachment.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A file uploaded with a request.
///
/// The reader is shared so every retry can rewind and resend the same content.
#[derive(Clone)]
pub struct Attachment {
    filename: String,
    reader: Arc<Mutex<Box<dyn ReadSeek>>>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("reader", &"<reader>")
            .finish()
    }
}

impl Attachment {
    pub fn new<R: ReadSeek + 'static>(filename: impl Into<String>, reader: R) -> Self {
        Self { filename: filename.into(), reader: Arc::new(Mutex::new(Box::new(reader))) }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Seek back to the first byte.
    pub fn rewind(&self) -> io::Result<()> {
        let mut reader = self.reader.lock().expect("attachment reader poisoned");
        reader.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Read from the current position to the end.
    pub fn read_remaining(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().expect("attachment reader poisoned");
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// One attempt as handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub json: Option<serde_json::Value>,
    pub attachments: Vec<Attachment>,
}

/// Raw response returned by the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new(), body: Vec::new() }
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::{BoxError, HttpRequest, HttpResponse};
    use futures::future::BoxFuture;
    use std::task::{Context, Poll};
    use tower_service::Service;

    /// Transport backed by a shared `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl Service<HttpRequest> for ReqwestTransport {
        type Response = HttpResponse;
        type Error = BoxError;
        type Future = BoxFuture<'static, Result<HttpResponse, BoxError>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: HttpRequest) -> Self::Future {
            let client = self.client.clone();
            Box::pin(async move {
                let mut builder = client.request(req.method, &req.uri).headers(req.headers);
                if req.attachments.is_empty() {
                    if let Some(json) = req.json {
                        builder = builder.json(&json);
                    }
                } else {
                    let mut form = reqwest::multipart::Form::new();
                    if let Some(json) = req.json {
                        form = form.text("payload_json", serde_json::to_string(&json)?);
                    }
                    for (i, attachment) in req.attachments.iter().enumerate() {
                        let part = reqwest::multipart::Part::bytes(attachment.read_remaining()?)
                            .file_name(attachment.filename().to_string());
                        form = form.part(format!("file{i}"), part);
                    }
                    builder = builder.multipart(form);
                }

                let response = builder.send().await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await?.to_vec();
                Ok(HttpResponse { status, headers, body })
            })
        }
    }
}
