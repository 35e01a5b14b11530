use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use discord_dispatch::{BoxError, HttpRequest, HttpResponse};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::time::Instant;
use tower::Service;

/// What the transport saw for one attempt.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub json: Option<serde_json::Value>,
    pub files: Vec<Vec<u8>>,
    pub at: Instant,
}

/// Transport that replays canned responses in order, then repeats `fallback` if one is set.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<HttpResponse>>>,
    fallback: Option<HttpResponse>,
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = HttpResponse>) -> Self {
        Self { script: Arc::new(Mutex::new(responses.into_iter().collect())), ..Self::default() }
    }

    pub fn repeating(response: HttpResponse) -> Self {
        Self { fallback: Some(response), ..Self::default() }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl Service<HttpRequest> for ScriptedTransport {
    type Response = HttpResponse;
    type Error = BoxError;
    type Future = futures::future::Ready<Result<HttpResponse, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HttpRequest) -> Self::Future {
        let files = req
            .attachments
            .iter()
            .map(|file| file.read_remaining().unwrap())
            .collect();
        self.seen.lock().unwrap().push(Recorded {
            method: req.method,
            uri: req.uri,
            headers: req.headers,
            json: req.json,
            files,
            at: Instant::now(),
        });

        let next = self.script.lock().unwrap().pop_front().or_else(|| self.fallback.clone());
        futures::future::ready(next.ok_or_else(|| "script exhausted".into()))
    }
}

pub fn json(status: u16, body: serde_json::Value) -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::from_u16(status).unwrap());
    response.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.body = serde_json::to_vec(&body).unwrap();
    response
}

pub fn empty(status: u16) -> HttpResponse {
    HttpResponse::new(StatusCode::from_u16(status).unwrap())
}

pub fn with_headers(mut response: HttpResponse, pairs: &[(&str, &str)]) -> HttpResponse {
    for (name, value) in pairs {
        response.headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    response
}
