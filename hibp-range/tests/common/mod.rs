//! In-process stand-in for the range API.
#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use hibp_range::{Backoff, ClientConfig, RangeClient};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct MockApi {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    paths: Arc<std::sync::Mutex<Vec<String>>>,
    server: JoinHandle<()>,
}

impl MockApi {
    /// Serves `handler(path, request_number)` on an ephemeral port.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, usize) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handler = Arc::new(handler);
        let requests = Arc::new(AtomicUsize::new(0));
        let paths = Arc::new(std::sync::Mutex::new(Vec::new()));

        let server = tokio::spawn({
            let requests = Arc::clone(&requests);
            let paths = Arc::clone(&paths);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = Arc::clone(&handler);
                    let requests = Arc::clone(&requests);
                    let paths = Arc::clone(&paths);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let path = req.uri().path().to_owned();
                            let n = requests.fetch_add(1, Ordering::SeqCst);
                            paths.lock().unwrap().push(path.clone());
                            let (status, body) = (*handler)(&path, n);
                            async move {
                                Ok::<_, Infallible>(
                                    Response::builder()
                                        .status(status)
                                        .body(Full::new(Bytes::from(body)))
                                        .unwrap(),
                                )
                            }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        });

        Self { base_url, requests, paths, server }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requested(&self, path: &str) -> usize {
        self.paths.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    /// A client pointed at this server with a short retry budget.
    pub fn client(&self) -> RangeClient {
        let config = ClientConfig {
            retry: Backoff {
                initial_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                max_elapsed: Duration::from_millis(200),
            },
            ..ClientConfig::with_base_url(&self.base_url)
        };
        RangeClient::new(config).unwrap()
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Uppercase hex SHA-1 of `data`.
pub fn sha1sum(data: &str) -> String {
    hibp_dump::HashDigest::of_password(data).to_string()
}
