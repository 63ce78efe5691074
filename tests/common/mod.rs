#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxy_client::{ProxyClient, ProxyClientConfig, SendAction};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Accept connections forever, handing each one to `handler` on its own task.
pub async fn spawn_proxy<F, Fut>(handler: F) -> (u16, JoinHandle<()>)
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    let task = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler(socket).await });
        }
    });
    (port, task)
}

/// Proxy that records each request and answers with a fixed response.
pub async fn canned_proxy(response: &'static [u8]) -> (u16, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (port, _) = spawn_proxy(move |mut socket| {
        let sink = Arc::clone(&sink);
        async move {
            let request = read_request(&mut socket).await;
            sink.lock().unwrap().push(request);
            socket.write_all(response).await.unwrap();
            let _ = socket.shutdown().await;
        }
    })
    .await;
    (port, seen)
}

/// Read one request head plus its `Content-Length` body.
pub async fn read_request<S: AsyncRead + Unpin>(socket: &mut S) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if let Some(end) = find(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return String::from_utf8_lossy(&data[..end + 4 + length]).to_string();
            }
        }
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return String::from_utf8_lossy(&data).to_string();
        }
        data.extend_from_slice(&buf[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn client(port: u16) -> ProxyClient {
    client_with(ProxyClientConfig::new("127.0.0.1", port))
}

pub fn client_with(config: ProxyClientConfig) -> ProxyClient {
    ProxyClient::new(config).unwrap()
}

pub fn with_timeout(port: u16, timeout: Duration) -> ProxyClient {
    client_with(ProxyClientConfig::new("127.0.0.1", port).with_timeout(timeout))
}

/// Records every callback fired by the actions it is attached to.
#[derive(Clone, Default)]
pub struct Outcomes {
    successes: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl Outcomes {
    pub fn attach<A>(&self, action: &mut SendAction<A>) {
        let successes = Arc::clone(&self.successes);
        let errors = Arc::clone(&self.errors);
        action
            .on_success(move || {
                successes.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |message| errors.lock().unwrap().push(message));
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.successes() + self.errors.lock().unwrap().len()
    }
}
