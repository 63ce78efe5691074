mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{canned_proxy, client, client_with, read_request, spawn_proxy, with_timeout, Outcomes};
use proxy_client::stats::ClientStats;
use proxy_client::transport::{Connection, ProxyEndpoint};
use proxy_client::{
    ProxyClient, ProxyClientConfig, ProxyConnector, ProxyError, ProxyMode, RequestForm,
    SendAction, Stage, Templatable,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[tokio::test]
async fn forward_request_succeeds_with_credentials() {
    let (port, seen) =
        canned_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let client = client_with(
        ProxyClientConfig::new("127.0.0.1", port).with_credentials("u", "p"),
    );

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action
        .set_url("http://example.com/hello")
        .add_header("X-A", "1")
        .add_header("X-B", "2");
    outcomes.attach(&mut action);

    let response = action.execute(()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"hello");
    assert_eq!(outcomes.successes(), 1);
    assert!(outcomes.errors().is_empty());

    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.starts_with("GET http://example.com/hello HTTP/1.1\r\n"));
    assert!(request.contains("\r\nHost: example.com\r\n"));
    assert!(request.contains("\r\nProxy-Authorization: Basic dTpw\r\n"));
    let a = request.find("X-A: 1").unwrap();
    let b = request.find("X-B: 2").unwrap();
    assert!(a < b);
}

#[tokio::test]
async fn post_body_is_framed_with_content_length() {
    let (port, seen) =
        canned_proxy(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;
    let client = client(port);

    let mut action: SendAction<()> = SendAction::new(&client);
    action
        .set_url("http://example.com/events")
        .set_method("POST")
        .set_body("{\"state\":\"on\"}");

    let response = action.execute(()).await.unwrap();
    assert_eq!(response.status(), 201);

    let request = seen.lock().unwrap()[0].clone();
    assert!(request.starts_with("POST http://example.com/events HTTP/1.1\r\n"));
    assert!(request.contains("\r\nContent-Length: 14\r\n"));
    assert!(request.ends_with("\r\n\r\n{\"state\":\"on\"}"));
    assert!(!request.contains("Proxy-Authorization"));
}

#[tokio::test]
async fn error_status_still_routes_to_on_success() {
    let (port, _) = canned_proxy(
        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy",
    )
    .await;
    let client = client(port);

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let response = action.execute(()).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(outcomes.successes(), 1);
    assert!(outcomes.errors().is_empty());
}

#[tokio::test]
async fn truncated_body_routes_to_on_error() {
    let (port, _) =
        canned_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel").await;
    let client = client(port);

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let err = action.execute(()).await.unwrap_err();
    assert!(matches!(err, ProxyError::Parse(_)));
    assert_eq!(outcomes.successes(), 0);
    let errors = outcomes.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("malformed response"), "{}", errors[0]);
}

#[tokio::test]
async fn chunked_response_body() {
    let (port, _) = canned_proxy(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await;
    let client = client(port);

    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    let response = action.execute(()).await.unwrap();
    assert_eq!(response.body(), b"abc");
}

#[tokio::test]
async fn body_without_framing_reads_until_close() {
    let (port, _) = canned_proxy(b"HTTP/1.0 200 OK\r\n\r\nall of it").await;
    let client = client(port);

    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    let response = action.execute(()).await.unwrap();
    assert_eq!(response.body_text(), "all of it");
}

#[tokio::test]
async fn response_split_across_writes() {
    let (port, _) = spawn_proxy(|mut socket| async move {
        read_request(&mut socket).await;
        for part in [
            &b"HTTP/1.1 200 OK\r\nContent-"[..],
            b"Length: 11\r\n\r\nhello",
            b" world",
        ] {
            socket.write_all(part).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    let client = client(port);

    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    let response = action.execute(()).await.unwrap();
    assert_eq!(response.body_text(), "hello world");
}

#[tokio::test]
async fn silent_proxy_times_out_and_socket_is_closed() {
    let (closed_tx, closed_rx) = oneshot::channel::<bool>();
    let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));
    let (port, _) = spawn_proxy(move |mut socket| {
        let closed_tx = Arc::clone(&closed_tx);
        async move {
            read_request(&mut socket).await;
            let mut buf = [0u8; 16];
            let eof = matches!(
                tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await,
                Ok(Ok(0)) | Ok(Err(_))
            );
            if let Some(tx) = closed_tx.lock().unwrap().take() {
                let _ = tx.send(eof);
            }
        }
    })
    .await;
    let client = with_timeout(port, Duration::from_millis(300));

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/slow");
    outcomes.attach(&mut action);

    let started = Instant::now();
    let err = action.execute(()).await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout(Stage::Response)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcomes.errors(), vec!["response timeout".to_string()]);
    assert_eq!(outcomes.successes(), 0);

    let eof = tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("proxy never saw the socket close")
        .unwrap();
    assert!(eof);
    let stats = client.stats();
    assert_eq!(stats.connections_opened, stats.connections_closed);
}

#[tokio::test]
async fn slow_trickle_cannot_outlive_the_deadline() {
    let (port, _) = spawn_proxy(|mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .await;
        for _ in 0..100 {
            if socket.write_all(b"x").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    let client = with_timeout(port, Duration::from_millis(300));

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let started = Instant::now();
    let err = action.execute(()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcomes.total(), 1);
    assert_eq!(outcomes.successes(), 0);
}

#[tokio::test]
async fn unreachable_proxy_reports_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = with_timeout(port, Duration::from_secs(2));
    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let started = Instant::now();
    action.dispatch(()).await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(3));

    let errors = outcomes.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("connect"), "{}", errors[0]);
    assert_eq!(outcomes.successes(), 0);
}

#[tokio::test]
async fn concurrent_dispatches_do_not_cross_talk() {
    let (port, _) = spawn_proxy(|mut socket| async move {
        let request = read_request(&mut socket).await;
        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string();
        let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
        let index: u64 = path.rsplit('/').next().and_then(|i| i.parse().ok()).unwrap_or(0);
        let reply = format!("{path}|{body}");
        // Lower indices answer last.
        tokio::time::sleep(Duration::from_millis(10 * (20 - index.min(20)))).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{reply}",
            reply.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    })
    .await;
    let client = client(port);

    let outcomes = Outcomes::default();
    let mut action: SendAction<usize> = SendAction::new(&client);
    action
        .set_url(Templatable::from_fn(|i: &usize| {
            Ok(format!("http://example.com/item/{i}"))
        }))
        .set_method("PUT")
        .set_body(Templatable::from_fn(|i: &usize| Ok(format!("value-{i}"))));
    outcomes.attach(&mut action);

    const N: usize = 12;
    let tasks: Vec<_> = (0..N)
        .map(|i| {
            let action = action.clone();
            tokio::spawn(async move { (i, action.execute(i).await) })
        })
        .collect();

    for task in tasks {
        let (i, outcome) = task.await.unwrap();
        let response = outcome.unwrap();
        assert_eq!(
            response.body_text(),
            format!("http://example.com/item/{i}|value-{i}")
        );
    }
    assert_eq!(outcomes.successes(), N);
    assert!(outcomes.errors().is_empty());

    let stats = client.stats();
    assert_eq!(stats.requests_dispatched, N as u64);
    assert_eq!(stats.requests_succeeded, N as u64);
    assert_eq!(stats.connections_opened, N as u64);
    assert_eq!(stats.connections_closed, N as u64);
    assert_eq!(stats.active_requests, 0);
}

#[tokio::test]
async fn each_dispatch_fires_exactly_one_callback() {
    let (port, _) =
        canned_proxy(b"HTTP/1.1 204 No Content\r\n\r\n").await;
    let client = client(port);

    let outcomes = Outcomes::default();
    let mut action: SendAction<bool> = SendAction::new(&client);
    action.set_url(Templatable::from_fn(|good: &bool| {
        Ok(if *good {
            "http://example.com/".to_string()
        } else {
            "example.com-without-scheme".to_string()
        })
    }));
    outcomes.attach(&mut action);

    let handles: Vec<_> = [true, false, true, false, true]
        .into_iter()
        .map(|good| action.dispatch(good))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(outcomes.successes(), 3);
    assert_eq!(outcomes.errors().len(), 2);
    assert!(outcomes
        .errors()
        .iter()
        .all(|e| e.starts_with("configuration error")));
}

#[tokio::test]
async fn tunnel_mode_sends_connect_then_origin_form() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (port, _) = spawn_proxy(move |mut socket| {
        let sink = Arc::clone(&sink);
        async move {
            let connect = read_request(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let inner = read_request(&mut socket).await;
            sink.lock().unwrap().extend([connect, inner]);
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        }
    })
    .await;
    let client = client_with(
        ProxyClientConfig::new("127.0.0.1", port)
            .with_credentials("u", "p")
            .with_mode(ProxyMode::Tunnel),
    );

    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com:8080/status?verbose=1");
    let response = action.execute(()).await.unwrap();
    assert_eq!(response.body(), b"ok");

    let seen = seen.lock().unwrap().clone();
    assert!(seen[0].starts_with("CONNECT example.com:8080 HTTP/1.1\r\n"));
    assert!(seen[0].contains("Proxy-Authorization: Basic dTpw"));
    assert!(seen[1].starts_with("GET /status?verbose=1 HTTP/1.1\r\n"));
    assert!(seen[1].contains("\r\nHost: example.com:8080\r\n"));
    assert!(!seen[1].contains("Proxy-Authorization"));
}

#[tokio::test]
async fn rejected_tunnel_routes_to_on_error() {
    let (port, _) = canned_proxy(
        b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let client = client_with(
        ProxyClientConfig::new("127.0.0.1", port).with_mode(ProxyMode::Tunnel),
    );

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let err = action.execute(()).await.unwrap_err();
    assert!(matches!(err, ProxyError::Tunnel(_)));
    assert_eq!(
        outcomes.errors(),
        vec!["proxy tunnel rejected: HTTP/1.1 407 Proxy Authentication Required".to_string()]
    );
}

#[tokio::test]
async fn head_request_ignores_content_length() {
    let (port, _) =
        canned_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 1024\r\n\r\n").await;
    let client = client(port);

    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/").set_method("HEAD");
    let response = action.execute(()).await.unwrap();
    assert_eq!(response.header("content-length"), Some("1024"));
    assert!(response.body().is_empty());
}

#[tokio::test]
async fn direct_send_without_callbacks() {
    let (port, _) = canned_proxy(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let client = client(port);

    let request = proxy_client::HttpRequest::new("GET", "http://example.com/")
        .unwrap()
        .header("Accept", "text/plain");
    let response = client.send(&request).await.unwrap();
    assert_eq!(response.body_text(), "hi");
}

/// Connector whose connection attempt never completes.
struct Blackhole;

#[async_trait::async_trait]
impl ProxyConnector for Blackhole {
    fn form(&self) -> RequestForm {
        RequestForm::Absolute
    }

    async fn connect(
        &self,
        _endpoint: &ProxyEndpoint,
        _deadline: Instant,
        _stats: Arc<ClientStats>,
    ) -> Result<Connection, ProxyError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_connect_times_out() {
    let client = ProxyClient::builder(
        ProxyClientConfig::new("127.0.0.1", 3128).with_timeout(Duration::from_millis(200)),
    )
    .connector(Arc::new(Blackhole))
    .build()
    .unwrap();

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let started = Instant::now();
    let err = action.execute(()).await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout(Stage::Connect)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcomes.errors(), vec!["connect timeout".to_string()]);
    assert_eq!(client.stats().requests_failed, 1);
}

#[tokio::test]
async fn aborted_dispatch_reports_abandonment() {
    let (seen_tx, seen_rx) = oneshot::channel::<()>();
    let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
    let (port, _) = spawn_proxy(move |mut socket| {
        let seen_tx = Arc::clone(&seen_tx);
        async move {
            read_request(&mut socket).await;
            if let Some(tx) = seen_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let mut buf = [0u8; 16];
            let _ = socket.read(&mut buf).await;
        }
    })
    .await;
    let client = with_timeout(port, Duration::from_secs(10));

    let outcomes = Outcomes::default();
    let mut action: SendAction<()> = SendAction::new(&client);
    action.set_url("http://example.com/");
    outcomes.attach(&mut action);

    let task = action.dispatch(());
    seen_rx.await.unwrap();
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(outcomes.errors(), vec!["request abandoned".to_string()]);
    assert_eq!(outcomes.successes(), 0);
    let stats = client.stats();
    assert_eq!(stats.active_requests, 0);
    assert_eq!(stats.requests_dispatched, 1);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.connections_opened, stats.connections_closed);
}
