//! Web exchanges driven through `Proxy::handle_web`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Empty, Full};

use hop_relay::http::{ClientConnection, InboundRequest, Outcome, Proxy, ResponseSink};
use hop_relay::ErrorCallback;

mod common;

fn get(path: &str, headers: &[(&'static str, &'static str)]) -> InboundRequest<Empty<Bytes>> {
    InboundRequest::new(common::request_head(Method::GET, path, headers), Empty::new())
}

#[tokio::test]
async fn test_get_is_relayed() {
    let (backend, mut seen) =
        common::capture_backend("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let proxy = Arc::new(Proxy::new(common::options_for(backend)));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move {
            proxy
                .handle_web(get("/foo", &[("host", "example.com")]), sink, None)
                .await
        }
    });

    let response = pending.recv().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"ok"));
    assert_eq!(exchange.await.unwrap().unwrap(), Outcome::Completed);
    assert_eq!(proxy.pools().leased(), 0);
    assert!(proxy.pools().idle() > 0);

    let request = seen.recv().await.unwrap();
    assert!(request.starts_with("GET /foo HTTP/1.1\r\n"), "{request}");
    assert!(request.contains("host: example.com\r\n"), "{request}");
}

#[tokio::test]
async fn test_forwarding_headers_reach_upstream() {
    let (backend, mut seen) =
        common::capture_backend("HTTP/1.1 204 No Content\r\n\r\n").await;
    let proxy = Proxy::new(common::options_for(backend).proxy_name("p1"));

    let request = get(
        "/",
        &[
            ("host", "example.com"),
            ("forwarded", "for=10.0.0.1"),
            ("via", "1.0 edge"),
            ("connection", "keep-alive, x-secret"),
            ("keep-alive", "timeout=5"),
            ("x-secret", "hop"),
            ("x-custom", "a"),
        ],
    );
    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(request, sink, None).await });

    assert_eq!(pending.recv().await.unwrap().status(), StatusCode::NO_CONTENT);
    assert_eq!(exchange.await.unwrap().unwrap(), Outcome::Completed);

    let request = seen.recv().await.unwrap();
    assert!(
        request.contains(
            "forwarded: by=127.0.0.1; for=127.0.0.2; for=10.0.0.1; host=example.com; proto=http\r\n"
        ),
        "{request}"
    );
    assert!(request.contains("via: 1.0 edge,p1\r\n"), "{request}");
    assert!(request.contains("x-custom: a\r\n"), "{request}");
    assert!(!request.contains("keep-alive"), "{request}");
    assert!(!request.contains("x-secret"), "{request}");
}

#[tokio::test]
async fn test_host_defaults_to_upstream() {
    let (backend, mut seen) =
        common::capture_backend("HTTP/1.1 204 No Content\r\n\r\n").await;
    let proxy = Proxy::new(common::options_for(backend));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    assert_eq!(pending.recv().await.unwrap().status(), StatusCode::NO_CONTENT);
    exchange.await.unwrap().unwrap();

    let request = seen.recv().await.unwrap();
    let expected = format!("host: 127.0.0.1:{}\r\n", backend.port());
    assert!(request.contains(&expected), "{request}");
}

#[tokio::test]
async fn test_request_body_is_streamed() {
    let (backend, mut seen) =
        common::capture_backend("HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;
    let proxy = Proxy::new(common::options_for(backend));

    let head = common::request_head(
        Method::POST,
        "/items",
        &[("host", "example.com"), ("content-length", "7")],
    );
    let request = InboundRequest::new(head, Full::new(Bytes::from_static(b"payload")));
    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(request, sink, None).await });

    assert_eq!(pending.recv().await.unwrap().status(), StatusCode::CREATED);
    exchange.await.unwrap().unwrap();

    let request = seen.recv().await.unwrap();
    assert!(request.starts_with("POST /items HTTP/1.1\r\n"));
    assert!(request.ends_with("\r\n\r\npayload"), "{request}");
}

#[tokio::test]
async fn test_refused_upstream_answers_503() {
    let proxy = Arc::new(Proxy::new(common::options_for(common::closed_port().await)));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.handle_web(get("/", &[]), sink, None).await }
    });

    let response = pending.recv().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["connection"], "close");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());

    let err = exchange.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(err.code(), Some(hop_relay::ErrorCode::ConnRefused));
    assert_eq!(proxy.pools().leased(), 0);
}

#[tokio::test]
async fn test_callback_fires_once() {
    let proxy = Proxy::new(common::options_for(common::closed_port().await));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let callback: ErrorCallback = Box::new(move |err, head, client| {
        seen.fetch_add(1, Ordering::SeqCst);
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(head.path(), "/cb");
        assert!(client.headers_sent());
    });

    let (sink, pending) = ResponseSink::channel();
    let exchange =
        tokio::spawn(async move { proxy.handle_web(get("/cb", &[]), sink, Some(callback)).await });

    assert_eq!(
        pending.recv().await.unwrap().status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(exchange.await.unwrap().unwrap(), Outcome::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_via_loop_answers_508() {
    let (backend, mut seen) =
        common::capture_backend("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let proxy = Proxy::new(common::options_for(backend).proxy_name("p1"));

    let (sink, pending) = ResponseSink::channel();
    let request = get("/", &[("via", "1.1 edge, 1.1 P1")]);
    let exchange = tokio::spawn(async move { proxy.handle_web(request, sink, None).await });

    assert_eq!(
        pending.recv().await.unwrap().status(),
        StatusCode::LOOP_DETECTED
    );
    let err = exchange.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::LOOP_DETECTED));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.try_recv().is_err(), "upstream must not be contacted");
}

#[tokio::test]
async fn test_upstream_idle_answers_504() {
    let options = common::options_for(common::silent_backend().await)
        .proxy_timeout(Duration::from_millis(100));
    let proxy = Proxy::new(options);

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    assert_eq!(
        pending.recv().await.unwrap().status(),
        StatusCode::GATEWAY_TIMEOUT
    );
    let err = exchange.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::GATEWAY_TIMEOUT));
}

#[tokio::test]
async fn test_client_idle_answers_408() {
    let options =
        common::options_for(common::silent_backend().await).timeout(Duration::from_millis(100));
    let proxy = Proxy::new(options);

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    assert_eq!(
        pending.recv().await.unwrap().status(),
        StatusCode::REQUEST_TIMEOUT
    );
    let err = exchange.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::REQUEST_TIMEOUT));
}

#[tokio::test]
async fn test_client_hangup_ends_exchange() {
    let proxy = Arc::new(Proxy::new(common::options_for(
        common::silent_backend().await,
    )));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.handle_web(get("/", &[]), sink, None).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(pending);

    let outcome = tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .expect("exchange should end after hang-up")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Outcome::ClientClosed);
    assert_eq!(proxy.pools().leased(), 0);
}

#[tokio::test]
async fn test_upstream_trailers_reach_client() {
    let (backend, _seen) = common::capture_backend(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: x-sum\r\n\r\n\
         3\r\nabc\r\n0\r\nx-sum: abc\r\n\r\n",
    )
    .await;
    let proxy = Proxy::new(common::options_for(backend));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    let response = pending.recv().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("trailers relayed");
    assert_eq!(trailers["x-sum"], "abc");
    assert_eq!(collected.to_bytes(), Bytes::from_static(b"abc"));
    assert_eq!(exchange.await.unwrap().unwrap(), Outcome::Completed);
}

#[tokio::test]
async fn test_truncated_body_destroys_response() {
    let (backend, _seen) =
        common::capture_backend("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
    let proxy = Proxy::new(common::options_for(backend));

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    let response = pending.recv().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.into_body().collect().await.is_err());

    let err = exchange.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
}

#[tokio::test]
async fn test_response_hook_edits_headers() {
    let (backend, _seen) = common::capture_backend(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nKeep-Alive: timeout=5\r\n\r\n",
    )
    .await;
    let options = common::options_for(backend).on_res(|_, client| {
        if let Some(writer) = client.writer() {
            writer
                .headers_mut()
                .insert("x-proxied", HeaderValue::from_static("1"));
        }
    });
    let proxy = Proxy::new(options);

    let (sink, pending) = ResponseSink::channel();
    let exchange = tokio::spawn(async move { proxy.handle_web(get("/", &[]), sink, None).await });

    let response = pending.recv().await.unwrap();
    assert_eq!(response.headers()["x-proxied"], "1");
    assert!(!response.headers().contains_key("keep-alive"));
    exchange.await.unwrap().unwrap();
}
