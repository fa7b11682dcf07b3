mod support;

use support::server;

fn url(addr: std::net::SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

#[tokio::test]
async fn sequential_calls_reuse_one_connection() {
    let server = server::scripted(vec![vec![
        server::ok_response("a"),
        server::ok_response("b"),
        server::ok_response("c"),
    ]]);

    let client = squall::Client::new();
    for (path, expected) in [("/a", "a"), ("/b", "b"), ("/c", "c")] {
        let response = client
            .execute(squall::Request::get(url(server.addr(), path)).build().unwrap())
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), expected);
    }

    // Requests arrived in order, on a single TCP connection.
    assert_eq!(server.take_request_target(), "/a");
    assert_eq!(server.take_request_target(), "/b");
    assert_eq!(server.take_request_target(), "/c");
    assert_eq!(server.connections_opened(), 1);
    assert_eq!(client.idle_connection_count(), 1);
}

#[tokio::test]
async fn unconsumed_body_discards_the_connection() {
    let server = server::scripted(vec![
        vec![server::ok_response("a long enough body")],
        vec![server::ok_response("second")],
    ]);

    let client = squall::Client::new();
    let response = client
        .execute(squall::Request::get(url(server.addr(), "/1")).build().unwrap())
        .await
        .unwrap();
    // Dropping the response without reading the body poisons the
    // connection; it must not be pooled for reuse.
    drop(response);

    let response = client
        .execute(squall::Request::get(url(server.addr(), "/2")).build().unwrap())
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "second");
    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn connection_close_header_prevents_reuse() {
    let server = server::scripted(vec![
        vec![server::response("200 OK", &[("Connection", "close")], "one")],
        vec![server::ok_response("two")],
    ]);

    let client = squall::Client::new();
    let response = client
        .execute(squall::Request::get(url(server.addr(), "/1")).build().unwrap())
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "one");
    assert_eq!(client.idle_connection_count(), 0);

    let response = client
        .execute(squall::Request::get(url(server.addr(), "/2")).build().unwrap())
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "two");
    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn concurrent_http1_calls_use_separate_connections() {
    let server = server::scripted(vec![
        vec![server::ok_response("first")],
        vec![server::ok_response("second")],
    ]);

    // An HTTP/1 connection carries one exchange at a time; two calls in
    // flight need two sockets.
    let client = squall::Client::new();
    let a = client.execute(squall::Request::get(url(server.addr(), "/a")).build().unwrap());
    let b = client.execute(squall::Request::get(url(server.addr(), "/b")).build().unwrap());
    let (a, b) = tokio::join!(a, b);
    let mut bodies = vec![
        a.unwrap().text().await.unwrap(),
        b.unwrap().text().await.unwrap(),
    ];
    bodies.sort();
    assert_eq!(bodies, vec!["first".to_owned(), "second".to_owned()]);
    assert_eq!(server.connections_opened(), 2);
    assert_eq!(client.idle_connection_count(), 2);
}
