use mio::Poll;
use server_proxy::config::{AppConfig, RouteConfig, ServerConfig};
use server_proxy::server::Server;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use std::{fs, thread};

fn spawn_server(port: u16, doc_root: &str, max_keep_alive_requests: usize) {
    let route = RouteConfig {
        path: "/".to_string(),
        methods: vec!["GET".to_string(), "HEAD".to_string()],
        root: doc_root.to_string(),
        default_file: "index.html".to_string(),
        ..Default::default()
    };
    let server_cfg = ServerConfig {
        server_name: "localhost".to_string(),
        ports: vec![port],
        routes: vec![route],
        default_server: true,
        max_keep_alive_requests,
        ..Default::default()
    };
    let config = AppConfig { servers: vec![server_cfg] };

    thread::spawn(move || {
        let poll = Poll::new().unwrap();
        let server = Server::new(config, &poll).unwrap();
        server.run(poll).unwrap();
    });

    thread::sleep(Duration::from_millis(200));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to test server");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

#[test]
fn serves_a_static_file_over_a_plain_get() {
    let root = "./tmp_test_root_static_get";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{root}/index.html"), "Hello, Rust!").unwrap();

    spawn_server(18180, root, 100);

    let mut stream = connect(18180);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);

    assert!(response.starts_with("HTTP/1.1 200 OK"), "response was:\n{response}");
    assert!(response.ends_with("Hello, Rust!"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn an_unmatched_path_gets_the_built_in_404_body() {
    let root = "./tmp_test_root_404";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();

    spawn_server(18181, root, 100);

    let mut stream = connect(18181);
    stream
        .write_all(b"GET /does-not-exist HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);

    assert!(response.starts_with("HTTP/1.1 404 Not Found"), "response was:\n{response}");

    let _ = fs::remove_dir_all(root);
}

#[test]
fn keep_alive_serves_a_second_request_on_the_same_connection() {
    let root = "./tmp_test_root_keepalive";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{root}/index.html"), "first").unwrap();
    fs::write(format!("{root}/second.html"), "second").unwrap();

    spawn_server(18182, root, 100);

    let mut stream = connect(18182);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut buf = [0u8; 4096];
    let n1 = stream.read(&mut buf).unwrap();
    let res1 = String::from_utf8_lossy(&buf[..n1]).to_string();
    assert!(res1.contains("200 OK"));
    assert!(res1.contains("keep-alive"));
    assert!(res1.ends_with("first"));

    stream
        .write_all(b"GET /second.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let n2 = stream.read(&mut buf).unwrap();
    let res2 = String::from_utf8_lossy(&buf[..n2]);
    assert!(res2.contains("200 OK"));
    assert!(res2.ends_with("second"));

    let _ = fs::remove_dir_all(root);
}

#[test]
fn exhausting_max_keep_alive_requests_closes_the_connection() {
    let root = "./tmp_test_root_close_after_one";
    let _ = fs::remove_dir_all(root);
    fs::create_dir_all(root).unwrap();
    fs::write(format!("{root}/index.html"), "only one").unwrap();

    spawn_server(18183, root, 1);

    let mut stream = connect(18183);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.contains("200 OK"));
    assert!(response.contains("Connection: close"));

    // The server should drop the connection after one request rather than
    // waiting for another request line that will never come.
    let mut trailing = [0u8; 16];
    let read_after_close = stream.read(&mut trailing);
    assert!(matches!(read_after_close, Ok(0)) || read_after_close.is_err());

    let _ = fs::remove_dir_all(root);
}
