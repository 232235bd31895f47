use server_proxy::http::*;

fn feed(req: &mut HttpRequest, bytes: &[u8]) {
    req.buffer.extend_from_slice(bytes);
}

#[test]
fn parses_a_simple_get_request() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    req.advance(1_048_576).unwrap();

    assert_eq!(req.method.as_str(), "GET");
    assert_eq!(req.url, "/index.html");
    assert_eq!(req.state, ParsingState::Complete);
    assert_eq!(req.headers.get("host").unwrap(), "localhost");
}

#[test]
fn fragmented_headers_are_parsed_once_the_buffer_fills_in() {
    let mut req = HttpRequest::new();

    feed(&mut req, b"GET /path ");
    assert_eq!(req.advance(1_048_576).unwrap_err(), ParseError::IncompleteRequestLine);

    feed(&mut req, b"HTTP/1.1\r\n");
    assert_eq!(req.advance(1_048_576).unwrap_err(), ParseError::IncompleteRequestLine);
    assert_eq!(req.state, ParsingState::Headers);

    feed(&mut req, b"User-Agent: test\r\n\r\n");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.state, ParsingState::Complete);
}

#[test]
fn post_request_with_a_complete_body_in_one_read() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"POST /api HTTP/1.1\r\nContent-Length: 13\r\n\r\nHello, World!");

    req.advance(1_048_576).unwrap();

    assert_eq!(req.method.as_str(), "POST");
    assert_eq!(req.body, b"Hello, World!");
    assert_eq!(req.state, ParsingState::Complete);
}

#[test]
fn body_arriving_across_several_reads_accumulates_until_complete() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"POST /data HTTP/1.1\r\nContent-Length: 10\r\n\r\n");

    assert_eq!(req.advance(1_048_576).unwrap_err(), ParseError::IncompleteRequestLine);
    assert_eq!(req.state, ParsingState::Body);
    assert_eq!(req.body_remaining, 10);

    feed(&mut req, b"12345");
    assert_eq!(req.advance(1_048_576).unwrap_err(), ParseError::IncompleteRequestLine);
    assert_eq!(req.body_remaining, 5);

    feed(&mut req, b"67890");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.body, b"1234567890");
    assert_eq!(req.state, ParsingState::Complete);
}

#[test]
fn lowercase_methods_are_rejected() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"get /invalid HTTP/1.1\r\n\r\n");
    assert_eq!(req.advance(1_048_576).unwrap_err(), ParseError::InvalidMethod);
}

#[test]
fn any_uppercase_verb_is_accepted_since_a_fastcgi_backend_may_use_any_method() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"PATCH /resource HTTP/1.1\r\n\r\n");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.method.as_str(), "PATCH");
    assert_eq!(req.state, ParsingState::Complete);
}

#[test]
fn partial_request_line_then_partial_headers_both_report_incomplete() {
    let mut req = HttpRequest::new();

    feed(&mut req, b"GET /index.html HTTP/1.1\r\n");
    let _ = req.advance(1_048_576);
    assert_eq!(req.state, ParsingState::Headers);
    assert_eq!(req.url, "/index.html");

    feed(&mut req, b"Host: localhost\r\n\r\n");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.state, ParsingState::Complete);
    assert_eq!(req.headers.get("host").unwrap(), "localhost");
}

#[test]
fn body_beyond_the_content_length_is_left_in_the_buffer_for_the_next_request() {
    let mut req = HttpRequest::new();
    let raw = b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nHelloWorld";
    feed(&mut req, raw);

    req.advance(1_048_576).unwrap();

    assert_eq!(req.state, ParsingState::Complete);
    assert_eq!(req.body, b"Hello");
    assert_eq!(&req.buffer[req.cursor..], b"World");
}

#[test]
fn payload_over_the_configured_ceiling_is_rejected() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
    assert_eq!(req.advance(4).unwrap_err(), ParseError::PayloadTooLarge);
}

#[test]
fn chunked_transfer_encoding_is_decoded_into_a_flat_body() {
    let mut req = HttpRequest::new();
    feed(
        &mut req,
        b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );

    req.advance(1_048_576).unwrap();

    assert_eq!(req.state, ParsingState::Complete);
    assert_eq!(req.body, b"Wikipedia");
}

#[test]
fn finish_request_resets_for_the_next_keep_alive_request() {
    let mut req = HttpRequest::new();
    feed(&mut req, b"GET /one HTTP/1.1\r\n\r\n");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.url, "/one");

    req.finish_request();
    assert_eq!(req.state, ParsingState::RequestLine);
    assert!(req.body.is_empty());

    feed(&mut req, b"GET /two HTTP/1.1\r\n\r\n");
    req.advance(1_048_576).unwrap();
    assert_eq!(req.url, "/two");
}

#[test]
fn response_to_bytes_assembles_status_line_headers_and_body() {
    let mut res = HttpResponse::new(200, "OK");
    res.set_header("content-type", "text/plain");
    res.set_body(b"Hello Rust".to_vec(), "text/plain");

    let bytes = res.to_bytes();
    let s = String::from_utf8_lossy(&bytes);

    assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(s.contains("Content-Type: text/plain\r\n"));
    assert!(s.contains("Content-Length: 10\r\n"));
    assert!(s.ends_with("\r\n\r\nHello Rust"));
}
