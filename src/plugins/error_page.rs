//! Maps a response's status code to a configured error page or the
//! built-in plain-text body, grounded in `http/response.rs`'s
//! `handle_error`. Runs as a `handle_response_header` tail hook (spec §6)
//! rather than being baked into `connection.rs`, so the static-file path's
//! own `handle_error` calls and a FastCGI backend's bare `Status: 404`
//! response (no body of its own) end up looking the same to the client.

use crate::connection::Connection;
use crate::plugin::{HookResult, Plugin};
use crate::server::ServerShared;

pub struct ErrorPagePlugin;

impl Plugin for ErrorPagePlugin {
    fn name(&self) -> &'static str {
        "error_page"
    }

    fn handle_response_header(&self, conn: &mut Connection) -> HookResult {
        let status = conn.response.status_code;
        let backend_left_it_empty = conn.response.body.is_empty() && conn.response_queue.is_empty();

        if status >= 400 && backend_left_it_empty {
            conn.response = crate::http::handle_error(status, conn.s_cfg.as_deref());
        }

        HookResult::GoOn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;

    fn bare_connection(status: u16) -> Connection {
        use mio::net::TcpStream;
        use std::net::{SocketAddr, TcpListener as StdListener};

        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_stream, _) = listener.accept().unwrap();
        server_stream.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server_stream);
        let peer: SocketAddr = client.local_addr().unwrap();

        let mut conn = Connection::new(stream, mio::Token(0), Vec::new(), 0, peer);
        conn.response = HttpResponse::new(status, &HttpResponse::status_text(status));
        conn.response.headers.remove("content-length");
        conn
    }

    #[test]
    fn backfills_body_for_bare_backend_status() {
        let mut conn = bare_connection(404);
        let plugin = ErrorPagePlugin;
        plugin.handle_response_header(&mut conn);
        assert!(!conn.response.body.is_empty());
        assert_eq!(conn.response.status_code, 404);
    }

    #[test]
    fn leaves_a_body_the_backend_already_set_alone() {
        let mut conn = bare_connection(404);
        conn.response.set_body(b"custom not found".to_vec(), "text/plain");
        let plugin = ErrorPagePlugin;
        plugin.handle_response_header(&mut conn);
        assert_eq!(conn.response.body, b"custom not found");
    }
}
