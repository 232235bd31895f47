//! Per-request FastCGI handler: connection establishment, request
//! framing, and response demux. Grounded in `mod_fastcgi.c`'s
//! `fcgi_establish_connection` (connect outcomes, line ~1624) and
//! `fcgi_handle_fdevent`'s STDOUT/STDERR/END_REQUEST switch (~2100-2300),
//! generalized from the teacher's one-shot `cgi.rs::handle_cgi_event`
//! streaming style to length-prefixed FastCGI records.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::chunk::ChunkQueue;
use crate::http::HttpResponse;

use super::host::{Host, Role, Transport};
use super::process::ProcessState;
use super::protocol::*;

/// Allocates the smallest positive integer not currently in use as a
/// FastCGI request id, released on connection close or reconnect (spec
/// §4.3 "Request id allocation").
#[derive(Default)]
pub struct RequestIdAllocator {
    in_use: HashSet<u16>,
}

impl RequestIdAllocator {
    pub fn alloc(&mut self) -> u16 {
        let mut id = 1u16;
        while self.in_use.contains(&id) {
            id += 1;
        }
        self.in_use.insert(id);
        id
    }

    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcgiState {
    Init,
    ConnectDelayed,
    PrepareWrite,
    Write,
    Read,
    Done,
}

/// Outcome of one connection attempt, matching `fcgi_establish_connection`'s
/// `CONNECTION_DELAYED/OVERLOADED/DEAD` plus the fd-exhaustion and fatal
/// cases spec §4.3 calls out explicitly.
pub enum ConnectOutcome {
    Success,
    Delayed,
    Overloaded,
    Dead,
    WaitForFd,
    Fatal(io::Error),
}

/// A connected backend socket, abstracting over the two transports so the
/// handler can `Read`/`Write`/`AsRawFd` without matching everywhere.
pub enum FcgiSocket {
    Unix(mio::net::UnixStream),
    Tcp(mio::net::TcpStream),
}

impl Read for FcgiSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FcgiSocket::Unix(s) => s.read(buf),
            FcgiSocket::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for FcgiSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FcgiSocket::Unix(s) => s.write(buf),
            FcgiSocket::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FcgiSocket::Unix(s) => s.flush(),
            FcgiSocket::Tcp(s) => s.flush(),
        }
    }
}

impl AsRawFd for FcgiSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            FcgiSocket::Unix(s) => s.as_raw_fd(),
            FcgiSocket::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// Per-request state for the FastCGI data plane (spec §3 "Handler
/// context"). Owned by the connection via the plugin slot table.
pub struct FcgiHandlerContext {
    pub state: FcgiState,
    pub host_idx: usize,
    pub proc_id: usize,
    pub request_id: u16,
    pub role: Role,
    pub socket: Option<FcgiSocket>,
    pub mio_token: Option<mio::Token>,
    /// Bytes built from BEGIN_REQUEST+PARAMS+STDIN, referencing the
    /// request body rather than copying it (spec §4.3 "Body forwarding").
    pub write_queue: ChunkQueue,
    /// Raw bytes read from the backend socket, not yet framed into
    /// records.
    pub read_queue: Vec<u8>,
    /// STDOUT payload accumulated before the HTTP response header parse
    /// completes.
    header_buf: Vec<u8>,
    pub response_headers_done: bool,
    pub http_status: u16,
    pub end_request_seen: bool,
    pub reconnect_count: u32,
    pub state_ts: Instant,
    pub started_at: Instant,
    pub bytes_written_to_backend: u64,
}

impl FcgiHandlerContext {
    pub fn new(host_idx: usize, proc_id: usize, request_id: u16, role: Role) -> Self {
        FcgiHandlerContext {
            state: FcgiState::Init,
            host_idx,
            proc_id,
            request_id,
            role,
            socket: None,
            mio_token: None,
            write_queue: ChunkQueue::new(),
            read_queue: Vec::new(),
            header_buf: Vec::new(),
            response_headers_done: false,
            http_status: 200,
            end_request_seen: false,
            reconnect_count: 0,
            state_ts: Instant::now(),
            started_at: Instant::now(),
            bytes_written_to_backend: 0,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.started_at.elapsed() > Duration::from_secs(60)
    }

    fn set_state(&mut self, state: FcgiState) {
        self.state = state;
        self.state_ts = Instant::now();
    }

    /// Attempts to connect to the chosen host/process. Mirrors
    /// `fcgi_establish_connection`'s non-blocking connect + `SO_ERROR`
    /// dance: immediate success moves straight to `PrepareWrite`; `EINPROGRESS`
    /// waits for writability; `EAGAIN` (listen queue full) marks the process
    /// overloaded for 2s; `ECONNREFUSED`/`ENOENT` marks it dead.
    pub fn connect(&mut self, host: &mut Host) -> ConnectOutcome {
        let Some(proc) = host.proc_mut(self.proc_id) else {
            return ConnectOutcome::Fatal(io::Error::new(io::ErrorKind::NotFound, "process vanished"));
        };

        match raw_nonblocking_connect(&host.transport) {
            Ok(RawConnectResult::Connected(fd)) => {
                self.adopt_socket(fd, &host.transport);
                self.set_state(FcgiState::PrepareWrite);
                ConnectOutcome::Success
            }
            Ok(RawConnectResult::InProgress(fd)) => {
                self.adopt_socket(fd, &host.transport);
                self.set_state(FcgiState::ConnectDelayed);
                ConnectOutcome::Delayed
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) => {
                    proc.disabled_until = Some(Instant::now() + Duration::from_secs(2));
                    proc.state = ProcessState::Overloaded;
                    ConnectOutcome::Overloaded
                }
                Some(libc::ECONNREFUSED) | Some(libc::ENOENT) => {
                    proc.disabled_until = Some(Instant::now() + Duration::from_secs(5));
                    proc.state = if proc.is_local {
                        ProcessState::DiedWaitForPid
                    } else {
                        ProcessState::Died
                    };
                    ConnectOutcome::Dead
                }
                Some(libc::EMFILE) => ConnectOutcome::WaitForFd,
                _ => ConnectOutcome::Fatal(e),
            },
        }
    }

    fn adopt_socket(&mut self, fd: RawFd, transport: &Transport) {
        let socket = match transport {
            Transport::Unix(_) => {
                let std_sock = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
                FcgiSocket::Unix(mio::net::UnixStream::from_std(std_sock))
            }
            Transport::Tcp(_) => {
                let std_sock = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                FcgiSocket::Tcp(mio::net::TcpStream::from_std(std_sock))
            }
        };
        self.socket = Some(socket);
    }

    /// Completes a delayed connect once the socket becomes writable, by
    /// reading `SO_ERROR`.
    pub fn finish_connect_delayed(&mut self, host: &mut Host) -> ConnectOutcome {
        let Some(socket) = &self.socket else {
            return ConnectOutcome::Fatal(io::Error::new(io::ErrorKind::NotConnected, "no socket"));
        };
        let fd = socket.as_raw_fd();
        let err = socket_error(fd);
        let Some(proc) = host.proc_mut(self.proc_id) else {
            return ConnectOutcome::Fatal(io::Error::new(io::ErrorKind::NotFound, "process vanished"));
        };
        match err {
            0 => {
                self.set_state(FcgiState::PrepareWrite);
                ConnectOutcome::Success
            }
            e if e == libc::ECONNREFUSED || e == libc::ENOENT => {
                proc.disabled_until = Some(Instant::now() + Duration::from_secs(5));
                proc.state = if proc.is_local {
                    ProcessState::DiedWaitForPid
                } else {
                    ProcessState::Died
                };
                ConnectOutcome::Dead
            }
            e => ConnectOutcome::Fatal(io::Error::from_raw_os_error(e)),
        }
    }

    /// Builds BEGIN_REQUEST + PARAMS (+ terminator) + STDIN blocks (+
    /// terminator) into `write_queue`, referencing the request body rather
    /// than copying it (spec §4.3).
    pub fn prepare_write(&mut self, params: &[(String, String)], body: &[u8], keep_conn: bool) {
        let mut out = Vec::new();
        out.extend_from_slice(&encode_begin_request(self.request_id, self.role.wire_value(), keep_conn));

        let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let content = encode_params(pairs);
        for block in content.chunks(u16::MAX as usize) {
            out.extend_from_slice(&encode_record(FCGI_PARAMS, self.request_id, block));
        }
        out.extend_from_slice(&encode_record(FCGI_PARAMS, self.request_id, &[]));

        for block in body.chunks(65535) {
            out.extend_from_slice(&encode_record(FCGI_STDIN, self.request_id, block));
        }
        out.extend_from_slice(&encode_record(FCGI_STDIN, self.request_id, &[]));

        self.write_queue.append_mem(out);
        self.set_state(FcgiState::Write);
    }

    /// Drains as much of `write_queue` to the backend socket as possible
    /// without blocking.
    pub fn write_step(&mut self) -> io::Result<bool> {
        let Some(socket) = &mut self.socket else {
            return Ok(false);
        };
        loop {
            let Some(crate::chunk::Chunk::Mem { data, offset }) = self.write_queue.front() else {
                self.set_state(FcgiState::Read);
                return Ok(true);
            };
            match socket.write(&data[*offset..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.bytes_written_to_backend += n as u64;
                    self.write_queue.advance(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads available bytes from the backend into the raw buffer. Caller
    /// drives `parse_records` afterward.
    pub fn read_step(&mut self) -> io::Result<bool> {
        let Some(socket) = &mut self.socket else {
            return Ok(false);
        };
        let mut buf = [0u8; 8192];
        let mut read_any = false;
        loop {
            match socket.read(&mut buf) {
                Ok(0) => return Ok(read_any),
                Ok(n) => {
                    self.read_queue.extend_from_slice(&buf[..n]);
                    read_any = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(read_any),
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses as many complete records as the raw buffer holds, appending
    /// STDOUT content to `out_body` (post-header-parse) or `header_buf`
    /// (pre-header-parse), logging STDERR, and consuming END_REQUEST.
    /// Short reads leave the unconsumed tail for next turn (spec §4.3).
    pub fn parse_records(&mut self, response: &mut HttpResponse, out_body: &mut Vec<u8>, allow_xsendfile: bool) -> io::Result<()> {
        let mut pos = 0usize;
        loop {
            if self.read_queue.len() < pos + HEADER_LEN {
                break;
            }
            let header_bytes: [u8; HEADER_LEN] = self.read_queue[pos..pos + HEADER_LEN].try_into().unwrap();
            let header = RecordHeader::decode(&header_bytes);
            let total = HEADER_LEN + header.content_length as usize + header.padding_length as usize;
            if self.read_queue.len() < pos + total {
                break;
            }
            let content_start = pos + HEADER_LEN;
            let content_end = content_start + header.content_length as usize;
            let content = self.read_queue[content_start..content_end].to_vec();

            match header.record_type {
                FCGI_STDOUT => self.handle_stdout(&content, response, out_body, allow_xsendfile),
                FCGI_STDERR => {
                    if !content.is_empty() {
                        proxy_log::info!("fastcgi stderr: {}", String::from_utf8_lossy(&content));
                    }
                }
                FCGI_END_REQUEST => {
                    self.end_request_seen = true;
                    self.set_state(FcgiState::Done);
                }
                _ => {}
            }

            pos += total;
        }
        self.read_queue.drain(..pos);
        Ok(())
    }

    fn handle_stdout(&mut self, content: &[u8], response: &mut HttpResponse, out_body: &mut Vec<u8>, allow_xsendfile: bool) {
        if self.response_headers_done {
            out_body.extend_from_slice(content);
            return;
        }

        self.header_buf.extend_from_slice(content);
        let Some(pos) = crate::http::find_subsequence(&self.header_buf, b"\r\n\r\n", 0) else {
            return;
        };
        let header_section = String::from_utf8_lossy(&self.header_buf[..pos]).into_owned();
        let body_start = self.header_buf[pos + 4..].to_vec();

        let mut status = 200u16;
        let mut location: Option<String> = None;
        let mut has_content_length = false;
        let mut xsendfile_path: Option<String> = None;

        for line in header_section.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();

            match key.as_str() {
                "status" => {
                    status = value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
                }
                "location" => {
                    location = Some(value.clone());
                    response.set_header("location", &value);
                }
                "content-length" => {
                    has_content_length = true;
                    response.set_header("content-length", &value);
                }
                "x-sendfile" | "x-lighttpd-send-file" if allow_xsendfile => {
                    xsendfile_path = Some(value);
                }
                _ => {
                    response.set_header(&key, &value);
                }
            }
        }

        if location.is_some() && status == 200 {
            status = 302;
        }
        response.set_status_code(status);
        self.http_status = status;

        if !has_content_length && xsendfile_path.is_none() {
            response.set_header("transfer-encoding", "chunked");
        }

        self.response_headers_done = true;

        if let Some(path) = xsendfile_path {
            // Stashed as a sentinel header; `Connection::resolve_xsendfile`
            // swaps it for a real file chunk before WRITE_RESPONSE_HEADER.
            response.set_header("x-sendfile-resolved", &path);
        } else if !body_start.is_empty() {
            out_body.extend_from_slice(&body_start);
        }
    }
}

enum RawConnectResult {
    Connected(RawFd),
    InProgress(RawFd),
}

fn raw_nonblocking_connect(transport: &Transport) -> io::Result<RawConnectResult> {
    match transport {
        Transport::Unix(path) => {
            let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            set_nonblocking(fd)?;
            let path_bytes = path.to_string_lossy();
            let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path_bytes.as_bytes();
            if bytes.len() >= addr.sun_path.len() {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "unix path too long"));
            }
            for (i, b) in bytes.iter().enumerate() {
                addr.sun_path[i] = *b as libc::c_char;
            }
            let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
            let ret = unsafe {
                libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len as libc::socklen_t)
            };
            finish_raw_connect(fd, ret)
        }
        Transport::Tcp(addr) => {
            let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
            let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            set_nonblocking(fd)?;
            let ret = match addr {
                std::net::SocketAddr::V4(a) => {
                    let sin = libc::sockaddr_in {
                        sin_family: libc::AF_INET as libc::sa_family_t,
                        sin_port: a.port().to_be(),
                        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                        sin_zero: [0; 8],
                    };
                    unsafe {
                        libc::connect(
                            fd,
                            &sin as *const _ as *const libc::sockaddr,
                            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                        )
                    }
                }
                std::net::SocketAddr::V6(_) => {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(io::ErrorKind::Unsupported, "ipv6 fastcgi backends unsupported"));
                }
            };
            finish_raw_connect(fd, ret)
        }
    }
}

fn finish_raw_connect(fd: RawFd, ret: libc::c_int) -> io::Result<RawConnectResult> {
    if ret == 0 {
        return Ok(RawConnectResult::Connected(fd));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(RawConnectResult::InProgress(fd)),
        _ => {
            unsafe { libc::close(fd) };
            Err(err)
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn socket_error(fd: RawFd) -> libc::c_int {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

/// Builds the CGI-style environment for a request (spec §4.3 "Request
/// framing"), grounded in `cgi.rs::build_cgi_env` (header translation)
/// generalized with the full standard-CGI variable set from
/// `mod_fastcgi.c`'s `fcgi_create_env` (lines ~1860-1990).
pub struct EnvInput<'a> {
    pub method: &'a str,
    pub script_name: &'a str,
    pub path_info: &'a str,
    pub script_filename: &'a str,
    pub document_root: &'a str,
    pub request_uri: &'a str,
    pub query_string: &'a str,
    pub server_protocol: &'a str,
    pub server_name: &'a str,
    pub remote_addr: &'a str,
    pub remote_port: u16,
    pub https: bool,
    pub headers: &'a HashMap<String, String>,
    pub content_length: Option<usize>,
}

pub fn build_params(input: &EnvInput) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    pairs.push(("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()));
    pairs.push(("SERVER_PROTOCOL".to_string(), input.server_protocol.to_string()));
    pairs.push(("SERVER_NAME".to_string(), input.server_name.to_string()));
    pairs.push(("REQUEST_METHOD".to_string(), input.method.to_string()));
    pairs.push(("SCRIPT_NAME".to_string(), input.script_name.to_string()));
    pairs.push(("SCRIPT_FILENAME".to_string(), input.script_filename.to_string()));
    pairs.push(("DOCUMENT_ROOT".to_string(), input.document_root.to_string()));
    pairs.push(("REQUEST_URI".to_string(), input.request_uri.to_string()));
    pairs.push(("QUERY_STRING".to_string(), input.query_string.to_string()));
    pairs.push(("PATH_INFO".to_string(), input.path_info.to_string()));
    if !input.path_info.is_empty() {
        pairs.push(("PATH_TRANSLATED".to_string(), format!("{}{}", input.document_root, input.path_info)));
    }
    pairs.push(("REMOTE_ADDR".to_string(), input.remote_addr.to_string()));
    pairs.push(("REMOTE_PORT".to_string(), input.remote_port.to_string()));
    pairs.push(("REDIRECT_STATUS".to_string(), "200".to_string()));
    if input.https {
        pairs.push(("HTTPS".to_string(), "on".to_string()));
    }
    if let Some(len) = input.content_length {
        pairs.push(("CONTENT_LENGTH".to_string(), len.to_string()));
    }
    if let Some(ct) = input.headers.get("content-type") {
        pairs.push(("CONTENT_TYPE".to_string(), ct.clone()));
    }
    for (k, v) in input.headers {
        if k == "content-type" || k == "content-length" {
            continue;
        }
        let env_key = format!("HTTP_{}", k.to_uppercase().replace('-', "_"));
        pairs.push((env_key, v.clone()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_allocator_reuses_smallest_free_id() {
        let mut alloc = RequestIdAllocator::default();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_eq!((a, b), (1, 2));
        alloc.release(a);
        let c = alloc.alloc();
        assert_eq!(c, 1);
    }

    #[test]
    fn build_params_includes_query_string_and_http_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-custom".to_string(), "value".to_string());
        let input = EnvInput {
            method: "GET",
            script_name: "/app.php",
            path_info: "",
            script_filename: "/var/www/app.php",
            document_root: "/var/www",
            request_uri: "/app.php?x=1",
            query_string: "x=1",
            server_protocol: "HTTP/1.1",
            server_name: "example.com",
            remote_addr: "127.0.0.1",
            remote_port: 4000,
            https: false,
            headers: &headers,
            content_length: None,
        };
        let pairs = build_params(&input);
        assert!(pairs.iter().any(|(k, v)| k == "QUERY_STRING" && v == "x=1"));
        assert!(pairs.iter().any(|(k, v)| k == "HTTP_X_CUSTOM" && v == "value"));
    }
}
