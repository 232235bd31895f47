//! Per-connection state machine (spec §4.1), grounded in the teacher's
//! `HttpConnection`/`ActiveAction` quartet
//! (`http/http_connection.rs::handle_read_phase`/`handle_write_phase`/
//! `handle_post_write_update`) but restructured into the explicit
//! state-enum-with-step-function shape Design Notes §9 calls for, so a
//! single `step()` replaces the nested if-chains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunk::ChunkQueue;
use crate::config::{RouteConfig, ServerConfig};
use crate::fastcgi::handler::{ConnectOutcome, EnvInput, FcgiHandlerContext};
use crate::http::{HttpRequest, HttpResponse, ParseError, ParsingState};
use crate::io_backend::{FileZeroCopyWriter, WriteBackend};
use crate::plugin::{HookResult, Plugin, PluginSlots};
use crate::server::ServerShared;

use mio::net::TcpStream;
use mio::{Interest, Poll, Token};

const MAX_LOOPS_PER_REQUEST: u32 = 5;

/// The connection's position in the request/response pipeline (spec §4.1).
/// `step()` advances exactly one state per call so the event loop never
/// blocks inside a single connection's turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadRequestHeader,
    ValidateRequestHeader,
    HandleRequestHeader,
    ReadRequestContent,
    HandleSubrequest,
    HandleResponseHeader,
    WriteResponseHeader,
    WriteResponseContent,
    ResponseEnd,
    Error,
    Close,
}

/// Outcome of one `step()` call, telling the event loop whether to keep
/// polling this connection, re-register its interest, or drop it.
pub enum StepOutcome {
    /// Keep going without returning to the poller (more work ready now).
    Continue,
    /// Nothing more to do until the next readable/writable event.
    WouldBlock,
    /// Connection finished (keep-alive exhausted, error, or client close).
    Done,
}

pub struct Connection {
    pub stream: TcpStream,
    pub token: Token,
    pub state: ConnectionState,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub response_queue: ChunkQueue,
    pub header_bytes_pending: Option<Vec<u8>>,
    /// Dispatches per chunk kind: `Chunk::File` rides `sendfile(2)`
    /// zero-copy, `Chunk::Mem` falls back to the vectored writer (spec
    /// §4.2 "Write backends").
    pub write_backend: FileZeroCopyWriter,
    pub config_list: Vec<Arc<ServerConfig>>,
    pub s_cfg: Option<Arc<ServerConfig>>,
    pub r_cfg: Option<RouteConfig>,
    pub physical_path: std::path::PathBuf,
    pub plugin_slots: PluginSlots,
    pub fcgi_ctx: Option<FcgiHandlerContext>,
    pub fcgi_ext_idx: Option<usize>,
    pub keep_alive_requests: usize,
    pub loops_this_request: u32,
    /// Bounds reader inactivity (spec §4.1 `read_idle_ts`): stamped whenever
    /// the state machine is entered to do read-side work.
    pub read_idle_ts: std::time::Instant,
    /// Bounds writer inactivity while a write is in progress (spec §4.1
    /// `write_request_ts`): stamped whenever the state machine is entered
    /// to do write-side work.
    pub write_request_ts: std::time::Instant,
    /// Set on first entry into `CLOSE`; bounds how long the connection
    /// lingers draining a peer FIN (spec §4.1 `close_timeout_ts`).
    pub close_ts: Option<std::time::Instant>,
    pub peer_addr: std::net::SocketAddr,
    pub closing: bool,
    /// Bytes written to this socket during the current traffic-shaping
    /// tick; reset by `job_list::run_trigger` (spec §4.5 "Traffic shaping").
    pub bytes_written_this_second: u64,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        token: Token,
        config_list: Vec<Arc<ServerConfig>>,
        plugin_count: usize,
        peer_addr: std::net::SocketAddr,
    ) -> Self {
        Connection {
            stream,
            token,
            state: ConnectionState::ReadRequestHeader,
            request: HttpRequest::new(),
            response: HttpResponse::new(200, "OK"),
            response_queue: ChunkQueue::new(),
            header_bytes_pending: None,
            write_backend: FileZeroCopyWriter,
            config_list,
            s_cfg: None,
            r_cfg: None,
            physical_path: std::path::PathBuf::new(),
            plugin_slots: crate::plugin::new_slots(plugin_count),
            fcgi_ctx: None,
            fcgi_ext_idx: None,
            keep_alive_requests: 0,
            loops_this_request: 0,
            read_idle_ts: std::time::Instant::now(),
            write_request_ts: std::time::Instant::now(),
            close_ts: None,
            peer_addr,
            closing: false,
            bytes_written_this_second: 0,
        }
    }

    fn resolve_config(&self) -> Arc<ServerConfig> {
        if let Some(host_header) = self.request.headers.get("host") {
            let hostname = host_header.split(':').next().unwrap_or("");
            for cfg in &self.config_list {
                if cfg.server_name == hostname {
                    return Arc::clone(cfg);
                }
            }
        }
        for cfg in &self.config_list {
            if cfg.default_server {
                return Arc::clone(cfg);
            }
        }
        Arc::clone(&self.config_list[0])
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.s_cfg.as_ref().map(|c| c.read_idle_timeout).unwrap_or(crate::config::types::DEFAULT_READ_IDLE_TIMEOUT))
    }

    pub fn write_request_timeout(&self) -> Duration {
        Duration::from_secs(self.s_cfg.as_ref().map(|c| c.write_request_timeout).unwrap_or(crate::config::types::DEFAULT_WRITE_REQUEST_TIMEOUT))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.s_cfg.as_ref().map(|c| c.close_timeout).unwrap_or(crate::config::types::DEFAULT_CLOSE_TIMEOUT))
    }

    /// Runs the state machine forward, invoking plugin hooks and driving
    /// the FastCGI handler as needed. Returns once no further progress can
    /// be made without another poll event.
    pub fn step(&mut self, poll: &Poll, shared: &mut ServerShared) -> std::io::Result<StepOutcome> {
        loop {
            match self.state {
                ConnectionState::ReadRequestHeader | ConnectionState::ReadRequestContent => {
                    self.read_idle_ts = Instant::now();
                }
                ConnectionState::WriteResponseHeader | ConnectionState::WriteResponseContent => {
                    self.write_request_ts = Instant::now();
                }
                _ => {}
            }
            let outcome = match self.state {
                ConnectionState::ReadRequestHeader => self.do_read_request_header()?,
                ConnectionState::ValidateRequestHeader => self.do_validate_request_header(),
                ConnectionState::HandleRequestHeader => self.do_handle_request_header(shared),
                ConnectionState::ReadRequestContent => self.do_read_request_content()?,
                ConnectionState::HandleSubrequest => self.do_handle_subrequest(shared)?,
                ConnectionState::HandleResponseHeader => self.do_handle_response_header(shared),
                ConnectionState::WriteResponseHeader => self.do_write_response_header()?,
                ConnectionState::WriteResponseContent => self.do_write_response_content(poll, shared)?,
                ConnectionState::ResponseEnd => self.do_response_end(poll, shared)?,
                ConnectionState::Error => self.do_error(),
                ConnectionState::Close => self.do_close()?,
            };
            match outcome {
                StepOutcome::Continue => continue,
                StepOutcome::WouldBlock => {
                    let plugins = std::mem::take(&mut shared.plugins);
                    for p in &plugins {
                        p.handle_joblist(self);
                    }
                    shared.plugins = plugins;
                    return Ok(StepOutcome::WouldBlock);
                }
                StepOutcome::Done => return Ok(StepOutcome::Done),
            }
        }
    }

    /// Lingers for `close_timeout` while draining a peer FIN (spec §4.1
    /// "CLOSE"): a non-blocking read that observes EOF or an error finishes
    /// immediately; otherwise the connection waits out the linger window,
    /// with `job_list::run_trigger` as the backstop that forces it closed
    /// if no further event arrives before the socket is reused elsewhere.
    fn do_close(&mut self) -> std::io::Result<StepOutcome> {
        let entered_at = *self.close_ts.get_or_insert_with(Instant::now);

        let mut buf = [0u8; 256];
        match std::io::Read::read(&mut self.stream, &mut buf) {
            Ok(0) => return Ok(StepOutcome::Done),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            _ => return Ok(StepOutcome::Done),
        }

        if entered_at.elapsed() > self.close_timeout() {
            return Ok(StepOutcome::Done);
        }
        Ok(StepOutcome::WouldBlock)
    }

    fn do_read_request_header(&mut self) -> std::io::Result<StepOutcome> {
        let mut buf = [0u8; crate::prelude::READ_BUF_SIZE];
        loop {
            match std::io::Read::read(&mut self.stream, &mut buf) {
                Ok(0) => {
                    self.closing = true;
                    self.state = ConnectionState::Close;
                    return Ok(StepOutcome::Continue);
                }
                Ok(n) => self.request.buffer.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.closing = true;
                    self.state = ConnectionState::Close;
                    return Ok(StepOutcome::Continue);
                }
            }
        }

        // spec §4.1 `READ_REQUEST_HEADER`: "accumulate into raw recv queue
        // until CRLFCRLF is observed or max_request_size is exceeded."
        let max_request_size = self
            .s_cfg
            .as_ref()
            .map(|c| c.max_request_size)
            .unwrap_or(crate::config::types::DEFAULT_MAX_REQUEST_SIZE);
        if self.request.buffer.len() > max_request_size {
            self.closing = true;
            self.response = crate::http::handle_error(413, self.s_cfg.as_deref());
            self.state = ConnectionState::HandleResponseHeader;
            return Ok(StepOutcome::Continue);
        }

        let max_body = self
            .s_cfg
            .as_ref()
            .map(|c| c.client_max_body_size)
            .unwrap_or(crate::config::types::DEFAULT_MAX_BODY_SIZE);

        match self.request.advance(max_body) {
            Ok(()) if self.request.state == ParsingState::Complete => {
                self.state = ConnectionState::ValidateRequestHeader;
                Ok(StepOutcome::Continue)
            }
            Ok(()) => Ok(StepOutcome::WouldBlock),
            Err(ParseError::IncompleteRequestLine) => Ok(StepOutcome::WouldBlock),
            Err(e) => {
                // spec §7 "Client protocol error": produces 4xx, closes the
                // connection (keep-alive disabled).
                self.closing = true;
                self.response = crate::http::handle_error(e.status_code(), self.s_cfg.as_deref());
                self.state = ConnectionState::HandleResponseHeader;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Enforces the wire-level preconditions spec §4.1 calls out before any
    /// plugin runs: a supported HTTP version (505 otherwise) and, for
    /// HTTP/1.1, a `Host` header (400 otherwise — HTTP/1.0 without `Host` is
    /// accepted per §8 "Boundaries").
    fn do_validate_request_header(&mut self) -> StepOutcome {
        if self.request.version != "HTTP/1.0" && self.request.version != "HTTP/1.1" {
            self.response = crate::http::handle_error(505, None);
            self.state = ConnectionState::Error;
            return StepOutcome::Continue;
        }
        if self.request.version == "HTTP/1.1" && !self.request.headers.contains_key("host") {
            self.response = crate::http::handle_error(400, None);
            self.state = ConnectionState::Error;
            return StepOutcome::Continue;
        }

        self.s_cfg = Some(self.resolve_config());
        self.state = ConnectionState::HandleRequestHeader;
        StepOutcome::Continue
    }

    /// Fixed hook-invocation order (spec §4.1): handle_uri_raw -> path
    /// simplification -> handle_uri_clean -> handle_docroot ->
    /// handle_physical_path -> handle_start_backend. A `Comeback` from any
    /// hook re-enters this function from the top, bounded by
    /// `MAX_LOOPS_PER_REQUEST` to stop a misbehaving plugin from looping
    /// forever.
    fn do_handle_request_header(&mut self, shared: &mut ServerShared) -> StepOutcome {
        self.loops_this_request += 1;
        if self.loops_this_request > MAX_LOOPS_PER_REQUEST {
            self.response = crate::http::handle_error(500, self.s_cfg.as_deref());
            self.state = ConnectionState::HandleResponseHeader;
            return StepOutcome::Continue;
        }

        let plugins = std::mem::take(&mut shared.plugins);
        let outcome = self.run_request_hooks(&plugins, shared);
        shared.plugins = plugins;

        match outcome {
            HookResult::GoOn => {
                self.state = ConnectionState::ReadRequestContent;
            }
            HookResult::Comeback => {
                // stay in this state; loop guard above bounds re-entry
            }
            HookResult::Finished(code) => {
                self.response = crate::http::handle_error(code, self.s_cfg.as_deref());
                self.state = ConnectionState::HandleResponseHeader;
            }
            HookResult::Error(code) => {
                self.response = crate::http::handle_error(code, self.s_cfg.as_deref());
                self.state = ConnectionState::Error;
            }
            HookResult::WaitForEvent | HookResult::WaitForFd => {
                // handled inline below; run_request_hooks never returns these
                // for the synchronous pre-backend hooks.
            }
        }
        StepOutcome::Continue
    }

    fn run_request_hooks(&mut self, plugins: &[Box<dyn Plugin>], shared: &mut ServerShared) -> HookResult {
        for p in plugins {
            match p.handle_uri_raw(self) {
                HookResult::GoOn => {}
                other => return other,
            }
        }

        self.simplify_url();

        for p in plugins {
            match p.handle_uri_clean(self) {
                HookResult::GoOn => {}
                other => return other,
            }
        }

        for p in plugins {
            match p.handle_docroot(self) {
                HookResult::GoOn => {}
                other => return other,
            }
        }

        let Some(s_cfg) = self.s_cfg.clone() else {
            return HookResult::Error(500);
        };
        match s_cfg.find_route(&self.request.url, self.request.method.as_str()) {
            Ok(route) => self.r_cfg = Some(route.clone()),
            Err(crate::config::RoutingError::NotFound) => return HookResult::Finished(404),
            Err(crate::config::RoutingError::MethodNotAllowed) => return HookResult::Finished(405),
        }

        for p in plugins {
            match p.handle_physical_path(self) {
                HookResult::GoOn => {}
                other => return other,
            }
        }

        for p in plugins {
            match p.handle_start_backend(self, shared) {
                HookResult::GoOn => {}
                other => return other,
            }
        }

        HookResult::GoOn
    }

    fn simplify_url(&mut self) {
        let mut segments: Vec<&str> = Vec::new();
        for seg in self.request.url.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        self.request.url = format!("/{}", segments.join("/"));
    }

    fn do_read_request_content(&mut self) -> std::io::Result<StepOutcome> {
        // Request framing already consumed the body into `request.body`
        // during `advance()`'s `ParsingState::Body`/`ChunkedBody` handling;
        // this state exists to keep the transition table matching spec
        // §4.1 even though this implementation doesn't defer body reads.
        self.state = ConnectionState::HandleSubrequest;
        Ok(StepOutcome::Continue)
    }

    fn do_handle_subrequest(&mut self, shared: &mut ServerShared) -> std::io::Result<StepOutcome> {
        let plugins = std::mem::take(&mut shared.plugins);
        let mut short_circuit = None;
        for p in &plugins {
            match p.handle_subrequest(self, shared) {
                HookResult::GoOn => {}
                other => {
                    short_circuit = Some(other);
                    break;
                }
            }
        }
        shared.plugins = plugins;
        match short_circuit {
            None | Some(HookResult::GoOn) | Some(HookResult::Comeback) => {}
            Some(HookResult::Finished(code)) => {
                self.response = crate::http::handle_error(code, self.s_cfg.as_deref());
                self.state = ConnectionState::HandleResponseHeader;
                return Ok(StepOutcome::Continue);
            }
            Some(HookResult::Error(code)) => {
                self.response = crate::http::handle_error(code, self.s_cfg.as_deref());
                self.state = ConnectionState::Error;
                return Ok(StepOutcome::Continue);
            }
            Some(HookResult::WaitForEvent) | Some(HookResult::WaitForFd) => {
                return Ok(StepOutcome::WouldBlock);
            }
        }

        if let Some(mut ctx) = self.fcgi_ctx.take() {
            let outcome = self.drive_fcgi(&mut ctx, shared)?;
            self.fcgi_ctx = Some(ctx);
            return Ok(outcome);
        }

        // No backend selected: fall through to static serving via
        // whichever plugin claimed `handle_start_backend` (it stashes the
        // response directly), or 404 if nothing did.
        if self.response.status_code == 200 && self.response.body.is_empty() && self.response.headers.len() <= 1 {
            self.response = crate::http::handle_error(404, self.s_cfg.as_deref());
        }
        self.state = ConnectionState::HandleResponseHeader;
        Ok(StepOutcome::Continue)
    }

    fn drive_fcgi(&mut self, ctx: &mut FcgiHandlerContext, shared: &mut ServerShared) -> std::io::Result<StepOutcome> {
        use crate::fastcgi::FcgiState;

        match ctx.state {
            FcgiState::Init => {
                let Some(ext_idx) = self.fcgi_ext_idx else {
                    self.state = ConnectionState::Error;
                    return Ok(StepOutcome::Continue);
                };
                let Some(host) = shared.fastcgi.get_mut(ext_idx).and_then(|e| e.hosts.get_mut(ctx.host_idx)) else {
                    self.state = ConnectionState::Error;
                    return Ok(StepOutcome::Continue);
                };
                match ctx.connect(host) {
                    ConnectOutcome::Success => Ok(StepOutcome::Continue),
                    ConnectOutcome::Delayed => Ok(StepOutcome::WouldBlock),
                    ConnectOutcome::Overloaded | ConnectOutcome::Dead => {
                        if !self.retry_fcgi(ctx, shared) {
                            self.fail_fcgi(crate::error::ServerError::BackendDead(
                                "no remaining process for this extension".to_string(),
                            ));
                        }
                        Ok(StepOutcome::Continue)
                    }
                    ConnectOutcome::WaitForFd => Ok(StepOutcome::WouldBlock),
                    ConnectOutcome::Fatal(e) => {
                        self.fail_fcgi(crate::error::ServerError::Fatal(e.to_string()));
                        Ok(StepOutcome::Continue)
                    }
                }
            }
            FcgiState::ConnectDelayed => {
                let Some(ext_idx) = self.fcgi_ext_idx else {
                    self.state = ConnectionState::Error;
                    return Ok(StepOutcome::Continue);
                };
                let Some(host) = shared.fastcgi.get_mut(ext_idx).and_then(|e| e.hosts.get_mut(ctx.host_idx)) else {
                    self.state = ConnectionState::Error;
                    return Ok(StepOutcome::Continue);
                };
                match ctx.finish_connect_delayed(host) {
                    ConnectOutcome::Success => Ok(StepOutcome::Continue),
                    ConnectOutcome::Dead => {
                        if !self.retry_fcgi(ctx, shared) {
                            self.fail_fcgi(crate::error::ServerError::BackendDead(
                                "connect failed after delay".to_string(),
                            ));
                        }
                        Ok(StepOutcome::Continue)
                    }
                    _ => Ok(StepOutcome::WouldBlock),
                }
            }
            FcgiState::PrepareWrite => {
                let params = self.build_fcgi_params();
                let mut body = self.request.body.clone();
                let plugins = std::mem::take(&mut shared.plugins);
                for p in &plugins {
                    p.handle_send_request_content(self, &mut body);
                }
                shared.plugins = plugins;
                ctx.prepare_write(&params, &body, true);
                Ok(StepOutcome::Continue)
            }
            FcgiState::Write => {
                let wrote = match ctx.write_step() {
                    Ok(w) => w,
                    Err(e) => return Ok(self.handle_fcgi_io_error(ctx, shared, e)),
                };
                if wrote && ctx.write_queue.is_empty() {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::WouldBlock)
                }
            }
            FcgiState::Read => {
                let read_any = match ctx.read_step() {
                    Ok(r) => r,
                    Err(e) => return Ok(self.handle_fcgi_io_error(ctx, shared, e)),
                };
                let allow_xsendfile = self.fcgi_ext_idx.and_then(|i| shared.fastcgi.get(i)).map(|e| e.allow_xsendfile).unwrap_or(false);
                let mut body = Vec::new();
                if let Err(e) = ctx.parse_records(&mut self.response, &mut body, allow_xsendfile) {
                    return Ok(self.handle_fcgi_io_error(ctx, shared, e));
                }
                if !body.is_empty() {
                    self.response_queue.append_mem(body);
                }
                if let Some(path) = self.response.headers.remove("x-sendfile-resolved") {
                    if !self.resolve_xsendfile(&path) {
                        self.response = crate::http::handle_error(404, self.s_cfg.as_deref());
                        self.state = ConnectionState::HandleResponseHeader;
                        return Ok(StepOutcome::Continue);
                    }
                }
                if ctx.end_request_seen {
                    self.state = ConnectionState::HandleResponseHeader;
                    Ok(StepOutcome::Continue)
                } else if read_any {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::WouldBlock)
                }
            }
            FcgiState::Done => {
                self.state = ConnectionState::HandleResponseHeader;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Picks another host/process for `ctx` after a dead or overloaded
    /// backend (spec §4.3), capping attempts so a host that is entirely
    /// unreachable fails the request instead of looping forever. Releases
    /// the abandoned process's load and marks the newly picked one used,
    /// so `Host::pick_proc`'s smallest-load rule stays accurate across a
    /// reconnect.
    fn retry_fcgi(&mut self, ctx: &mut FcgiHandlerContext, shared: &mut ServerShared) -> bool {
        ctx.reconnect_count += 1;
        if ctx.reconnect_count > 5 {
            return false;
        }
        let Some(ext_idx) = self.fcgi_ext_idx else { return false };
        self.release_fcgi_load(ctx, shared);

        let Some(ext) = shared.fastcgi.get(ext_idx) else { return false };
        let Some(host_idx) = ext.pick_host() else { return false };
        let Some(proc_id) = ext.hosts[host_idx].pick_proc() else { return false };
        ctx.host_idx = host_idx;
        ctx.proc_id = proc_id;
        if let Some(proc) = shared.fastcgi.get_mut(ext_idx).and_then(|e| e.hosts.get_mut(host_idx)).and_then(|h| h.proc_mut(proc_id)) {
            proc.mark_used();
        }
        ctx.socket = None;
        if let Some(tok) = ctx.mio_token.take() {
            shared.stale_fcgi_tokens.push(tok);
            shared.cur_fds = shared.cur_fds.saturating_sub(1);
        }
        ctx.state = crate::fastcgi::FcgiState::Init;
        true
    }

    /// Decrements the load counter on whichever process `ctx` is (or was)
    /// assigned to, matching the `mark_used`/`release` pair `static_file.rs`
    /// and this module's `retry_fcgi` use when a process is picked.
    pub(crate) fn release_fcgi_load(&self, ctx: &FcgiHandlerContext, shared: &mut ServerShared) {
        let Some(ext_idx) = self.fcgi_ext_idx else { return };
        if let Some(proc) = shared
            .fastcgi
            .get_mut(ext_idx)
            .and_then(|e| e.hosts.get_mut(ctx.host_idx))
            .and_then(|h| h.proc_mut(ctx.proc_id))
        {
            proc.release();
        }
    }

    /// Handles a post-connect I/O error from the backend socket (spec §8
    /// Scenario 5, "FastCGI death mid-write"): with nothing written yet,
    /// the request hasn't been seen by the backend, so reconnect via
    /// `retry_fcgi` same as an `Init`-state failure; once any bytes have
    /// gone out, the backend may already be acting on a partial request,
    /// so fail it outright rather than retry.
    fn handle_fcgi_io_error(&mut self, ctx: &mut FcgiHandlerContext, shared: &mut ServerShared, err: std::io::Error) -> StepOutcome {
        if ctx.bytes_written_to_backend == 0 && self.retry_fcgi(ctx, shared) {
            return StepOutcome::Continue;
        }
        self.fail_fcgi(crate::error::ServerError::Fatal(err.to_string()));
        self.closing = true;
        StepOutcome::Continue
    }

    /// Maps a `ServerError` the FastCGI layer gave up with onto its HTTP
    /// status and moves straight to response assembly (spec §7 "Error
    /// taxonomy").
    fn fail_fcgi(&mut self, err: crate::error::ServerError) {
        proxy_log::info!("fastcgi request failed: {err}");
        self.response = crate::http::handle_error(err.status_code(), self.s_cfg.as_deref());
        self.state = ConnectionState::HandleResponseHeader;
    }

    fn build_fcgi_params(&self) -> Vec<(String, String)> {
        let Some(r_cfg) = &self.r_cfg else { return Vec::new() };
        let (path_info, query_string) = match self.request.url.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (self.request.url.clone(), String::new()),
        };
        let input = EnvInput {
            method: self.request.method.as_str(),
            script_name: &r_cfg.path,
            path_info: &path_info,
            script_filename: self.physical_path.to_str().unwrap_or(""),
            document_root: &r_cfg.root,
            request_uri: &self.request.url,
            query_string: &query_string,
            server_protocol: &self.request.version,
            server_name: self.s_cfg.as_ref().map(|c| c.server_name.as_str()).unwrap_or(""),
            remote_addr: &self.peer_addr.ip().to_string(),
            remote_port: self.peer_addr.port(),
            https: false,
            headers: &self.request.headers,
            content_length: if self.request.body.is_empty() { None } else { Some(self.request.body.len()) },
        };
        crate::fastcgi::handler::build_params(&input)
    }

    /// Resolves an `X-Sendfile`/`X-LIGHTTPD-send-file` path into a real file
    /// chunk (spec §4.3 "Header filter"), discarding whatever STDOUT body
    /// bytes the backend sent alongside it. Returns `false` if the path
    /// can't be opened, so the caller can fall back to a 404.
    fn resolve_xsendfile(&mut self, path: &str) -> bool {
        let Ok(file) = std::fs::File::open(path) else {
            return false;
        };
        let Ok(metadata) = file.metadata() else {
            return false;
        };
        let len = metadata.len();
        self.response.set_header("content-length", &len.to_string());
        self.response.headers.remove("transfer-encoding");
        self.response_queue = ChunkQueue::new();
        self.response_queue
            .append_file(crate::chunk::Chunk::from_static_file(std::path::PathBuf::from(path), file, len));
        true
    }

    fn do_handle_response_header(&mut self, shared: &mut ServerShared) -> StepOutcome {
        let plugins = std::mem::take(&mut shared.plugins);
        for p in &plugins {
            let _ = p.handle_response_header(self);
        }
        shared.plugins = plugins;

        self.keep_alive_requests += 1;
        let max_keep_alive = self.s_cfg.as_ref().map(|c| c.max_keep_alive_requests).unwrap_or(100);
        let close = self.closing
            || self.keep_alive_requests >= max_keep_alive
            || self.request.headers.get("connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false);
        self.response.set_header("connection", if close { "close" } else { "keep-alive" });
        if close {
            self.closing = true;
        }

        self.header_bytes_pending = Some(self.response.to_bytes_headers_only());
        self.state = ConnectionState::WriteResponseHeader;
        StepOutcome::Continue
    }

    fn do_write_response_header(&mut self) -> std::io::Result<StepOutcome> {
        let Some(buf) = &mut self.header_bytes_pending else {
            self.state = ConnectionState::WriteResponseContent;
            return Ok(StepOutcome::Continue);
        };
        match std::io::Write::write(&mut self.stream, buf) {
            Ok(0) => Ok(StepOutcome::WouldBlock),
            Ok(n) => {
                buf.drain(..n);
                if buf.is_empty() {
                    self.header_bytes_pending = None;
                    if self.response_queue.is_empty() {
                        self.response_queue.append_mem(std::mem::take(&mut self.response.body));
                    }
                    self.state = ConnectionState::WriteResponseContent;
                }
                Ok(StepOutcome::Continue)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(StepOutcome::WouldBlock),
            Err(_) => {
                self.closing = true;
                self.state = ConnectionState::Close;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Drains `response_queue` through `write_backend`, gated by the
    /// per-connection and server-wide kilobyte-per-second ceilings (spec
    /// §4.5 "Traffic shaping"): once either budget for the current tick is
    /// spent, the socket's writable interest is dropped and the token is
    /// parked on `shared.throttled` until `job_list::run_trigger`
    /// replenishes both budgets on the next tick.
    fn do_write_response_content(&mut self, poll: &Poll, shared: &mut ServerShared) -> std::io::Result<StepOutcome> {
        if self.response_queue.is_empty() {
            self.state = ConnectionState::ResponseEnd;
            return Ok(StepOutcome::Continue);
        }

        let conn_ceiling = self.s_cfg.as_ref().map(|c| c.connection_kb_per_second).unwrap_or(0);
        let server_ceiling = self.s_cfg.as_ref().map(|c| c.server_kb_per_second).unwrap_or(0);
        let conn_exhausted = conn_ceiling > 0 && self.bytes_written_this_second >= conn_ceiling as u64 * 1024;
        let server_exhausted = server_ceiling > 0 && shared.bytes_written_this_second >= server_ceiling as u64 * 1024;
        if conn_exhausted || server_exhausted {
            shared.throttled.insert(self.token);
            poll.registry().reregister(&mut self.stream, self.token, Interest::READABLE)?;
            return Ok(StepOutcome::WouldBlock);
        }

        let progress = self.write_backend.write_chunk_queue(&mut self.stream, &mut self.response_queue)?;
        self.bytes_written_this_second += progress.written;
        shared.bytes_written_this_second += progress.written;
        if self.response_queue.is_empty() {
            self.state = ConnectionState::ResponseEnd;
            Ok(StepOutcome::Continue)
        } else if progress.would_block {
            Ok(StepOutcome::WouldBlock)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    fn do_response_end(&mut self, poll: &Poll, shared: &mut ServerShared) -> std::io::Result<StepOutcome> {
        if self.closing {
            self.state = ConnectionState::Close;
            return Ok(StepOutcome::Continue);
        }

        if let Some(ctx) = &self.fcgi_ctx {
            self.release_fcgi_load(ctx, shared);
        }

        let plugins = std::mem::take(&mut shared.plugins);
        for p in &plugins {
            p.connection_reset(self);
        }
        shared.plugins = plugins;

        self.request.finish_request();
        self.response = HttpResponse::new(200, "OK");
        self.fcgi_ctx = None;
        self.loops_this_request = 0;
        self.r_cfg = None;
        self.fcgi_ext_idx = None;

        poll.registry().reregister(&mut self.stream, self.token, Interest::READABLE)?;

        if !self.request.buffer.is_empty() && self.request.state == ParsingState::RequestLine {
            self.state = ConnectionState::ValidateRequestHeader;
            Ok(StepOutcome::Continue)
        } else {
            self.state = ConnectionState::ReadRequestHeader;
            Ok(StepOutcome::WouldBlock)
        }
    }

    fn do_error(&mut self) -> StepOutcome {
        self.closing = true;
        self.state = ConnectionState::HandleResponseHeader;
        StepOutcome::Continue
    }

    pub fn should_close(&self) -> bool {
        self.closing && self.header_bytes_pending.is_none() && self.response_queue.is_empty()
    }

    pub fn reregister_for_write(&mut self, poll: &Poll) -> std::io::Result<()> {
        poll.registry().reregister(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Forcibly fails a FastCGI request that has been in flight past the
    /// 60-second budget (spec §4.4 "Request timeout"): tears down the
    /// backend socket, releases its load/request-id, and answers 500,
    /// closing the connection afterward.
    pub fn force_fcgi_timeout(&mut self, poll: &Poll, shared: &mut ServerShared) {
        if let Some(ctx) = self.fcgi_ctx.take() {
            self.release_fcgi_load(&ctx, shared);
            shared.fcgi_request_ids.release(ctx.request_id);
            if let Some(tok) = ctx.mio_token {
                shared.stale_fcgi_tokens.push(tok);
                shared.cur_fds = shared.cur_fds.saturating_sub(1);
            }
        }
        proxy_log::warn!("fastcgi request exceeded 60s timeout, forcing 500");
        self.response = crate::http::handle_error(500, self.s_cfg.as_deref());
        self.closing = true;
        self.state = ConnectionState::HandleResponseHeader;
        let _ = self.reregister_for_write(poll);
    }
}
