//! Owns every listener, connection, and piece of cross-connection shared
//! state (spec §5 "Global state": "pass it explicitly to every component
//! rather than reinstating it as module-level state"). Built fresh — the
//! teacher's own `src/server.rs` is a dead 15-line `Token` wrapper and its
//! `src/bin/main.rs` calls a `Server` that was never actually assembled —
//! but the accept/dispatch shape follows what `http/http_connection.rs`'s
//! `handle_read_phase`/`handle_write_phase`/`handle_post_write_update`
//! already do with `Interest::READABLE`/`WRITABLE` reregistration.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::AppConfig;
use crate::connection::{Connection, StepOutcome};
use crate::error::Result;
use crate::fastcgi::handler::{FcgiSocket, RequestIdAllocator};
use crate::fastcgi::{Extension, FcgiState};
use crate::job_list;
use crate::plugin::Plugin;
use crate::plugins::{ErrorPagePlugin, StaticFilePlugin};

use std::sync::Arc;

/// How many spare file descriptors the listener keeps in reserve before it
/// starts deferring `accept()` (spec §6 "Listener": `cur_fds + safety_margin
/// > max_fds`).
const FD_SAFETY_MARGIN: usize = 16;

/// Everything a connection's step function and a plugin hook need that
/// isn't theirs alone: the plugin registry, the live FastCGI extension/host
/// pool, the request-id allocator, and the traffic-shaping/fd-accounting
/// counters (spec §6, §4.5).
pub struct ServerShared {
    pub plugins: Vec<Box<dyn Plugin>>,
    pub fastcgi: Vec<Extension>,
    pub fcgi_request_ids: RequestIdAllocator,
    pub cur_fds: usize,
    pub max_fds: usize,
    /// Bytes written across every connection during the current
    /// traffic-shaping tick, reset by `job_list::run_trigger`.
    pub bytes_written_this_second: u64,
    /// Connections parked after hitting a traffic-shaping ceiling, waiting
    /// for the next tick to restore their writable interest.
    pub throttled: HashSet<Token>,
    /// FastCGI backend tokens a retried connection has abandoned (spec
    /// §4.3 "Request id allocation" neighbor: the socket itself is already
    /// closed by `FcgiSocket`'s `Drop`, but `Server::fcgi_token_map` still
    /// needs the entry removed). Drained once per `drive_connection` call.
    pub stale_fcgi_tokens: Vec<Token>,
}

pub struct Server {
    listeners: HashMap<Token, TcpListener>,
    listener_configs: HashMap<Token, Vec<Arc<crate::config::ServerConfig>>>,
    connections: HashMap<Token, Connection>,
    /// Maps a FastCGI backend socket's poll token back to the owning
    /// connection's token, since the backend socket is registered
    /// separately from the client socket (spec §4.3 data plane).
    fcgi_token_map: HashMap<Token, Token>,
    shared: ServerShared,
    next_token: usize,
}

impl Server {
    pub fn new(config: AppConfig, poll: &Poll) -> Result<Self> {
        let configs = crate::config::validate_configs(config.servers);

        let mut grouped: HashMap<(String, u16), Vec<Arc<crate::config::ServerConfig>>> = HashMap::new();
        for cfg in configs {
            let cfg = Arc::new(cfg);
            for &port in &cfg.ports {
                grouped.entry((cfg.host.clone(), port)).or_default().push(Arc::clone(&cfg));
            }
        }

        let mut listeners = HashMap::new();
        let mut listener_configs = HashMap::new();
        let mut next_token = 0usize;

        for ((host, port), vhosts) in grouped {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let mut listener = TcpListener::bind(addr)?;
            let token = Token(next_token);
            next_token += 1;
            poll.registry().register(&mut listener, token, Interest::READABLE)?;
            proxy_log::info!("listening on {}:{} ({} virtual host(s))", host, port, vhosts.len());
            listeners.insert(token, listener);
            listener_configs.insert(token, vhosts);
        }

        let mut fastcgi = Vec::new();
        for vhosts in listener_configs.values() {
            for cfg in vhosts {
                for ext_cfg in &cfg.fastcgi {
                    fastcgi.push(Extension::from_config(&cfg.server_name, ext_cfg)?);
                }
            }
        }

        let all_configs: Vec<Arc<crate::config::ServerConfig>> = listener_configs.values().flatten().cloned().collect();

        let mut plugins: Vec<Box<dyn Plugin>> = vec![Box::new(StaticFilePlugin), Box::new(ErrorPagePlugin)];
        for p in &mut plugins {
            p.init();
            p.set_defaults(&all_configs);
        }

        Ok(Server {
            listeners,
            listener_configs,
            connections: HashMap::new(),
            fcgi_token_map: HashMap::new(),
            shared: ServerShared {
                plugins,
                fastcgi,
                fcgi_request_ids: RequestIdAllocator::default(),
                cur_fds: 0,
                max_fds: read_rlimit_nofile(),
                bytes_written_this_second: 0,
                throttled: HashSet::new(),
                stale_fcgi_tokens: Vec::new(),
            },
            next_token,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// The event loop (spec §4.5): block in the demultiplexer for up to one
    /// tick, dispatch whatever became ready, then run the per-second
    /// trigger once a tick has actually elapsed.
    pub fn run(mut self, poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_tick = Instant::now();

        loop {
            if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(1))) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();
                if self.listeners.contains_key(&token) {
                    self.accept_loop(token, &poll);
                    continue;
                }
                let owner = self.fcgi_token_map.get(&token).copied().unwrap_or(token);
                self.drive_connection(owner, &poll);
            }

            if last_tick.elapsed() >= Duration::from_secs(1) {
                job_list::run_trigger(&mut self.shared, &mut self.connections, &poll);
                self.reenable_throttled(&poll);
                last_tick = Instant::now();
            }
        }
    }

    fn accept_loop(&mut self, token: Token, poll: &Poll) {
        loop {
            if self.shared.cur_fds + FD_SAFETY_MARGIN > self.shared.max_fds {
                proxy_log::warn!("fd budget exhausted ({}/{}), deferring accept", self.shared.cur_fds, self.shared.max_fds);
                return;
            }
            let Some(listener) = self.listeners.get(&token) else { return };
            let (mut stream, peer_addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    proxy_log::warn!("accept failed: {}", e);
                    return;
                }
            };

            let conn_token = self.alloc_token();
            if let Err(e) = poll.registry().register(&mut stream, conn_token, Interest::READABLE) {
                proxy_log::warn!("failed to register accepted socket: {}", e);
                continue;
            }
            self.shared.cur_fds += 1;

            let config_list = self.listener_configs.get(&token).cloned().unwrap_or_default();
            let plugin_count = self.shared.plugins.len();
            let conn = Connection::new(stream, conn_token, config_list, plugin_count, peer_addr);
            self.connections.insert(conn_token, conn);
        }
    }

    fn drive_connection(&mut self, token: Token, poll: &Poll) {
        let Some(mut conn) = self.connections.remove(&token) else { return };

        let outcome = conn.step(poll, &mut self.shared);
        match outcome {
            Ok(StepOutcome::Done) | Err(_) => {
                self.cleanup_connection(conn, poll);
            }
            Ok(_) if conn.should_close() => {
                self.cleanup_connection(conn, poll);
            }
            Ok(_) => {
                if let Err(e) = self.sync_fcgi_registration(&mut conn, poll) {
                    proxy_log::warn!("fastcgi registration failed: {}", e);
                }
                for tok in self.shared.stale_fcgi_tokens.drain(..) {
                    self.fcgi_token_map.remove(&tok);
                }
                self.connections.insert(token, conn);
            }
        }
    }

    fn cleanup_connection(&mut self, mut conn: Connection, poll: &Poll) {
        let plugins = std::mem::take(&mut self.shared.plugins);
        for p in &plugins {
            p.handle_connection_close(&mut conn);
        }
        self.shared.plugins = plugins;

        let _ = poll.registry().deregister(&mut conn.stream);
        if let Some(ctx) = conn.fcgi_ctx.take() {
            conn.release_fcgi_load(&ctx, &mut self.shared);
            if let Some(tok) = ctx.mio_token {
                self.fcgi_token_map.remove(&tok);
                // The backend socket's fd was counted separately from the
                // client socket's when `sync_fcgi_registration` registered
                // it; its `Drop` (via `ctx` going out of scope) closes the
                // fd here, so `cur_fds` drops by one for each.
                self.shared.cur_fds = self.shared.cur_fds.saturating_sub(1);
            }
            self.shared.fcgi_request_ids.release(ctx.request_id);
        }
        self.shared.cur_fds = self.shared.cur_fds.saturating_sub(1);
        self.shared.throttled.remove(&conn.token);
    }

    /// Keeps the FastCGI backend socket's poll registration in sync with
    /// the handler's current `FcgiState` (spec §4.3): registered for
    /// writability while connecting or writing, for readability while
    /// reading the response, deregistered implicitly when the context is
    /// dropped (its socket's `Drop` closes the fd).
    fn sync_fcgi_registration(&mut self, conn: &mut Connection, poll: &Poll) -> std::io::Result<()> {
        let conn_token = conn.token;
        let Some(ctx) = conn.fcgi_ctx.as_mut() else { return Ok(()) };
        let Some(socket) = ctx.socket.as_mut() else { return Ok(()) };
        let interest = match ctx.state {
            FcgiState::ConnectDelayed | FcgiState::Write => Interest::WRITABLE,
            FcgiState::Read => Interest::READABLE,
            _ => return Ok(()),
        };

        match ctx.mio_token {
            Some(tok) => match socket {
                FcgiSocket::Unix(s) => poll.registry().reregister(s, tok, interest),
                FcgiSocket::Tcp(s) => poll.registry().reregister(s, tok, interest),
            },
            None => {
                let tok = self.alloc_token();
                let result = match socket {
                    FcgiSocket::Unix(s) => poll.registry().register(s, tok, interest),
                    FcgiSocket::Tcp(s) => poll.registry().register(s, tok, interest),
                };
                result?;
                ctx.mio_token = Some(tok);
                self.fcgi_token_map.insert(tok, conn_token);
                self.shared.cur_fds += 1;
                Ok(())
            }
        }
    }

    /// Restores writable interest for every connection the traffic shaper
    /// parked last tick (spec §4.5: "parked... until the next tick
    /// replenishes the budget").
    fn reenable_throttled(&mut self, poll: &Poll) {
        let tokens: Vec<Token> = self.shared.throttled.drain().collect();
        for token in tokens {
            if let Some(conn) = self.connections.get_mut(&token) {
                let _ = poll.registry().reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
            }
        }
    }
}

fn read_rlimit_nofile() -> usize {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ok == 0 && limit.rlim_cur > 0 && limit.rlim_cur != libc::RLIM_INFINITY {
        limit.rlim_cur as usize
    } else {
        1024
    }
}
