//! The per-second trigger (spec §4.5): sweeps idle connections, ticks every
//! FastCGI host's control plane, and replenishes the traffic-shaping
//! budget. Grounded in the teacher's `timeouts.rs::process`, which walks
//! `server.connections` once per tick comparing a last-activity timestamp
//! against a fixed timeout and evicts stale entries; extended here with
//! the FastCGI host health tick (spec §4.4) and the `server_kb_per_second`/
//! `connection_kb_per_second` ceiling reset (spec §4.5 "Traffic shaping").
//! Unlike the teacher, reader inactivity, writer inactivity, and the
//! `CLOSE` linger window are tracked as the three distinct timestamps spec
//! §4.1 names (`read_idle_ts`/`write_request_ts`/`close_timeout_ts`)
//! rather than one undifferentiated idle clock.

use std::collections::HashMap;
use std::time::Instant;

use mio::{Poll, Token};

use crate::connection::{Connection, ConnectionState};
use crate::server::ServerShared;

/// Runs once per elapsed ~1s tick. Connections past their applicable
/// timeout (read-idle, write-request, or close-linger, depending on
/// current state) are dropped; every FastCGI host gets its once-a-second
/// health/recovery pass; and both the per-connection and server-wide
/// traffic-shaping counters reset for the new tick.
pub fn run_trigger(shared: &mut ServerShared, connections: &mut HashMap<Token, Connection>, poll: &Poll) {
    let now = Instant::now();

    connections.retain(|_, conn| {
        let expired = match conn.state {
            ConnectionState::Close => conn
                .close_ts
                .is_some_and(|ts| now.duration_since(ts) > conn.close_timeout()),
            ConnectionState::WriteResponseHeader | ConnectionState::WriteResponseContent => {
                now.duration_since(conn.write_request_ts) > conn.write_request_timeout()
            }
            _ => now.duration_since(conn.read_idle_ts) > conn.read_idle_timeout(),
        };
        if expired {
            let _ = poll.registry().deregister(&mut conn.stream);
            return false;
        }
        true
    });

    for conn in connections.values_mut() {
        conn.bytes_written_this_second = 0;
    }
    shared.bytes_written_this_second = 0;

    for ext in &mut shared.fastcgi {
        for host in &mut ext.hosts {
            host.tick();
        }
    }

    let plugins = std::mem::take(&mut shared.plugins);
    for p in &plugins {
        p.handle_trigger(shared);
    }
    shared.plugins = plugins;

    // spec §4.4 "Request timeout": a connection in the FastCGI handler for
    // more than 60s since request start is forced to a 500 and closed.
    let timed_out: Vec<Token> = connections
        .iter()
        .filter(|(_, conn)| conn.fcgi_ctx.as_ref().is_some_and(|ctx| ctx.timed_out()))
        .map(|(&token, _)| token)
        .collect();
    for token in timed_out {
        if let Some(conn) = connections.get_mut(&token) {
            conn.force_fcgi_timeout(poll, shared);
        }
    }
}
