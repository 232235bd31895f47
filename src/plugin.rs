//! Plugin capability set (spec §6). A plugin is a set of hooks the
//! connection state machine invokes at fixed points; hooks return a
//! `HookResult` rather than throwing, so the calling chain never needs to
//! catch anything. Grounded in Design Notes §9's instruction to model the
//! slot table as "an ordered collection of trait objects... never a dynamic
//! dispatch on ad-hoc reflection": `Plugin` is `dyn Plugin`, and the one
//! escape hatch (`Any`) is confined to the per-connection slot table below.

use std::any::Any;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::server::ServerShared;

/// Outcome of a single hook invocation. `Comeback` re-enters the
/// `handle_request_header` chain from the top (guarded by
/// `Connection::loops_per_request`); `Finished` short-circuits the chain
/// with the carried status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    GoOn,
    Finished(u16),
    Comeback,
    WaitForEvent,
    WaitForFd,
    Error(u16),
}

/// Every hook defaults to a no-op `GoOn` so a plugin only implements the
/// handful it cares about, matching the teacher's habit of one handler
/// function per concern (`handle_get`, `handle_error`) rather than a single
/// do-everything trait.
pub trait Plugin: Any {
    fn name(&self) -> &'static str;

    fn init(&mut self) {}
    fn cleanup(&mut self) {}

    /// Called once, after configuration parsing, with every virtual
    /// host's resolved config (spec §6 "set_defaults: After configuration
    /// parsing"). Default no-op: neither built-in plugin has config-driven
    /// defaults to precompute.
    fn set_defaults(&mut self, _configs: &[Arc<ServerConfig>]) {}

    fn connection_reset(&self, _conn: &mut Connection) {}

    fn handle_uri_raw(&self, _conn: &mut Connection) -> HookResult {
        HookResult::GoOn
    }

    fn handle_uri_clean(&self, _conn: &mut Connection) -> HookResult {
        HookResult::GoOn
    }

    fn handle_docroot(&self, _conn: &mut Connection) -> HookResult {
        HookResult::GoOn
    }

    fn handle_physical_path(&self, _conn: &mut Connection) -> HookResult {
        HookResult::GoOn
    }

    fn handle_start_backend(&self, _conn: &mut Connection, _shared: &mut ServerShared) -> HookResult {
        HookResult::GoOn
    }

    /// Produces (or rewrites) bytes for a backend request body (spec §6
    /// "handle_send_request_content"), called once per request just
    /// before the FastCGI handler frames `STDIN`. Default no-op: the
    /// request body built by HTTP framing passes through unmodified.
    fn handle_send_request_content(&self, _conn: &Connection, _body: &mut Vec<u8>) {}

    /// Drives a backend subrequest (spec §6 "handle_subrequest"), called
    /// once per `HANDLE_SUBREQUEST` turn before the built-in
    /// FastCGI-or-404 fallback runs. A plugin wanting a backend other than
    /// FastCGI (or static serving) would short-circuit here.
    fn handle_subrequest(&self, _conn: &mut Connection, _shared: &mut ServerShared) -> HookResult {
        HookResult::GoOn
    }

    fn handle_response_header(&self, _conn: &mut Connection) -> HookResult {
        HookResult::GoOn
    }

    fn handle_connection_close(&self, _conn: &mut Connection) {}

    fn handle_trigger(&self, _shared: &mut ServerShared) {}

    /// Called when the connection is about to return to the demultiplexer
    /// with no further progress possible this turn (spec §6
    /// "handle_joblist"). Default no-op: neither built-in plugin needs to
    /// observe yield points.
    fn handle_joblist(&self, _conn: &mut Connection) {}
}

/// Per-connection opaque state for a plugin, indexed by the id the plugin
/// was assigned at registration (Design Notes §9: a slice of opaque slots,
/// not module-level globals). `downcast_ref`/`downcast_mut` are the only
/// place `Any` appears.
pub type PluginSlots = Vec<Option<Box<dyn Any>>>;

pub fn new_slots(plugin_count: usize) -> PluginSlots {
    (0..plugin_count).map(|_| None).collect()
}
