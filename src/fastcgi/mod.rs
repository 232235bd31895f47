pub mod handler;
pub mod host;
pub mod process;
pub mod protocol;

pub use handler::{FcgiHandlerContext, FcgiState};
pub use host::{Host, Role, Transport};
pub use process::{Membership, Process, ProcessState};

use std::io;

use crate::config::FastcgiExtensionConfig;

/// Runtime counterpart of `FastcgiExtensionConfig`: the extension key plus
/// the live host pool. One `Extension` exists per `(server_name,
/// extension-config)` pair built at startup; `ServerShared` holds the flat
/// list and a connection looks one up by matching the URL against
/// `matches()`.
pub struct Extension {
    pub server_name: String,
    pub pattern: String,
    pub is_prefix: bool,
    pub hosts: Vec<Host>,
    pub allow_xsendfile: bool,
    pub role: Role,
}

impl Extension {
    pub fn from_config(server_name: &str, cfg: &FastcgiExtensionConfig) -> io::Result<Self> {
        let is_prefix = cfg.extension.ends_with('/');
        let hosts = cfg
            .hosts
            .iter()
            .map(Host::from_config)
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Extension {
            server_name: server_name.to_string(),
            pattern: cfg.extension.clone(),
            is_prefix,
            hosts,
            allow_xsendfile: cfg.allow_xsendfile,
            role: if cfg.mode_authorizer { Role::Authorizer } else { Role::Responder },
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        if self.is_prefix {
            url.starts_with(self.pattern.as_str())
        } else {
            url.ends_with(self.pattern.as_str())
        }
    }

    /// Host with the smallest `host.load()` among hosts that have at least
    /// one `RUNNING` process (spec §4.3).
    pub fn pick_host(&self) -> Option<usize> {
        self.hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.has_running_proc())
            .min_by_key(|(_, h)| h.load())
            .map(|(idx, _)| idx)
    }
}
