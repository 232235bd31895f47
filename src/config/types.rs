use std::collections::HashMap;
use derive_yaml::FromYaml;
use crate::config::parser::FromYaml; // Import trait

// --- Constants ---
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "_";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576; // 1MB
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_FILE: &str = "index.html";
pub const DEFAULT_MAX_KEEP_ALIVE_REQUESTS: usize = 100;
pub const DEFAULT_MIN_PROCS: usize = 1;
pub const DEFAULT_MAX_PROCS: usize = 4;
pub const DEFAULT_MAX_LOAD_PER_PROC: usize = 1;
pub const DEFAULT_IDLE_TIMEOUT: u64 = 60;
pub const DEFAULT_DISABLE_TIME: u64 = 5;
pub const DEFAULT_MAX_REQUESTS_PER_PROC: usize = 0; // 0 == unlimited
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1_048_576; // 8MB, headers + body
pub const DEFAULT_READ_IDLE_TIMEOUT: u64 = 60;
pub const DEFAULT_WRITE_REQUEST_TIMEOUT: u64 = 60;
pub const DEFAULT_CLOSE_TIMEOUT: u64 = 3;

#[derive(Debug, Clone, FromYaml)]
pub struct RouteConfig {
    pub path: String,
    pub methods: Vec<String>,
    pub redirection: Option<String>,
    pub redirect_code: Option<u16>,
    pub root: String,
    pub default_file: String,
    pub cgi_ext: Option<String>,
    pub cgi_path: Option<String>,
    pub upload_dir: String,
    pub autoindex: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ROUTE_PATH.to_string(),
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            redirection: None,
            redirect_code: None,
            root: DEFAULT_ROOT.to_string(),
            default_file: DEFAULT_FILE.to_string(),
            cgi_ext: None,
            cgi_path: None,
            upload_dir: String::new(),
            autoindex: false,
        }
    }
}

/// A FastCGI host's static launch and scaling policy. A host with `bin_path`
/// set spawns all of its own processes locally; one without represents a
/// single remote endpoint treated as a pool of one.
#[derive(Debug, Clone, FromYaml)]
pub struct FastcgiHostConfig {
    pub host: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub bin_path: Option<String>,
    pub min_procs: usize,
    pub max_procs: usize,
    pub max_load_per_proc: usize,
    pub idle_timeout: u64,
    pub disable_time: u64,
    pub max_requests_per_proc: usize,
    pub check_local: bool,
}

impl Default for FastcgiHostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            socket: None,
            bin_path: None,
            min_procs: DEFAULT_MIN_PROCS,
            max_procs: DEFAULT_MAX_PROCS,
            max_load_per_proc: DEFAULT_MAX_LOAD_PER_PROC,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            disable_time: DEFAULT_DISABLE_TIME,
            max_requests_per_proc: DEFAULT_MAX_REQUESTS_PER_PROC,
            check_local: true,
        }
    }
}

#[derive(Debug, Clone, FromYaml)]
pub struct FastcgiExtensionConfig {
    pub extension: String,
    pub hosts: Vec<FastcgiHostConfig>,
    pub allow_xsendfile: bool,
    pub mode_authorizer: bool,
}

impl Default for FastcgiExtensionConfig {
    fn default() -> Self {
        Self {
            extension: String::new(),
            hosts: Vec::new(),
            allow_xsendfile: false,
            mode_authorizer: false,
        }
    }
}

#[derive(Debug, Clone, FromYaml)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub server_name: String,
    pub default_server: bool,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: usize,
    pub routes: Vec<RouteConfig>,
    pub fastcgi: Vec<FastcgiExtensionConfig>,
    pub max_keep_alive_requests: usize,
    pub server_kb_per_second: usize,
    pub connection_kb_per_second: usize,
    pub error_handler: Option<String>,
    /// Ceiling on total request size (headers + body) before a 413 is sent
    /// (spec §4.1 `READ_REQUEST_HEADER`/`READ_REQUEST_CONTENT`), distinct
    /// from `client_max_body_size`'s per-body accounting.
    pub max_request_size: usize,
    /// Bounds reader inactivity (`read_idle_ts`, spec §4.1 "Timeouts").
    pub read_idle_timeout: u64,
    /// Bounds writer inactivity while a write is in progress
    /// (`write_request_ts`, spec §4.1 "Timeouts").
    pub write_request_timeout: u64,
    /// How long `CLOSE` lingers draining a peer FIN before the connection
    /// is torn down (`close_timeout_ts`, spec §4.1 "CLOSE").
    pub close_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ports: vec![DEFAULT_PORT],
            server_name: DEFAULT_SERVER_NAME.to_string(),
            default_server: false,
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            routes: Vec::new(),
            fastcgi: Vec::new(),
            max_keep_alive_requests: DEFAULT_MAX_KEEP_ALIVE_REQUESTS,
            server_kb_per_second: 0, // 0 == unshaped
            connection_kb_per_second: 0,
            error_handler: None,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            read_idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
            write_request_timeout: DEFAULT_WRITE_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Longest-prefix match against configured route paths, then a method check.
    pub fn find_route(&self, url: &str, method: &str) -> Result<&RouteConfig, RoutingError> {
        let mut best: Option<&RouteConfig> = None;
        for route in &self.routes {
            if url.starts_with(route.path.as_str())
                && best.map_or(true, |b| route.path.len() > b.path.len())
            {
                best = Some(route);
            }
        }
        match best {
            Some(route) if route.methods.iter().any(|m| m == method) => Ok(route),
            Some(_) => Err(RoutingError::MethodNotAllowed),
            None => Err(RoutingError::NotFound),
        }
    }

    /// Matches a URI suffix (e.g. `.php`) or, when the key ends in `/`, a
    /// path prefix (e.g. `/fcgi-bin/`) — mirrors `fastcgi::Extension::matches`.
    pub fn find_fastcgi(&self, url: &str) -> Option<&FastcgiExtensionConfig> {
        self.fastcgi.iter().find(|ext| {
            if ext.extension.ends_with('/') {
                url.starts_with(ext.extension.as_str())
            } else {
                url.ends_with(ext.extension.as_str())
            }
        })
    }
}

#[derive(Debug)]
pub enum RoutingError {
    NotFound,
    MethodNotAllowed,
}

#[derive(Debug, Clone, FromYaml)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { servers: Vec::new() }
    }
}
