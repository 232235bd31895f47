//! A logical FastCGI backend address plus its process arena and
//! load-balanced dispatch, grounded in `mod_fastcgi.c`'s `fcgi_host`
//! struct and the per-second tick around lines ~3580-3680.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::FastcgiHostConfig;

use super::process::{Membership, Process, ProcessState};

/// FastCGI request role (spec §6: responder default, authorizer gates and
/// can pivot to static serving, filter transforms a file under the
/// backend's control — filter is accepted by the wire protocol but this
/// crate's extension config only ever selects responder/authorizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn wire_value(self) -> u16 {
        match self {
            Role::Responder => crate::fastcgi::protocol::FCGI_RESPONDER,
            Role::Authorizer => crate::fastcgi::protocol::FCGI_AUTHORIZER,
            Role::Filter => crate::fastcgi::protocol::FCGI_FILTER,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// One backend address: either a pool of locally-spawned processes sharing
/// a listening socket, or a single remote endpoint treated as a pool of
/// one (spec §3 invariant: `bin_path` set implies all-local and
/// `min_procs == max_procs`; absent implies exactly one remote proc).
pub struct Host {
    pub transport: Transport,
    pub bin_path: Option<String>,
    pub min_procs: usize,
    pub max_procs: usize,
    pub max_load_per_proc: usize,
    pub idle_timeout: Duration,
    pub disable_time: Duration,
    pub max_requests_per_proc: usize,
    /// Process arena: index is the stable `id`. A process never moves
    /// slots; `membership` tracks which logical list it's on.
    pub procs: Vec<Process>,
    listen_fd: Option<RawFd>,
    next_id: usize,
}

impl Host {
    pub fn from_config(cfg: &FastcgiHostConfig) -> io::Result<Self> {
        let transport = if let Some(path) = &cfg.socket {
            Transport::Unix(PathBuf::from(path))
        } else {
            let port = cfg.port.unwrap_or(0);
            let addr = format!("{}:{}", cfg.host, port)
                .parse::<SocketAddr>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            Transport::Tcp(addr)
        };

        let mut host = Host {
            transport,
            bin_path: cfg.bin_path.clone(),
            min_procs: cfg.min_procs.max(1),
            max_procs: cfg.max_procs.max(cfg.min_procs).max(1),
            max_load_per_proc: cfg.max_load_per_proc.max(1),
            idle_timeout: Duration::from_secs(cfg.idle_timeout),
            disable_time: Duration::from_secs(cfg.disable_time),
            max_requests_per_proc: cfg.max_requests_per_proc,
            procs: Vec::new(),
            listen_fd: None,
            next_id: 0,
        };

        if host.bin_path.is_some() {
            host.spawn_all()?;
        } else {
            // Exactly one process represents the remote endpoint.
            let mut p = Process::new(host.alloc_id(), false);
            p.state = ProcessState::Running;
            host.procs.push(p);
        }

        Ok(host)
    }

    fn alloc_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Load of the host as seen by the extension-level picker: sum of the
    /// load of every active, reachable process.
    pub fn load(&self) -> usize {
        self.procs
            .iter()
            .filter(|p| p.membership == Membership::Active)
            .filter(|p| matches!(p.state, ProcessState::Running | ProcessState::Overloaded))
            .map(|p| p.load)
            .sum()
    }

    pub fn active_procs(&self) -> usize {
        self.procs
            .iter()
            .filter(|p| p.membership == Membership::Active)
            .filter(|p| matches!(p.state, ProcessState::Running | ProcessState::Overloaded))
            .count()
    }

    pub fn has_running_proc(&self) -> bool {
        self.procs.iter().any(|p| p.is_available())
    }

    /// Process with smallest load among `Running` ones (spec §4.3).
    pub fn pick_proc(&self) -> Option<usize> {
        self.procs
            .iter()
            .filter(|p| p.is_available())
            .min_by_key(|p| p.load)
            .map(|p| p.id)
    }

    pub fn proc_mut(&mut self, id: usize) -> Option<&mut Process> {
        self.procs.iter_mut().find(|p| p.id == id)
    }

    pub fn proc(&self, id: usize) -> Option<&Process> {
        self.procs.iter().find(|p| p.id == id)
    }

    /// Fork `min_procs` local children listening on a freshly bound
    /// socket, matching `fcgi_spawn_connection` (mod_fastcgi.c:763): bind
    /// first so the parent retains the listen fd for future reconnects,
    /// then one fork-dup2-execve sequence per process.
    fn spawn_all(&mut self) -> io::Result<()> {
        self.bind_listener()?;
        for _ in 0..self.min_procs {
            self.spawn_one()?;
        }
        Ok(())
    }

    fn bind_listener(&mut self) -> io::Result<()> {
        if self.listen_fd.is_some() {
            return Ok(());
        }
        let fd = match &self.transport {
            Transport::Unix(path) => {
                let _ = std::fs::remove_file(path);
                let listener = std::os::unix::net::UnixListener::bind(path)?;
                let fd = std::os::unix::io::IntoRawFd::into_raw_fd(listener);
                fd
            }
            Transport::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr)?;
                std::os::unix::io::IntoRawFd::into_raw_fd(listener)
            }
        };
        self.listen_fd = Some(fd);
        Ok(())
    }

    /// One `fork`+`dup2`+`execve` cycle onto a new arena slot, grounded in
    /// `fcgi_spawn_connection` (mod_fastcgi.c:763-990): the child becomes
    /// a session leader, dups the listen socket to fd 0 (`FCGI_LISTENSOCK_
    /// FILENO`), closes everything else, builds the CGI-style environment
    /// (plus `PHP_FCGI_CHILDREN` if absent), `chdir`s into the binary's
    /// directory, then `execve`s. The parent waits ~100ms and treats an
    /// early exit as fatal to startup (spec §4.4).
    fn spawn_one(&mut self) -> io::Result<()> {
        let bin_path = self
            .bin_path
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no bin_path to spawn"))?;
        let listen_fd = self.listen_fd.expect("listener bound before spawn");

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }

        if pid == 0 {
            unsafe {
                libc::setsid();
                libc::dup2(listen_fd, 0);
                let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(256);
                for fd in 3..max_fd as RawFd {
                    if fd != listen_fd {
                        libc::close(fd);
                    }
                }
            }

            let dir = std::path::Path::new(&bin_path)
                .parent()
                .unwrap_or_else(|| std::path::Path::new("."));
            let _ = std::env::set_current_dir(dir);

            if std::env::var_os("PHP_FCGI_CHILDREN").is_none() {
                unsafe { std::env::set_var("PHP_FCGI_CHILDREN", "1") };
            }

            let err = exec_program(&bin_path);
            // execve only returns on failure.
            eprintln!("execve failed for {}: {}", bin_path, err);
            std::process::exit(127);
        }

        std::thread::sleep(Duration::from_millis(100));
        let mut status = 0i32;
        let waited = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if waited == pid {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("fastcgi child {bin_path} exited immediately at startup"),
            ));
        }

        let id = self.alloc_id();
        let mut proc = Process::new(id, true);
        proc.state = ProcessState::Running;
        proc.pid = Some(pid);
        self.procs.push(proc);
        Ok(())
    }

    fn respawn_slot(&mut self, slot_idx: usize) -> io::Result<()> {
        self.bind_listener()?;
        let bin_path = self
            .bin_path
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no bin_path to respawn"))?;
        let listen_fd = self.listen_fd.expect("listener bound before respawn");

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            unsafe {
                libc::setsid();
                libc::dup2(listen_fd, 0);
                let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(256);
                for fd in 3..max_fd as RawFd {
                    if fd != listen_fd {
                        libc::close(fd);
                    }
                }
            }
            let dir = std::path::Path::new(&bin_path)
                .parent()
                .unwrap_or_else(|| std::path::Path::new("."));
            let _ = std::env::set_current_dir(dir);
            let err = exec_program(&bin_path);
            eprintln!("execve failed for {}: {}", bin_path, err);
            std::process::exit(127);
        }

        std::thread::sleep(Duration::from_millis(100));
        let proc = &mut self.procs[slot_idx];
        proc.state = ProcessState::Running;
        proc.pid = Some(pid);
        proc.load = 0;
        proc.membership = Membership::Active;
        proc.last_used = Instant::now();
        Ok(())
    }

    /// Per-second health and recovery tick (spec §4.4 steps 1-7).
    pub fn tick(&mut self) {
        let now = Instant::now();

        // 1. OVERLOADED -> RUNNING once the cooldown passes.
        for p in self.procs.iter_mut() {
            if p.state == ProcessState::Overloaded {
                if let Some(until) = p.disabled_until {
                    if until <= now {
                        p.state = ProcessState::Running;
                        p.disabled_until = None;
                    }
                }
            }
        }

        // 2/3. Reap DIED_WAIT_FOR_PID locals non-blockingly; respawn zero-load DIED locals.
        for idx in 0..self.procs.len() {
            let (is_local, pid, state) = {
                let p = &self.procs[idx];
                (p.is_local, p.pid, p.state)
            };
            if state == ProcessState::DiedWaitForPid && is_local {
                if let Some(pid) = pid {
                    let mut status = 0i32;
                    let r = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if r == pid {
                        self.procs[idx].state = ProcessState::Died;
                        self.procs[idx].pid = None;
                    }
                }
            }
            let (state, load) = {
                let p = &self.procs[idx];
                (p.state, p.load)
            };
            if state == ProcessState::Died && is_local && load == 0 {
                let _ = self.respawn_slot(idx);
            }
        }

        // 4. Remote DIED re-enables after its cooldown.
        for p in self.procs.iter_mut() {
            if p.state == ProcessState::Died && !p.is_local {
                if let Some(until) = p.disabled_until {
                    if until <= now {
                        p.state = ProcessState::Running;
                        p.disabled_until = None;
                    }
                }
            }
        }

        // 5. Grow toward max_procs if average load-per-proc is too high.
        let active = self.active_procs();
        if self.bin_path.is_some() && active < self.max_procs && active > 0 {
            let avg = self.load() as f64 / active as f64;
            if avg > self.max_load_per_proc as f64 {
                if let Some(unused_idx) = self
                    .procs
                    .iter()
                    .position(|p| p.membership == Membership::Unused)
                {
                    let _ = self.respawn_slot(unused_idx);
                } else if let Ok(()) = self.bind_listener() {
                    let _ = self.spawn_one();
                }
            }
        }

        // 6. Shrink idle procs above min_procs back to the unused list.
        if self.active_procs() > self.min_procs {
            for p in self.procs.iter_mut() {
                if p.membership == Membership::Active
                    && p.state == ProcessState::Running
                    && p.is_idle(self.idle_timeout)
                {
                    if let Some(pid) = p.pid {
                        unsafe { libc::kill(pid, libc::SIGTERM) };
                    }
                    p.state = ProcessState::Killed;
                    p.membership = Membership::Unused;
                }
            }
        }

        // 6b. Recycle a local proc that has served its request quota, the
        // way `max_requests_per_proc` kills a process "that grows a little
        // bit larger than wanted" (mod_fastcgi.c). Only while idle, so an
        // in-flight request is never interrupted.
        if self.max_requests_per_proc > 0 {
            for idx in 0..self.procs.len() {
                let recycle = {
                    let p = &self.procs[idx];
                    p.is_local
                        && p.membership == Membership::Active
                        && p.state == ProcessState::Running
                        && p.load == 0
                        && p.requests >= self.max_requests_per_proc
                };
                if recycle {
                    if let Some(pid) = self.procs[idx].pid {
                        unsafe { libc::kill(pid, libc::SIGTERM) };
                    }
                    self.procs[idx].state = ProcessState::Killed;
                    self.procs[idx].membership = Membership::Unused;
                }
            }
        }

        // 7. Reap unused procs whose pid has exited; free the slot for reuse.
        for p in self.procs.iter_mut() {
            if p.membership == Membership::Unused {
                if let Some(pid) = p.pid {
                    let mut status = 0i32;
                    let r = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if r == pid {
                        p.pid = None;
                        p.state = ProcessState::Unset;
                    }
                }
            }
        }
    }
}

fn exec_program(bin_path: &str) -> io::Error {
    use std::ffi::CString;
    let Ok(c_path) = CString::new(bin_path) else {
        return io::Error::new(io::ErrorKind::InvalidInput, "bin_path has interior NUL");
    };
    let argv = [c_path.as_ptr(), std::ptr::null()];
    unsafe {
        libc::execv(c_path.as_ptr(), argv.as_ptr());
    }
    io::Error::last_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FastcgiHostConfig;

    fn remote_cfg() -> FastcgiHostConfig {
        FastcgiHostConfig {
            host: "127.0.0.1".to_string(),
            port: Some(0),
            socket: Some("/tmp/does-not-need-to-exist.sock".to_string()),
            bin_path: None,
            min_procs: 1,
            max_procs: 1,
            max_load_per_proc: 1,
            idle_timeout: 60,
            disable_time: 5,
            max_requests_per_proc: 0,
            check_local: false,
        }
    }

    #[test]
    fn remote_host_has_exactly_one_running_proc() {
        let host = Host::from_config(&remote_cfg()).unwrap();
        assert_eq!(host.procs.len(), 1);
        assert!(host.procs[0].is_available());
        assert!(!host.procs[0].is_local);
    }

    #[test]
    fn pick_proc_prefers_lowest_load() {
        let mut host = Host::from_config(&remote_cfg()).unwrap();
        host.procs.push(Process::new(1, false));
        host.procs[1].state = ProcessState::Running;
        host.procs[0].load = 5;
        host.procs[1].load = 1;
        assert_eq!(host.pick_proc(), Some(1));
    }

    #[test]
    fn overloaded_proc_returns_to_running_after_cooldown() {
        let mut host = Host::from_config(&remote_cfg()).unwrap();
        host.procs[0].state = ProcessState::Overloaded;
        host.procs[0].disabled_until = Some(Instant::now() - Duration::from_secs(1));
        host.tick();
        assert_eq!(host.procs[0].state, ProcessState::Running);
    }
}
