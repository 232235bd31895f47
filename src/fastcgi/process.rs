//! A single FastCGI backend process (local or remote), grounded in
//! `mod_fastcgi.c`'s `PROC_STATE_*` enum and `fcgi_proc` struct.

use std::time::Instant;

/// Mirrors `mod_fastcgi.c`'s `PROC_STATE_UNSET/RUNNING/OVERLOADED/
/// DIED_WAIT_FOR_PID/DIED/KILLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unset,
    Running,
    Overloaded,
    DiedWaitForPid,
    Died,
    Killed,
}

/// Which of a host's two lists a process currently belongs to. Modeled as
/// a field on `Process` rather than a second container (spec §9 Design
/// Notes: "move = change of arena membership, no pointer fixup").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Active,
    Unused,
}

/// A slot in a `Host`'s process arena. `id` is stable for the slot's
/// lifetime even as the process behind it is respawned.
#[derive(Debug)]
pub struct Process {
    pub id: usize,
    pub state: ProcessState,
    pub membership: Membership,
    pub load: usize,
    pub last_used: Instant,
    pub requests: usize,
    pub disabled_until: Option<Instant>,
    pub pid: Option<i32>,
    pub is_local: bool,
}

impl Process {
    pub fn new(id: usize, is_local: bool) -> Self {
        Process {
            id,
            state: ProcessState::Unset,
            membership: Membership::Active,
            load: 0,
            last_used: Instant::now(),
            requests: 0,
            disabled_until: None,
            pid: None,
            is_local,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn is_idle(&self, idle_timeout: std::time::Duration) -> bool {
        self.load == 0 && self.last_used.elapsed() > idle_timeout
    }

    pub fn mark_used(&mut self) {
        self.load += 1;
        self.requests += 1;
        self.last_used = Instant::now();
    }

    pub fn release(&mut self) {
        self.load = self.load.saturating_sub(1);
        self.last_used = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_process_is_not_available() {
        let p = Process::new(0, true);
        assert!(!p.is_available());
        assert_eq!(p.load, 0);
    }

    #[test]
    fn mark_used_then_release_returns_to_zero_load() {
        let mut p = Process::new(1, true);
        p.mark_used();
        p.mark_used();
        assert_eq!(p.load, 2);
        p.release();
        p.release();
        assert_eq!(p.load, 0);
        assert_eq!(p.requests, 2);
    }
}
