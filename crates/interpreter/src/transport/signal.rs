//! Process signalling for workers known by pid.
//!
//! Workers are spawned as process-group leaders, so the whole group is
//! signalled first; a plain `kill` covers workers started some other way.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

fn to_pid(pid: u32) -> Option<Pid> {
	i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Sends `sig` to the worker's process group, falling back to the process.
/// Returns false if no such process exists.
pub(super) fn send(pid: u32, sig: Signal) -> bool {
	let Some(pid) = to_pid(pid) else {
		return false;
	};
	signal::killpg(pid, sig).or_else(|_| signal::kill(pid, sig)).is_ok()
}

/// Whether a process with this pid exists.
pub(super) fn exists(pid: u32) -> bool {
	let Some(pid) = to_pid(pid) else {
		return false;
	};
	match signal::kill(pid, None) {
		Ok(()) => true,
		Err(Errno::EPERM) => true,
		Err(_) => false,
	}
}

pub(super) fn terminate(pid: u32) -> bool {
	send(pid, Signal::SIGTERM)
}

pub(super) fn kill(pid: u32) -> bool {
	send(pid, Signal::SIGKILL)
}
