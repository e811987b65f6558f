//! Starting the buffer side as a forked process or a thread.

use std::os::fd::AsRawFd;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, warn};

use super::process::{BufferProcess, ExitReason};
use crate::{
    config::SpawnMode,
    error::{BufferError, Result},
    ipc::channel::CommandChannel,
};

/// Handle on the running buffer side.
#[derive(Debug)]
pub enum Worker {
    Process { pid: Pid },
    Thread { handle: JoinHandle<ExitReason> },
}

extern "C" fn on_interrupt(_: nix::libc::c_int) {}

/// Route `SIGINT` to a no-op handler so a blocking device write returns
/// `EINTR` instead of the process dying.
fn install_interrupt_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler does nothing, so it is async-signal-safe.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }.map(drop)
}

/// Start `process` serving `buffer_end`. `controller_end` is closed in a
/// forked child so the child sees end-of-file once the controller goes away.
pub fn spawn_worker(
    mode: SpawnMode,
    process: BufferProcess,
    controller_end: &CommandChannel,
    buffer_end: CommandChannel,
) -> Result<Worker> {
    match mode {
        SpawnMode::Thread => {
            let handle = thread::Builder::new()
                .name("xferbuf-buffer".into())
                .spawn(move || process.run(buffer_end))?;
            Ok(Worker::Thread { handle })
        }
        SpawnMode::Process => {
            // SAFETY: the child only touches state it owns and leaves through
            // `process::exit`, never returning into the caller's frames.
            match unsafe { unistd::fork() } {
                Ok(ForkResult::Child) => {
                    let _ = unistd::close(controller_end.as_raw_fd());
                    if let Err(e) = install_interrupt_handler() {
                        warn!("cannot install SIGINT handler: {e}");
                    }
                    let reason = process.run(buffer_end);
                    std::process::exit(reason.exit_code());
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!(pid = child.as_raw(), "forked buffer process");
                    drop(buffer_end);
                    drop(process);
                    Ok(Worker::Process { pid: child })
                }
                Err(e) => Err(BufferError::Process(format!("fork failed: {e}"))),
            }
        }
    }
}

impl Worker {
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Worker::Process { pid } => Some(*pid),
            Worker::Thread { .. } => None,
        }
    }

    /// Knock a forked process out of a blocking device write. A thread
    /// only sees the ring's interrupt flag.
    pub fn interrupt(&self) {
        if let Worker::Process { pid } = self {
            match signal::kill(*pid, Signal::SIGINT) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = pid.as_raw(), "cannot signal buffer process: {e}"),
            }
        }
    }

    /// Stop the worker without asking. A thread cannot be killed; it is
    /// detached and exits once its channel closes.
    pub fn kill(self) {
        match self {
            Worker::Process { pid } => {
                if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
                    if e != Errno::ESRCH {
                        warn!(pid = pid.as_raw(), "cannot kill buffer process: {e}");
                    }
                }
                let _ = waitpid(pid, None);
            }
            Worker::Thread { handle } => drop(handle),
        }
    }

    /// Wait for the worker to finish. Anything but a clean exit is an error.
    pub fn wait(self) -> Result<()> {
        match self {
            Worker::Process { pid } => loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                    Ok(WaitStatus::Exited(_, code)) => {
                        return Err(BufferError::Process(format!(
                            "buffer process exited with status {code}"
                        )))
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        return Err(BufferError::Process(format!(
                            "buffer process killed by {sig:?}"
                        )))
                    }
                    Ok(status) => debug!(?status, "buffer process status change"),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Worker::Thread { handle } => match handle.join() {
                Ok(reason) if reason.is_clean() => Ok(()),
                Ok(reason) => Err(BufferError::Process(format!(
                    "buffer thread stopped: {reason:?} (exit code {})",
                    reason.exit_code()
                ))),
                Err(_) => Err(BufferError::Process("buffer thread panicked".into())),
            },
        }
    }
}
