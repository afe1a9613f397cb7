use std::io::Write;
use std::os::fd::RawFd;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// Message written to a helper process to ask it to exit.
///
/// The helper sees it as one framed message (the framing layer appends the
/// sentinel); it is written raw here, followed by a newline, because the
/// transport layer knows nothing about framing.
pub const PROXY_QUIT: &str = "QUIT";

/// A helper process acting as one end of a steering link.
///
/// The helper's stdin is the write half and its stdout the read half, so a
/// process that relays messages onward (to a registry, a web service, ...)
/// slots in wherever a socket would.
pub struct ProxyProcess {
    child: Child,
    program: String,
}

impl ProxyProcess {
    /// Spawn `command` with piped stdin/stdout.
    ///
    /// Stderr is inherited so the helper's own diagnostics stay visible.
    pub fn spawn(mut command: Command) -> Result<(Self, ChildStdout, ChildStdin)> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Shutdown);
        };

        debug!(program = %program, pid = child.id(), "spawned steering helper");
        Ok((Self { child, program }, stdout, stdin))
    }

    /// OS process id of the helper.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the helper has already exited.
    pub fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    /// Wait for the helper to exit on its own.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait()?;
        debug!(program = %self.program, %status, "steering helper exited");
        Ok(status)
    }

    /// Ask the helper to quit over `stdin`, then wait for it to exit.
    ///
    /// Consumes the write half so the helper also sees end-of-input.
    pub fn shutdown(mut self, mut stdin: ChildStdin) -> Result<()> {
        if let Err(err) = writeln!(stdin, "{PROXY_QUIT}") {
            warn!(program = %self.program, error = %err, "failed to send quit to helper");
        }
        drop(stdin);
        let status = self.child.wait()?;
        debug!(program = %self.program, %status, "steering helper exited");
        Ok(())
    }
}

/// Switch a pipe descriptor between blocking and non-blocking mode.
///
/// Lets a control loop poll a helper's stdout the same way it polls a socket.
/// An fd that is not open yields an error rather than undefined behavior.
pub fn set_fd_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    // SAFETY: F_GETFL/F_SETFL only read and write descriptor flags; an
    // invalid fd makes fcntl fail with EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags {
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!(program = %self.program, "killing steering helper");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl std::fmt::Debug for ProxyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}
