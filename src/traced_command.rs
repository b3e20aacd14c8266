//! Launching the traced command.
//!
//! The command is forked into a child that blocks before `execv` until the
//! tracer has installed its producers with the child's pid, so nothing the
//! command does is missed.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// A forked command held right before exec.
pub struct TracedCommand {
    pid: u32,
    /// Writing one byte (or closing) lets the child exec.
    release: Option<File>,
    /// EOF once exec succeeded, the child's errno otherwise.
    exec_status: Option<File>,
    reaped: bool,
}

impl TracedCommand {
    /// Fork `argv[0]` with arguments `argv`, blocked before exec.
    ///
    /// Must run before any producer thread exists, the child only calls
    /// async-signal-safe functions between fork and exec.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let Some(program) = argv.first() else {
            bail!("No command specified to run");
        };
        let path = resolve_executable(program)?;
        tracing::debug!("resolved {} -> {}", program, path.display());

        let path = CString::new(path.as_os_str().as_bytes())
            .context("Command path contains a NUL byte")?;
        let args = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .context("Command argument contains a NUL byte")?;
        let mut arg_ptrs: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
        arg_ptrs.push(std::ptr::null());

        let (release_rx, release_tx) = pipe(0).context("Failed to create release pipe")?;
        let (status_rx, status_tx) =
            pipe(libc::O_CLOEXEC).context("Failed to create exec status pipe")?;
        let parent = unsafe { libc::getpid() };

        let (release_rx_fd, release_tx_fd) = (release_rx.as_raw_fd(), release_tx.as_raw_fd());
        let (status_rx_fd, status_tx_fd) = (status_rx.as_raw_fd(), status_tx.as_raw_fd());

        match unsafe { libc::fork() } {
            -1 => bail!("fork() failed: {}", std::io::Error::last_os_error()),
            0 => unsafe {
                // Child: no allocation, never return
                libc::close(release_tx_fd);
                libc::close(status_rx_fd);
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                if libc::getppid() != parent {
                    libc::_exit(1);
                }

                let mut byte = [0u8; 1];
                let n = libc::read(release_rx_fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
                libc::close(release_rx_fd);
                if n <= 0 {
                    libc::_exit(1);
                }

                libc::execv(path.as_ptr(), arg_ptrs.as_ptr());

                let errno = (*libc::__errno_location()).to_ne_bytes();
                libc::write(status_tx_fd, errno.as_ptr() as *const libc::c_void, errno.len());
                libc::_exit(127);
            },
            child => {
                drop(release_rx);
                drop(status_tx);
                Ok(TracedCommand {
                    pid: child as u32,
                    release: Some(File::from(release_tx)),
                    exec_status: Some(File::from(status_rx)),
                    reaped: false,
                })
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Let the child exec and wait until it did.
    pub fn release(&mut self) -> Result<()> {
        if let Some(mut release) = self.release.take() {
            release
                .write_all(&[1])
                .context("Failed to release the traced command")?;
        }

        let Some(mut status) = self.exec_status.take() else {
            return Ok(());
        };
        let mut errno = [0u8; 4];
        let n = read_full(&mut status, &mut errno).context("Failed to read exec status")?;
        if n == 0 {
            return Ok(());
        }

        let errno = if n == errno.len() {
            i32::from_ne_bytes(errno)
        } else {
            errno[0] as i32
        };
        let _ = self.wait();
        bail!(
            "Failed to exec command: {}",
            std::io::Error::from_raw_os_error(errno)
        );
    }

    /// Block until the child exits and return its exit code.
    ///
    /// A child killed by a signal reports `128 + signo`, like a shell does.
    pub fn wait(&mut self) -> Result<i32> {
        loop {
            match waitpid(Pid::from_raw(self.pid as i32), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.reaped = true;
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.reaped = true;
                    return Ok(128 + signal as i32);
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("waitpid({}) failed", self.pid))
                }
            }
        }
    }
}

impl Drop for TracedCommand {
    fn drop(&mut self) {
        // Closing the release pipe makes a still blocked child exit on its own
        self.release.take();
        self.exec_status.take();
        if !self.reaped {
            let _ = signal_pid(self.pid, Signal::SIGKILL);
            let _ = waitpid(Pid::from_raw(self.pid as i32), None);
        }
    }
}

pub fn signal_pid(pid: u32, signal: Signal) -> Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
        .with_context(|| format!("Failed to send {signal:?} to {pid}"))
}

fn pipe(flags: libc::c_int) -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `name` the way `execvp` would: as a path when it contains a `/`,
/// otherwise by searching `PATH`.
pub fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if !is_executable(&path) {
            bail!("'{}' is not an executable file", name);
        }
        return Ok(path);
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("Command '{name}' not found in PATH"))
}
