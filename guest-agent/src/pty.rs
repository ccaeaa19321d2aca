//! PTY (Pseudo-Terminal) support.
//!
//! Provides PTY allocation and process spawning for the `InteractiveShell`
//! RPC. Uses `openpty()` for PTY creation and `fork()`/`exec()` for process
//! spawning, the same primitives the teacher's microVM guest agent used
//! for its own PTY sessions — generalized here to one PTY per RPC call
//! rather than a multi-session map, since each `InteractiveShell` stream
//! owns exactly one shell process.

use anyhow::{Context, Result, bail};
use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid, WaitPidFlag};
use nix::unistd::{ForkResult, Pid, close, dup2, fork, setsid};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// A PTY session managing an interactive shell process
pub struct PtySession {
    /// Session identifier
    pub id: String,
    /// Master PTY file descriptor
    master_fd: RawFd,
    /// Child process PID
    child_pid: Option<Pid>,
    /// Async file wrapper for the master fd
    master_file: Option<tokio::fs::File>,
}

impl PtySession {
    /// Spawn a new PTY session with the given command
    ///
    /// # Arguments
    /// * `id` - Unique session identifier
    /// * `command` - Command to run (e.g., "/bin/sh")
    /// * `args` - Command arguments
    /// * `rows` - Initial terminal rows
    /// * `cols` - Initial terminal columns
    /// * `env` - Environment variables
    pub fn spawn(
        id: String,
        command: &str,
        args: &[String],
        rows: u16,
        cols: u16,
        env: Option<&HashMap<String, String>>,
    ) -> Result<Self> {
        // Open a new PTY pair
        let OpenptyResult { master, slave } = openpty(None, None)
            .context("Failed to open PTY")?;

        // Set initial window size
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            if libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) < 0 {
                eprintln!("Warning: Failed to set window size");
            }
        }

        // Fork the process
        match unsafe { fork() }.context("Fork failed")? {
            ForkResult::Child => {
                // Child process: set up PTY and exec

                // Close the master fd in child
                let _ = close(master.as_raw_fd());

                // Create a new session (become session leader)
                setsid().ok();

                // Set the slave as the controlling terminal
                #[allow(clippy::useless_conversion)]
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY.into(), 0);
                }

                // Redirect stdin/stdout/stderr to the slave PTY
                let slave_fd = slave.as_raw_fd();
                dup2(slave_fd, 0).expect("dup2 stdin failed");
                dup2(slave_fd, 1).expect("dup2 stdout failed");
                dup2(slave_fd, 2).expect("dup2 stderr failed");

                // Close the original slave fd if it's not one of stdin/stdout/stderr
                if slave_fd > 2 {
                    let _ = close(slave_fd);
                }

                // Prepare command and arguments
                let cmd = CString::new(command).expect("Invalid command");
                let mut c_args: Vec<CString> = vec![cmd.clone()];
                for arg in args {
                    c_args.push(CString::new(arg.as_str()).expect("Invalid argument"));
                }

                // Set environment variables
                if let Some(env_vars) = env {
                    for (key, value) in env_vars {
                        let env_str = format!("{}={}", key, value);
                        if let Ok(c_env) = CString::new(env_str) {
                            unsafe {
                                libc::putenv(c_env.into_raw());
                            }
                        }
                    }
                }

                // Set some default environment variables for a usable shell
                for (key, value) in [
                    ("TERM", "xterm-256color"),
                    ("HOME", "/root"),
                    ("PATH", "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin"),
                ] {
                    if env.map_or(true, |e| !e.contains_key(key)) {
                        let env_str = format!("{}={}", key, value);
                        if let Ok(c_env) = CString::new(env_str) {
                            unsafe {
                                libc::putenv(c_env.into_raw());
                            }
                        }
                    }
                }

                // Exec the command
                nix::unistd::execvp(&cmd, &c_args).expect("execvp failed");
                unreachable!()
            }
            ForkResult::Parent { child } => {
                // Parent process: close slave, return session
                let _ = close(slave.as_raw_fd());

                // Create async file wrapper for the master fd
                let master_fd = master.as_raw_fd();
                let master_file = unsafe {
                    std::fs::File::from_raw_fd(master_fd)
                };
                let master_file = tokio::fs::File::from_std(master_file);

                Ok(Self {
                    id,
                    master_fd,
                    child_pid: Some(child),
                    master_file: Some(master_file),
                })
            }
        }
    }

    /// Resize the terminal window
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let result = unsafe {
            libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize)
        };
        if result < 0 {
            bail!("Failed to resize terminal: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Take ownership of the master side's async file handle, leaving
    /// `self` to track only the raw fd (for resize) and the child pid.
    /// Callers typically pass the result straight to `tokio::io::split` to
    /// read and write concurrently from separate tasks.
    pub fn take_io(&mut self) -> Option<tokio::fs::File> {
        self.master_file.take()
    }

    /// Check if the child process is still running
    pub fn is_running(&self) -> bool {
        if let Some(pid) = self.child_pid {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(_) => false,
                Err(_) => false,
            }
        } else {
            false
        }
    }

    /// Get the exit code if the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        if let Some(pid) = self.child_pid {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => Some(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Kill the child process
    pub fn kill(&self) -> Result<()> {
        if let Some(pid) = self.child_pid {
            kill(pid, Signal::SIGKILL).context("Failed to kill process")?;
        }
        Ok(())
    }

    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.id
    }

    /// The child process's pid, for signal delivery from outside.
    pub fn pid(&self) -> Option<Pid> {
        self.child_pid
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        // Kill the child process if still running
        if let Some(pid) = self.child_pid.take() {
            let _ = kill(pid, Signal::SIGTERM);
            // Give it a moment to exit gracefully
            std::thread::sleep(std::time::Duration::from_millis(100));
            let _ = kill(pid, Signal::SIGKILL);
        }
        // The master_file will close the fd when dropped
    }
}

