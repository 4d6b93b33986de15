//! PTY-backed child process supervision.
//!
//! A spawned child gets a controlling pseudo-terminal (`TERM=vt100`) for
//! stdin/stdout and a separate pipe for stderr. Parent-side I/O is fully
//! non-blocking: background workers drain both output streams into
//! unbounded byte queues and feed the stdin queue into the terminal, while
//! a reaper thread waits on child exit and then flags shutdown. All waits
//! take a timeout; there is no unbounded blocking in the public API.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::sys::termios::{self, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices};
use tracing::debug;

use crate::error::{GcError, Result};

/// Grace period granted to a finishing process before `iter_lines` gives up
/// on further output.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Serializes pty/pipe creation against concurrent spawns from other
/// threads.
static FD_CREATION_LOCK: Mutex<()> = Mutex::new(());

/// Exit disposition of a supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by a signal, reported by name (`"SIGTERM"`, ...).
    Signaled(String),
}

impl ProcStatus {
    pub fn success(&self) -> bool {
        matches!(self, ProcStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ProcStatus::Exited(code) => Some(*code),
            ProcStatus::Signaled(_) => None,
        }
    }

    fn from_exit(status: ExitStatus) -> Self {
        if let Some(sig) = status.signal() {
            ProcStatus::Signaled(signal_name(sig).to_string())
        } else {
            ProcStatus::Exited(status.code().unwrap_or(-1))
        }
    }
}

impl std::fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcStatus::Exited(code) => write!(f, "{code}"),
            ProcStatus::Signaled(name) => write!(f, "{name}"),
        }
    }
}

fn signal_name(sig: i32) -> &'static str {
    match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        _ => "SIG_UNKNOWN",
    }
}

/// A settable flag that threads can wait on with a deadline.
#[derive(Clone, Default, Debug)]
struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    fn set(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Wait up to `timeout` for the flag; returns whether it was set.
    fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut set = lock.lock().unwrap();
        while !*set {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(set, remaining).unwrap();
            set = guard;
        }
        true
    }
}

/// Read side of a child stream, backed by an unbounded byte queue.
#[derive(Debug)]
pub struct ReadStream {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    shutdown: Event,
    finished: Event,
}

impl ReadStream {
    /// Return whatever bytes are available by `timeout`, or empty.
    pub fn read(&mut self, timeout: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => out.extend(chunk),
                Err(_) => break,
            }
        }
        if out.is_empty()
            && !timeout.is_zero()
            && let Ok(chunk) = self.rx.recv_timeout(timeout)
        {
            out.extend(chunk);
            while let Ok(chunk) = self.rx.try_recv() {
                out.extend(chunk);
            }
        }
        out
    }

    /// Lossy UTF-8 variant of [`ReadStream::read`].
    pub fn read_str(&mut self, timeout: Duration) -> String {
        String::from_utf8_lossy(&self.read(timeout)).into_owned()
    }

    /// Accumulate bytes until `cond` holds on the accumulated text.
    ///
    /// After the process finishes, one final read is made before giving
    /// up; a hard deadline miss is a typed timeout error.
    pub fn wait_for<F>(&mut self, timeout: Duration, cond: F) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut acc = String::new();
        let mut final_read = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = self.read(remaining);
            acc.push_str(&String::from_utf8_lossy(&chunk));
            if cond(&acc) {
                return Ok(acc);
            }
            if final_read {
                return Ok(acc);
            }
            if self.finished.is_set() {
                final_read = true;
                continue;
            }
            if Instant::now() >= deadline {
                return Err(GcError::Timeout(format!(
                    "stream did not fulfill condition after waiting for {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        }
    }

    /// Iterate complete newline-delimited lines.
    ///
    /// A stalled stream ends the iteration silently when `soft_timeout` is
    /// set and raises a typed timeout error otherwise. Once the process
    /// starts shutting down, up to [`SHUTDOWN_GRACE`] is granted for the
    /// remaining output; any unterminated rest of the buffer is flushed as
    /// a final line.
    pub fn iter_lines(&mut self, timeout: Duration, soft_timeout: bool) -> LineIter<'_> {
        LineIter {
            stream: self,
            timeout,
            soft_timeout,
            grace: SHUTDOWN_GRACE,
            waited_for_shutdown: false,
            done: false,
        }
    }
}

pub struct LineIter<'a> {
    stream: &'a mut ReadStream,
    timeout: Duration,
    soft_timeout: bool,
    grace: Duration,
    waited_for_shutdown: bool,
    done: bool,
}

impl Iterator for LineIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(pos) = self.stream.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.stream.pending.drain(..=pos).collect();
                return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
            }
            let chunk = self.stream.read(self.timeout);
            if !chunk.is_empty() {
                self.stream.pending.extend(chunk);
            } else if self.stream.shutdown.is_set() && !self.waited_for_shutdown {
                self.waited_for_shutdown = true;
                self.stream.finished.wait(self.grace);
            } else if self.stream.finished.is_set() || self.soft_timeout {
                break;
            } else {
                self.done = true;
                return Some(Err(GcError::Timeout(format!(
                    "stream did not yield more lines after waiting for {:.1}s",
                    self.timeout.as_secs_f64()
                ))));
            }
        }
        self.done = true;
        if !self.stream.pending.is_empty() {
            let rest = std::mem::take(&mut self.stream.pending);
            return Some(Ok(String::from_utf8_lossy(&rest).into_owned()));
        }
        None
    }
}

/// Write side of the child's terminal.
#[derive(Debug)]
pub struct WriteStream {
    tx: Sender<Vec<u8>>,
    eof_byte: u8,
}

impl WriteStream {
    /// Queue bytes for delivery; never blocks the caller.
    pub fn write(&self, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }

    /// Signal end-of-input by writing the terminal's VEOF byte.
    pub fn close(&self) {
        self.write(&[self.eof_byte]);
    }
}

/// A supervised local child process.
#[derive(Debug)]
pub struct LocalProcess {
    cmd: PathBuf,
    args: Vec<String>,
    pid: libc::pid_t,
    pub stdout: ReadStream,
    pub stderr: ReadStream,
    pub stdin: WriteStream,
    status: Arc<Mutex<Option<ProcStatus>>>,
    finished: Event,
}

impl LocalProcess {
    /// Resolve `cmd` on `PATH`, spawn it under a fresh pseudo-terminal and
    /// start the I/O workers. An unknown or non-executable command is a
    /// typed process error.
    pub fn spawn(cmd: &str, args: &[String]) -> Result<LocalProcess> {
        let exe = which::which(cmd)
            .map_err(|e| GcError::Process(format!("unable to execute {cmd:?}: {e}")))?;
        debug!(cmd = %exe.display(), ?args, "external program called");

        let shutdown = Event::default();
        let finished = Event::default();
        let status: Arc<Mutex<Option<ProcStatus>>> = Arc::new(Mutex::new(None));

        let (stdout_tx, stdout_rx) = channel::<Vec<u8>>();
        let (stderr_tx, stderr_rx) = channel::<Vec<u8>>();
        let (stdin_tx, stdin_rx) = channel::<Vec<u8>>();

        // Pty and pipe creation races against fork in other threads, so the
        // whole fd setup runs under a process-wide lock.
        let guard = FD_CREATION_LOCK.lock().unwrap();
        let pty = nix::pty::openpty(None::<&nix::pty::Winsize>, None::<&termios::Termios>)
            .map_err(|e| GcError::Process(format!("unable to allocate pty: {e}")))?;

        let mut attr = termios::tcgetattr(&pty.master)
            .map_err(|e| GcError::Process(format!("tcgetattr failed: {e}")))?;
        attr.output_flags.remove(OutputFlags::ONLCR);
        attr.output_flags.insert(OutputFlags::ONLRET);
        attr.local_flags.remove(LocalFlags::ECHO);
        termios::tcsetattr(&pty.master, SetArg::TCSANOW, &attr)
            .map_err(|e| GcError::Process(format!("tcsetattr failed: {e}")))?;
        let eof_byte = attr.control_chars[SpecialCharacterIndices::VEOF as usize];

        let slave_stdin = pty
            .slave
            .try_clone()
            .map_err(|e| GcError::Process(format!("unable to duplicate pty fd: {e}")))?;

        let mut command = Command::new(&exe);
        command
            .args(args)
            .env("TERM", "vt100")
            .stdin(Stdio::from(slave_stdin))
            .stdout(Stdio::from(pty.slave))
            .stderr(Stdio::piped());
        unsafe {
            command.pre_exec(|| {
                // Detach from the parent's terminal and adopt the pty slave
                // (fd 0) as the controlling terminal.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| GcError::Process(format!("unable to spawn {}: {e}", exe.display())))?;
        drop(guard);

        let pid = child.id() as libc::pid_t;
        let child_stderr = child.stderr.take().expect("child stderr piped");

        let master_read = pty
            .master
            .try_clone()
            .map_err(|e| GcError::Process(format!("unable to duplicate pty fd: {e}")))?;

        let t_out = std::thread::spawn(move || drain_into(master_read, stdout_tx));
        let t_err = std::thread::spawn(move || {
            let mut src = child_stderr;
            let mut buf = [0u8; 32 * 1024];
            loop {
                match src.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stderr_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        let writer_shutdown = shutdown.clone();
        let master_write = pty.master;
        let t_in = std::thread::spawn(move || feed_stdin(master_write, stdin_rx, writer_shutdown));

        let reaper_status = Arc::clone(&status);
        let reaper_shutdown = shutdown.clone();
        let reaper_finished = finished.clone();
        std::thread::spawn(move || {
            let result = match child.wait() {
                Ok(exit) => ProcStatus::from_exit(exit),
                Err(_) => ProcStatus::Exited(-1),
            };
            *reaper_status.lock().unwrap() = Some(result);
            reaper_shutdown.set();
            let _ = t_out.join();
            let _ = t_err.join();
            let _ = t_in.join();
            reaper_finished.set();
        });

        Ok(LocalProcess {
            cmd: exe,
            args: args.to_vec(),
            pid,
            stdout: ReadStream {
                rx: stdout_rx,
                pending: Vec::new(),
                shutdown: shutdown.clone(),
                finished: finished.clone(),
            },
            stderr: ReadStream {
                rx: stderr_rx,
                pending: Vec::new(),
                shutdown,
                finished: finished.clone(),
            },
            stdin: WriteStream {
                tx: stdin_tx,
                eof_byte,
            },
            status,
            finished,
        })
    }

    /// The resolved command line, for diagnostics.
    pub fn call_line(&self) -> String {
        let mut parts = vec![self.cmd.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Wait up to `timeout` for the child to finish and return its status,
    /// or `None` if it is still running.
    pub fn status(&self, timeout: Duration) -> Option<ProcStatus> {
        self.finished.wait(timeout);
        self.status.lock().unwrap().clone()
    }

    /// Like [`LocalProcess::status`], but escalates to [`terminate`] with
    /// a one-second grace when the child is still running afterwards.
    ///
    /// [`terminate`]: LocalProcess::terminate
    pub fn status_or_terminate(&self, timeout: Duration) -> Option<ProcStatus> {
        match self.status(timeout) {
            Some(status) => Some(status),
            None => self.terminate(Duration::from_secs(1)),
        }
    }

    /// Hard variant of [`LocalProcess::status`]: a still-running child is
    /// terminated and reported as a typed timeout error.
    pub fn status_raise(&self, timeout: Duration) -> Result<ProcStatus> {
        match self.status(timeout) {
            Some(status) => Ok(status),
            None => {
                self.terminate(Duration::from_secs(1));
                Err(GcError::Timeout(format!(
                    "process is still running after waiting for {:.1}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Best-effort shutdown: TERM, wait up to `timeout`, then KILL.
    pub fn terminate(&self, timeout: Duration) -> Option<ProcStatus> {
        if let Some(status) = self.status(Duration::ZERO) {
            return Some(status);
        }
        self.kill(libc::SIGTERM);
        if let Some(status) = self.status(timeout) {
            return Some(status);
        }
        self.kill(libc::SIGKILL);
        self.status(timeout)
    }

    /// Send a signal to the child. Failures against an already-reaped
    /// process are swallowed.
    pub fn kill(&self, signal: libc::c_int) {
        if self.finished.is_set() {
            return;
        }
        // SAFETY: kill(2) is safe to call with any pid and valid signal number.
        let ret = unsafe { libc::kill(self.pid, signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: already gone.
            if err.raw_os_error() != Some(libc::ESRCH) {
                debug!(pid = self.pid, signal, %err, "kill failed");
            }
        }
    }

    /// Wait for the child and flush both output streams.
    pub fn finish(&mut self, timeout: Duration) -> Result<(ProcStatus, Vec<u8>, Vec<u8>)> {
        let status = self.status_raise(timeout)?;
        Ok((
            status,
            self.stdout.read(Duration::ZERO),
            self.stderr.read(Duration::ZERO),
        ))
    }

    /// Read stdout for up to `timeout`, then check the exit status. With
    /// `raise_errors`, a still-running child or non-zero exit is an error.
    pub fn get_output(&mut self, timeout: Duration, raise_errors: bool) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let result = self.stdout.read_str(timeout);
        let status = self.status(deadline.saturating_duration_since(Instant::now()));
        if status.is_none() {
            self.terminate(Duration::from_secs(1));
            if raise_errors {
                return Err(GcError::Timeout(format!(
                    "process is still running after waiting for {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        } else if raise_errors && !status.as_ref().is_some_and(ProcStatus::success) {
            return Err(GcError::Process(format!(
                "command {} returned with exit status {}",
                self.call_line(),
                status.expect("status checked above")
            )));
        }
        Ok(result)
    }
}

fn drain_into(fd: OwnedFd, tx: Sender<Vec<u8>>) {
    // Reading the pty master returns EIO once the slave side is fully
    // closed, which doubles as EOF here.
    let mut src = std::fs::File::from(fd);
    let mut buf = [0u8; 32 * 1024];
    loop {
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn feed_stdin(fd: OwnedFd, rx: Receiver<Vec<u8>>, shutdown: Event) {
    let mut dst = std::fs::File::from(fd);
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(chunk) => {
                if dst.write_all(&chunk).is_err() {
                    break;
                }
                let _ = dst.flush();
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if shutdown.is_set() {
                    // Drain anything still queued before giving up the fd.
                    loop {
                        match rx.try_recv() {
                            Ok(chunk) => {
                                let _ = dst.write_all(&chunk);
                            }
                            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                        }
                    }
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
