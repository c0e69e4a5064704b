//! Child process supervision
//!
//! Every process slingshot spawns (provider steps on the host as well as the
//! `docker` CLI calls driving containers) goes through [`run_tracked`], so a
//! crash or Ctrl+C of the operator process never leaves a half-finished
//! `terraform apply` running in the background.
//!
//! Children start in their own process group with a parent-death signal.
//! Their group ids live in a [`ChildTracker`]; on shutdown each group gets
//! SIGTERM, then SIGKILL once the grace period runs out.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Grace period when the operator process exits normally
pub const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Grace period after SIGINT, SIGTERM or SIGHUP
pub const SIGNAL_GRACE_PERIOD: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static TRACKER: OnceLock<Mutex<ChildTracker>> = OnceLock::new();

/// Process groups of the children that are still running
#[derive(Debug, Default)]
pub struct ChildTracker {
    groups: BTreeSet<i32>,
    shutting_down: bool,
}

impl ChildTracker {
    /// Lock the process-wide tracker. A poisoned lock is recovered.
    pub fn lock() -> MutexGuard<'static, ChildTracker> {
        TRACKER
            .get_or_init(Mutex::default)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn track(&mut self, pid: u32) {
        self.groups.insert(pid as i32);
        debug!(pid, "tracking child");
    }

    pub fn release(&mut self, pid: u32) {
        self.groups.remove(&(pid as i32));
        debug!(pid, "child exited");
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// SIGTERM every tracked group, SIGKILL whatever survives `grace`.
    ///
    /// Runs once; later calls return immediately.
    pub fn shut_down(&mut self, grace: Duration) {
        if std::mem::replace(&mut self.shutting_down, true) {
            return;
        }
        let groups = std::mem::take(&mut self.groups);
        if groups.is_empty() {
            return;
        }

        info!(count = groups.len(), "stopping provider processes");
        signal_groups(&groups, Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while groups.iter().any(|&pid| is_running(pid)) {
            if Instant::now() >= deadline {
                warn!("provider processes ignored SIGTERM, killing");
                let survivors: BTreeSet<i32> =
                    groups.iter().copied().filter(|&pid| is_running(pid)).collect();
                signal_groups(&survivors, Signal::SIGKILL);
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        debug!("provider processes stopped");
    }
}

/// Signal each group, falling back to the leader alone if the group is gone.
fn signal_groups(groups: &BTreeSet<i32>, sig: Signal) {
    for &pid in groups {
        if signal::killpg(Pid::from_raw(pid), sig).is_err() {
            if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
                debug!(pid, signal = ?sig, error = %e, "signal not delivered");
            }
        }
    }
}

/// Whether `pid` exists and is not a zombie.
fn is_running(pid: i32) -> bool {
    if signal::kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    // third field of /proc/<pid>/stat is the state letter
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(str::to_owned))
        })
        .is_none_or(|state| !matches!(state.as_str(), "Z" | "X"))
}

/// Stops tracked children when the operator process exits.
#[derive(Debug, Default)]
pub struct ShutdownGuard {
    _private: (),
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        ChildTracker::lock().shut_down(EXIT_GRACE_PERIOD);
    }
}

/// Stop tracked children and exit with `128 + signal` on SIGINT, SIGTERM
/// or SIGHUP. Call once at startup.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "interrupted, stopping provider processes");
                ChildTracker::lock().shut_down(SIGNAL_GRACE_PERIOD);
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Start a command as the leader of a new process group that dies with us.
pub trait SpawnInGroup {
    fn in_own_group(&mut self) -> &mut Self;
}

impl SpawnInGroup for Command {
    fn in_own_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

/// Where a child's output stream goes.
#[derive(Debug, Default)]
pub enum OutputSink {
    /// Pass through to the operator's own stream
    Inherit,
    /// Collect into memory
    Capture(Vec<u8>),
    /// Discard
    #[default]
    Null,
}

impl OutputSink {
    pub fn capture() -> Self {
        OutputSink::Capture(Vec::new())
    }

    fn stdio(&self) -> Stdio {
        match self {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::Capture(_) => Stdio::piped(),
            OutputSink::Null => Stdio::null(),
        }
    }

    /// Append bytes produced by a child. Inherited output is forwarded to
    /// the operator's stream given by `passthrough`.
    pub fn write_bytes(&mut self, bytes: &[u8], passthrough: &mut dyn Write) {
        match self {
            OutputSink::Capture(buf) => buf.extend_from_slice(bytes),
            OutputSink::Inherit => {
                if let Err(e) = passthrough.write_all(bytes) {
                    warn!(error = %e, "failed to forward child output");
                }
            }
            OutputSink::Null => {}
        }
    }

    /// Captured bytes, empty for the other sinks.
    pub fn captured(&self) -> &[u8] {
        match self {
            OutputSink::Capture(buf) => buf,
            _ => &[],
        }
    }

    pub fn into_captured(self) -> Vec<u8> {
        match self {
            OutputSink::Capture(buf) => buf,
            _ => Vec::new(),
        }
    }
}

/// Stdio wiring for one step.
#[derive(Debug, Default)]
pub struct StepIo {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    /// Bytes fed to the child's stdin; `None` attaches no stdin.
    pub stdin: Option<Vec<u8>>,
}

impl StepIo {
    /// Stream stdout/stderr straight to the operator's terminal.
    pub fn inherit() -> Self {
        Self {
            stdout: OutputSink::Inherit,
            stderr: OutputSink::Inherit,
            stdin: None,
        }
    }

    /// Collect stdout/stderr in memory.
    pub fn capture() -> Self {
        Self {
            stdout: OutputSink::capture(),
            stderr: OutputSink::capture(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Route bytes produced for stdout according to the stdout sink.
    pub fn write_stdout(&mut self, bytes: &[u8]) {
        self.stdout.write_bytes(bytes, &mut std::io::stdout());
    }

    /// Route bytes produced for stderr according to the stderr sink.
    pub fn write_stderr(&mut self, bytes: &[u8]) {
        self.stderr.write_bytes(bytes, &mut std::io::stderr());
    }
}

/// Spawn `cmd` in its own process group, wire its stdio per `io`, track
/// the child for shutdown and block until it exits.
///
/// A spawn failure is returned as-is; the exit status, zero or not, is the
/// caller's to interpret.
pub fn run_tracked(cmd: &mut Command, io: &mut StepIo) -> std::io::Result<ExitStatus> {
    cmd.stdin(if io.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(io.stdout.stdio())
    .stderr(io.stderr.stdio())
    .in_own_group();

    let mut child = cmd.spawn()?;
    let pid = child.id();

    ChildTracker::lock().track(pid);

    // Feed stdin from a separate thread so a chatty child can't deadlock us
    let writer = match (child.stdin.take(), io.stdin.take()) {
        (Some(mut pipe), Some(bytes)) => Some(std::thread::spawn(move || pipe.write_all(&bytes))),
        _ => None,
    };

    let output = child.wait_with_output();

    ChildTracker::lock().release(pid);

    let output = output?;

    if let Some(handle) = writer {
        match handle.join() {
            Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                warn!(pid, error = %e, "failed to write child stdin");
            }
            Err(_) => warn!(pid, "stdin writer thread panicked"),
            _ => {}
        }
    }

    io.stdout.write_bytes(&output.stdout, &mut std::io::stdout());
    io.stderr.write_bytes(&output.stderr, &mut std::io::stderr());

    Ok(output.status)
}

/// Decode an exit status into an exit code.
///
/// Signal-terminated children decode to `128 + signal` like a shell does.
/// `None` only when the platform reports neither.
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn reaped_within(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return true,
                Err(_) if !is_running(pid as i32) => return true,
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_track_release() {
        let mut tracker = ChildTracker::default();
        tracker.track(1234);
        tracker.track(5678);
        tracker.track(1234);
        assert_eq!(tracker.len(), 2);

        tracker.release(1234);
        tracker.release(5678);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_shut_down_stops_process_group() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_own_group()
            .spawn()
            .unwrap();
        let pid = child.id();

        let mut tracker = ChildTracker::default();
        tracker.track(pid);
        assert!(is_running(pid as i32));

        tracker.shut_down(Duration::from_millis(500));

        assert!(tracker.is_empty());
        assert!(reaped_within(pid, Duration::from_secs(2)));
    }

    #[test]
    fn test_shut_down_runs_once() {
        let mut tracker = ChildTracker::default();
        tracker.shut_down(Duration::ZERO);

        // tracked after shutdown began, never signalled
        tracker.track(999_999);
        tracker.shut_down(Duration::ZERO);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_missing_pid_is_not_running() {
        assert!(!is_running(999_999));
    }

    #[test]
    fn test_run_tracked_captures_output_and_feeds_stdin() {
        let mut io = StepIo::capture().with_stdin("hello from stdin");
        let status = run_tracked(Command::new("cat").arg("-"), &mut io).unwrap();

        assert!(status.success());
        assert_eq!(io.stdout.captured(), b"hello from stdin");
        assert!(io.stderr.captured().is_empty());
    }

    #[test]
    fn test_run_tracked_spawn_failure_is_error() {
        let mut io = StepIo::capture();
        let result = run_tracked(&mut Command::new("/nonexistent/slingshot-binary"), &mut io);
        assert!(result.is_err());
    }

    #[test]
    fn test_null_sink_discards() {
        let mut sink = OutputSink::Null;
        let mut passthrough = Vec::new();
        sink.write_bytes(b"dropped", &mut passthrough);
        assert!(sink.captured().is_empty());
        assert!(passthrough.is_empty());
    }

    #[test]
    fn test_inherit_sink_forwards() {
        let mut sink = OutputSink::Inherit;
        let mut passthrough = Vec::new();
        sink.write_bytes(b"shown", &mut passthrough);
        assert_eq!(passthrough, b"shown");
        assert!(sink.captured().is_empty());
    }

    #[test]
    fn test_exit_code_decodes_signal() {
        let mut io = StepIo::capture();
        let status = run_tracked(Command::new("sh").args(["-c", "kill -TERM $$"]), &mut io).unwrap();
        assert_eq!(exit_code(status), Some(128 + libc::SIGTERM));
    }

    #[test]
    fn test_exit_code_plain() {
        let mut io = StepIo::capture();
        let status = run_tracked(Command::new("sh").args(["-c", "exit 3"]), &mut io).unwrap();
        assert_eq!(exit_code(status), Some(3));
    }
}
