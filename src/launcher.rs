// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Worker process launching.
//!
//! The child gets the message socket at descriptor 0, extra descriptors at
//! 3, 4, ... in plan order and the optional dev-disconnect file at 101.
//! Standard output and error are inherited; everything else is closed.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, sysconf, ForkResult, Pid, SysconfVar};

/// Slot of the message socket in the worker.
pub const MSG_FD: RawFd = 0;
/// Slot of the first extra descriptor in the worker.
pub const FIRST_EXTRA_FD: RawFd = 3;
/// Slot of the developer disconnect file in the worker.
pub const DEV_DISCONNECT_FD: RawFd = 101;

/// Exit status of a child which failed to exec.
const EXEC_FAILED: i32 = 127;

#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum SpawnError {
    /// unable to create the worker socket: {0}
    Socket(Errno),

    /// unable to create the exec status pipe: {0}
    Pipe(Errno),

    /// unable to fork: {0}
    Fork(Errno),

    /// unable to execute `{0}`: {1}
    Exec(String, Errno),

    /// path to `{0}` is not a valid C string
    BadPath(String),
}

/// Ordered extra descriptors for a worker, mapped to slots 3, 4, ...
/// They are closed in the parent once the spawn attempt is over.
#[derive(Debug, Default)]
pub struct DescriptorPlan {
    extra: Vec<OwnedFd>,
}

impl DescriptorPlan {
    pub fn new() -> DescriptorPlan { DescriptorPlan::default() }

    pub fn with_owned(mut self, fd: OwnedFd) -> Self {
        self.extra.push(fd);
        self
    }

}

/// Developer hooks applied to every launched worker.
#[derive(Clone, Debug, Default)]
pub struct DebugOptions {
    /// Workers whose name ends with this suffix get `--debugger`.
    pub debugger_for: Option<String>,
    /// Descriptor of the `--dev-disconnect` file, if any.
    pub disconnect_fd: Option<RawFd>,
}

/// Launches `dir/name` and returns its pid together with the master side
/// of the message socket. Owned entries of `plan` are closed in the parent
/// whether or not the launch succeeds.
pub fn spawn(
    dir: &Path,
    name: &str,
    plan: DescriptorPlan,
    debug: &DebugOptions,
) -> Result<(Pid, UnixStream), SpawnError> {
    let c_string = |s: Vec<u8>| CString::new(s).map_err(|_| SpawnError::BadPath(name.to_owned()));
    let path = c_string(dir.join(name).as_os_str().as_bytes().to_vec())?;
    let mut args = vec![c_string(name.into())?];
    if debug.disconnect_fd.is_some() {
        args.push(c_string(format!("--dev-disconnect={}", DEV_DISCONNECT_FD).into())?);
    }
    if matches!(&debug.debugger_for, Some(suffix) if name.ends_with(suffix.as_str())) {
        args.push(c_string("--debugger".into())?);
    }
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
    argv.push(std::ptr::null());

    let (master, worker) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(SpawnError::Socket)?;
    // SAFETY: fresh descriptors returned by socketpair(2)/pipe2(2)
    let (master, worker) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(worker)) };
    let (status_rx, status_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::Pipe)?;
    let (status_rx, status_tx) =
        unsafe { (OwnedFd::from_raw_fd(status_rx), OwnedFd::from_raw_fd(status_tx)) };

    let mut remap = vec![(worker.as_raw_fd(), MSG_FD)];
    for (slot, source) in (FIRST_EXTRA_FD..).zip(&plan.extra) {
        remap.push((source.as_raw_fd(), slot));
    }
    let next_slot = FIRST_EXTRA_FD + plan.extra.len() as RawFd;
    if let Some(fd) = debug.disconnect_fd {
        remap.push((fd, DEV_DISCONNECT_FD));
    }
    let open_max = sysconf(SysconfVar::OPEN_MAX).ok().flatten().unwrap_or(1024) as RawFd;
    let mut scratch = vec![-1; remap.len()];

    // SAFETY: the child only performs async-signal-safe calls on memory
    // prepared above before replacing its image or exiting.
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Child => unsafe {
            exec_child(
                &path,
                &argv,
                &remap,
                &mut scratch,
                next_slot,
                open_max,
                status_tx.as_raw_fd(),
                debug.disconnect_fd.is_some(),
            )
        },
        ForkResult::Parent { child } => {
            drop(worker);
            drop(status_tx);
            drop(plan);

            let mut report = vec![];
            let read = File::from(status_rx).read_to_end(&mut report);
            if matches!(read, Ok(0)) {
                return Ok((child, UnixStream::from(master)));
            }
            let errno = match report.as_slice() {
                [a, b, c, d] => Errno::from_i32(i32::from_ne_bytes([*a, *b, *c, *d])),
                _ => Errno::EIO,
            };
            let _ = waitpid(child, None);
            Err(SpawnError::Exec(name.to_owned(), errno))
        }
    }
}

/// Launches a worker which the master does not supervise: there is no
/// read loop, and the caller hands the returned message socket straight to
/// another worker. The caller also reaps `pid`, see [`reap_within`].
pub fn launch_raw(
    dir: &Path,
    name: &str,
    plan: DescriptorPlan,
    debug: &DebugOptions,
) -> Result<(Pid, OwnedFd), SpawnError> {
    let (pid, stream) = spawn(dir, name, plan, debug)?;
    debug!("{}({}): launched unsupervised, msgfd {}", name, pid, stream.as_raw_fd());
    Ok((pid, OwnedFd::from(stream)))
}

/// Waits up to `timeout` for `pid` to exit and kills it afterwards.
/// Returns `None` when the exit status can not be told.
pub async fn reap_within(pid: Pid, timeout: Duration) -> Option<WaitStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await
            }
            Ok(WaitStatus::StillAlive) => {
                debug!("{} did not exit in time, killing", pid);
                let _ = kill(pid, Signal::SIGKILL);
                return waitpid(pid, None).ok();
            }
            Ok(status) => return Some(status),
            Err(err) => {
                warn!("waitpid {} says {}", pid, err);
                return None;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn exec_child(
    path: &CString,
    argv: &[*const libc::c_char],
    remap: &[(RawFd, RawFd)],
    scratch: &mut [RawFd],
    next_slot: RawFd,
    open_max: RawFd,
    status_tx: RawFd,
    keep_disconnect: bool,
) -> ! {
    let above = remap.iter().map(|(_, target)| *target).max().unwrap_or(0) + 1;
    // the status pipe must not sit on a target slot either
    let status_tx = libc::fcntl(status_tx, libc::F_DUPFD_CLOEXEC, above);
    if status_tx < 0 {
        libc::_exit(EXEC_FAILED);
    }
    for ((source, _), temp) in remap.iter().zip(scratch.iter_mut()) {
        *temp = libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, above);
        if *temp < 0 {
            report_errno(status_tx);
        }
    }
    for ((_, target), temp) in remap.iter().zip(scratch.iter()) {
        if libc::dup2(*temp, *target) < 0 {
            report_errno(status_tx);
        }
    }
    for fd in next_slot..open_max {
        if fd == status_tx || (keep_disconnect && fd == DEV_DISCONNECT_FD) {
            continue;
        }
        libc::close(fd);
    }
    libc::execv(path.as_ptr(), argv.as_ptr());
    report_errno(status_tx)
}

unsafe fn report_errno(status_tx: RawFd) -> ! {
    let errno = Errno::last() as i32;
    let bytes = errno.to_ne_bytes();
    libc::write(status_tx, bytes.as_ptr() as *const libc::c_void, bytes.len());
    libc::_exit(EXEC_FAILED)
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use nix::unistd::pipe;

    use super::*;

    #[test]
    fn missing_executable_is_reported() {
        let (rx, tx) = pipe().unwrap();
        let (rx, tx) = unsafe { (File::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) };
        let plan = DescriptorPlan::new().with_owned(tx);
        let err = spawn(Path::new("/nonexistent"), "lightning_nothing", plan, &DebugOptions::default())
            .unwrap_err();
        assert!(matches!(err, SpawnError::Exec(ref name, Errno::ENOENT) if name == "lightning_nothing"));

        // the owned descriptor was closed, so the pipe reports end of stream
        let mut rx = rx;
        let mut buf = vec![];
        assert_eq!(rx.read_to_end(&mut buf).unwrap(), 0);
    }

    #[test]
    fn true_runs_and_exits() {
        let (pid, _stream) =
            spawn(Path::new("/bin"), "true", DescriptorPlan::new(), &DebugOptions::default())
                .unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn worker_holds_the_message_socket() {
        // `cat` echoes its stdin, which is the message socket, to stdout
        let (pid, stream) =
            spawn(Path::new("/bin"), "cat", DescriptorPlan::new(), &DebugOptions::default())
                .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn unsupervised_worker_socket_closes_on_exit() {
        let (pid, fd) =
            launch_raw(Path::new("/bin"), "true", DescriptorPlan::new(), &DebugOptions::default())
                .unwrap();
        let mut socket = File::from(fd);
        let mut buf = vec![];
        assert_eq!(socket.read_to_end(&mut buf).unwrap(), 0);
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lingering_worker_is_killed() {
        // `cat` keeps running while its message socket is open
        let (pid, _fd) =
            launch_raw(Path::new("/bin"), "cat", DescriptorPlan::new(), &DebugOptions::default())
                .unwrap();
        let status = reap_within(pid, Duration::from_millis(200)).await;
        assert_eq!(status, Some(WaitStatus::Signaled(pid, Signal::SIGKILL, false)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exited_worker_is_reaped() {
        let (pid, fd) =
            launch_raw(Path::new("/bin"), "cat", DescriptorPlan::new(), &DebugOptions::default())
                .unwrap();
        drop(fd);
        let status = reap_within(pid, Duration::from_secs(5)).await;
        assert_eq!(status, Some(WaitStatus::Exited(pid, 0)));
    }

    #[test]
    fn bad_name_is_rejected() {
        let err = spawn(Path::new("/bin"), "tr\0ue", DescriptorPlan::new(), &DebugOptions::default())
            .unwrap_err();
        assert!(matches!(err, SpawnError::BadPath(_)));
    }
}
