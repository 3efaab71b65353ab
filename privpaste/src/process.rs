//! Setup of the privilege-separated processes.
//!
//! The parent creates the control and descriptor channel pairs, forks,
//! and executes itself once per child with `argv[0]` set to the child's
//! role.  Each child finds its channel ends at [`CONTROL_FD`] and
//! [`DESCRIPTOR_FD`].  A child can only reach its channels through
//! [`Child::harden`], which drops privileges and installs the sandbox
//! before it hands them out.

use crate::{
    error::Error,
    imsg::Handler,
    net::{set_cloexec, Fd},
    sandbox::SandboxPolicy,
    Role,
};
use arrayvec::ArrayVec;
use close_fds::close_open_fds;
use derive_more::{Deref, Display};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{
        self, chdir, chroot, dup2, execve, fork, getegid, geteuid, getgid, getpid, getuid,
        ForkResult, Gid, Group, Pid, Uid, User,
    },
};
use privpaste_log::{debug, error, info, warn};
use std::{
    borrow::Cow,
    env,
    ffi::{CStr, CString, OsString},
    fs::DirBuilder,
    os::unix::{
        ffi::OsStrExt,
        fs::DirBuilderExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
    time::Duration,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{self, Instant},
};

/// Slot of the control channel in a child.
pub const CONTROL_FD: RawFd = 3;

/// Slot of the descriptor channel in a child.
pub const DESCRIPTOR_FD: RawFd = 4;

/// Directory that serves as an empty jail.
const EMPTY_DIR: &str = "/var/empty";

/// Interval of the exit polling during shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Hardening options of the child processes.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// This stops requiring root and disables chroot and privdrop.
    pub disable_privdrop: bool,
    /// Do not install the syscall filter.
    pub disable_sandbox: bool,
    /// The privdrop username.
    pub username: Cow<'static, str>,
    /// The privdrop group, defaults to the user's primary group.
    pub groupname: Option<String>,
}

impl Options {
    /// Look up the privdrop user and group.
    pub fn credentials(&self) -> Result<(User, Gid), Error> {
        let user = User::from_name(&self.username)?
            .ok_or_else(|| Error::UserNotFound(self.username.clone()))?;
        let gid = match &self.groupname {
            Some(name) => {
                Group::from_name(name)?
                    .ok_or_else(|| Error::GroupNotFound(name.clone()))?
                    .gid
            }
            None => user.gid,
        };
        Ok((user, gid))
    }
}

/// A child process from the parent point of view.
#[derive(Debug, Display)]
#[display(fmt = "{}({})", "role", "pid")]
pub struct Peer {
    pub role: Role,
    pub pid: Pid,
    /// Exit status once the child was reaped.
    status: Option<String>,
}

impl Peer {
    /// Reap the child if it has exited, without blocking.
    fn try_wait(&mut self) -> Result<bool, Error> {
        if self.status.is_some() {
            return Ok(true);
        }
        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => format!("exit code {}", code),
            Ok(WaitStatus::Signaled(_, signal, _)) => format!("signal {:?}", signal),
            Ok(_) => return Ok(false),
            Err(Errno::ECHILD) => "unknown status".to_string(),
            Err(err) => return Err(err.into()),
        };
        debug!("child reaped"; "process" => %self, "status" => &status);
        self.status = Some(status);
        Ok(true)
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

/// The list of child processes.
pub type Peers = ArrayVec<Peer, 2>;

/// The privileged parent.
#[derive(Debug, Display, Deref)]
#[display(fmt = "{}({})", "Role::PARENT", "pid")]
pub struct Parent {
    /// Process PID.
    pub pid: Pid,
    /// Child processes, in spawn order.
    #[deref]
    pub children: Peers,
}

impl Parent {
    /// Create the channels, then fork and execute the children.
    ///
    /// Every child is executed with its role as `argv[0]` followed by
    /// `args`.  `RUST_LOG` is the only environment variable that is
    /// passed on.
    pub fn spawn(args: &[OsString], options: &Options) -> Result<Self, Error> {
        if !options.disable_privdrop && !getuid().is_root() {
            return Err(Error::PermissionDenied);
        }

        let program = cstring(env::current_exe()?.as_os_str().as_bytes())?;
        let environment = [cstring(
            format!("RUST_LOG={}", env::var("RUST_LOG").unwrap_or_default()).as_bytes(),
        )?];

        // One channel pair has exactly two ends, one per child.
        let (control, descriptors) = (Handler::socketpair()?, Handler::socketpair()?);
        let ends = [(control.0, descriptors.0), (control.1, descriptors.1)];

        let mut children = Peers::new();
        for (role, (control, descriptors)) in Role::CHILDREN.into_iter().zip(ends) {
            // Allocate everything before forking.
            let mut argv = vec![cstring(role.name().as_bytes())?];
            for arg in args {
                argv.push(cstring(arg.as_bytes())?);
            }

            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    debug!("spawned child"; "role" => %role, "pid" => %child);
                    children.push(Peer {
                        role,
                        pid: child,
                        status: None,
                    });
                }
                Ok(ForkResult::Child) => {
                    exec_child(&program, &argv, &environment, &control, &descriptors)
                }
                Err(err) => {
                    for peer in &children {
                        let _ = kill(peer.pid, Signal::SIGKILL);
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            pid: getpid(),
            children,
        })
    }

    /// Wait for a termination signal or for a child to exit.
    ///
    /// A child that exits on its own takes the other one down with it
    /// and is reported as an error.
    pub async fn supervise(mut self, timeout: Duration) -> Result<(), Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigchld = signal(SignalKind::child())?;
        let mut poll = time::interval(Duration::from_secs(1));

        info!("supervising"; "process" => %self, "children" => self.children.len());

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    return self.shutdown(timeout).await;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    return self.shutdown(timeout).await;
                }
                _ = sigchld.recv() => {}
                _ = poll.tick() => {}
            }

            let mut exited = None;
            for peer in self.children.iter_mut() {
                if peer.try_wait()? {
                    exited = Some((peer.role, peer.status().unwrap_or_default().to_string()));
                    break;
                }
            }

            if let Some((role, status)) = exited {
                error!("child exited unexpectedly"; "role" => %role, "status" => &status);
                self.shutdown(timeout).await?;
                return Err(Error::ChildExited(role, status));
            }
        }
    }

    /// Stop the children in reverse spawn order.
    ///
    /// Each child gets `SIGTERM`; all of them together get `timeout` to
    /// exit before the remaining ones are killed.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;

        for peer in self.children.iter_mut().rev() {
            if peer.try_wait()? {
                continue;
            }
            debug!("stopping child"; "process" => %peer);
            let _ = kill(peer.pid, Signal::SIGTERM);

            while !peer.try_wait()? {
                if Instant::now() >= deadline {
                    warn!("child did not stop in time, killing it"; "process" => %peer);
                    let _ = kill(peer.pid, Signal::SIGKILL);
                    let _ = waitpid(peer.pid, None);
                    peer.status = Some("killed".to_string());
                    break;
                }
                time::sleep(POLL_INTERVAL).await;
            }
        }

        info!("all children stopped");

        Ok(())
    }
}

/// Move the channel ends into their slots and execute the child.
///
/// This runs between `fork` and `execve`, so it only makes plain
/// system calls and never returns.
fn exec_child(
    program: &CStr,
    argv: &[CString],
    environment: &[CString],
    control: &Fd,
    descriptors: &Fd,
) -> ! {
    let result = (|| -> Result<(), Errno> {
        // The ends may already sit in the target slots; get them out of
        // the way first.
        let control = fcntl(control.as_raw_fd(), FcntlArg::F_DUPFD(10))?;
        let descriptors = fcntl(descriptors.as_raw_fd(), FcntlArg::F_DUPFD(10))?;
        dup2(control, CONTROL_FD)?;
        dup2(descriptors, DESCRIPTOR_FD)?;

        #[cfg(target_os = "linux")]
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        }

        // Close everything else that was inherited.
        unsafe {
            close_open_fds(DESCRIPTOR_FD + 1, &[]);
        }

        execve(program, argv, environment)?;
        Ok(())
    })();

    if result.is_err() {
        const MESSAGE: &[u8] = b"privpasted: failed to execute child process\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
        }
    }

    unsafe { libc::_exit(127) }
}

/// A child process before it is hardened.
#[derive(Debug, Display)]
#[display(fmt = "{}({})", "role", "pid")]
pub struct Child {
    pub role: Role,
    pub pid: Pid,
    control: Handler,
    descriptors: Handler,
}

impl Child {
    /// Take over the channels at the fixed descriptor slots.
    pub fn adopt(role: Role) -> Result<Self, Error> {
        set_cloexec(CONTROL_FD, true)?;
        set_cloexec(DESCRIPTOR_FD, true)?;
        let control = Handler::from_raw_fd(CONTROL_FD)?;
        let descriptors = Handler::from_raw_fd(DESCRIPTOR_FD)?;

        Ok(Self {
            role,
            pid: getpid(),
            control,
            descriptors,
        })
    }

    /// Drop privileges and install the sandbox policy.
    ///
    /// `root` becomes the new root directory, `/var/empty` without it.
    /// The channels are only available from the returned value.
    pub fn harden(
        self,
        root: Option<&Path>,
        policy: SandboxPolicy,
        options: &Options,
    ) -> Result<Sandboxed, Error> {
        let policy_name = policy.name();
        if options.disable_privdrop {
            warn!("running without privilege drop"; "process" => %self);
        } else {
            privdrop(root, options)?;
        }

        if options.disable_sandbox {
            warn!("running without sandbox"; "process" => %self);
        } else {
            policy.install()?;
        }

        info!("process hardened";
            "process" => %self,
            "uid" => %getuid(),
            "policy" => policy_name);

        Ok(Sandboxed {
            role: self.role,
            pid: self.pid,
            control: self.control,
            descriptors: self.descriptors,
        })
    }
}

/// A hardened child process.
#[derive(Debug, Display)]
#[display(fmt = "{}({})", "role", "pid")]
pub struct Sandboxed {
    pub role: Role,
    pub pid: Pid,
    control: Handler,
    descriptors: Handler,
}

impl Sandboxed {
    /// Return the control and the descriptor channel.
    pub fn into_channels(self) -> (Handler, Handler) {
        (self.control, self.descriptors)
    }
}

/// Change the root directory and switch to the unprivileged user.
///
/// Fails unless the process verifiably lost its privileges.
pub fn privdrop(root: Option<&Path>, options: &Options) -> Result<(), Error> {
    let (user, gid) = options.credentials()?;

    // chroot and change the working directory.
    let dir = match root {
        Some(root) => root,
        None => {
            let empty = Path::new(EMPTY_DIR);
            if !empty.is_dir() {
                DirBuilder::new().recursive(true).mode(0o755).create(empty)?;
            }
            empty
        }
    };
    chroot(dir).map_err(|err| Error::Privdrop("chroot", err.into()))?;
    chdir("/").map_err(|err| Error::Privdrop("chdir", err.into()))?;

    // Set the supplementary groups.
    #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
    unistd::setgroups(&[gid]).map_err(|err| Error::Privdrop("setgroups", err.into()))?;

    // Drop the privileges.
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            unistd::setresgid(gid, gid, gid)
                .map_err(|err| Error::Privdrop("setresgid", err.into()))?;
            unistd::setresuid(user.uid, user.uid, user.uid)
                .map_err(|err| Error::Privdrop("setresuid", err.into()))?;
        } else {
            unistd::setegid(gid).map_err(|err| Error::Privdrop("setegid", err.into()))?;
            unistd::setgid(gid).map_err(|err| Error::Privdrop("setgid", err.into()))?;
            // seteuid before setuid fails on macOS (and AIX...)
            #[cfg(not(any(target_os = "ios", target_os = "macos")))]
            unistd::seteuid(user.uid).map_err(|err| Error::Privdrop("seteuid", err.into()))?;
            unistd::setuid(user.uid).map_err(|err| Error::Privdrop("setuid", err.into()))?;
        }
    }

    verify_privdrop(user.uid, gid)
}

fn verify_privdrop(uid: Uid, gid: Gid) -> Result<(), Error> {
    if getuid() != uid || geteuid() != uid || getgid() != gid || getegid() != gid {
        return Err(Error::Privdrop(
            "verify",
            "process credentials did not change".into(),
        ));
    }
    if !uid.is_root() && unistd::setuid(Uid::from_raw(0)).is_ok() {
        return Err(Error::Privdrop("verify", "process regained root".into()));
    }
    Ok(())
}

fn cstring(bytes: &[u8]) -> Result<CString, Error> {
    CString::new(bytes).map_err(|_| Error::Config("argument contains a NUL byte".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    /// Fork a child that runs `setup`, reports back and then waits for
    /// signals forever.
    fn fork_child(setup: fn()) -> Pid {
        let (ready, notify) = unistd::pipe().unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => {
                unistd::close(notify).unwrap();
                let mut byte = [0u8; 1];
                unistd::read(ready, &mut byte).unwrap();
                unistd::close(ready).unwrap();
                child
            }
            ForkResult::Child => unsafe {
                setup();
                libc::write(notify, b".".as_ptr().cast(), 1);
                loop {
                    libc::pause();
                }
            },
        }
    }

    fn ignore_sigterm() {
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    fn default_sigterm() {
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
        }
    }

    fn exit_early() {
        unsafe { libc::_exit(3) }
    }

    fn peer(role: Role, pid: Pid) -> Peer {
        Peer {
            role,
            pid,
            status: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_kills_after_deadline() {
        let pid = fork_child(ignore_sigterm);
        let mut parent = Parent {
            pid: getpid(),
            children: [peer(Role::Webserver, pid)].into_iter().collect(),
        };

        let started = StdInstant::now();
        parent.shutdown(Duration::from_millis(200)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
        assert_eq!(parent.children[0].status(), Some("killed"));
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_stops_cooperative_child() {
        let pid = fork_child(default_sigterm);
        let mut parent = Parent {
            pid: getpid(),
            children: [peer(Role::Store, pid)].into_iter().collect(),
        };

        parent.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(parent.children[0].status(), Some("signal SIGTERM"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervise_tears_down_on_child_exit() {
        let store = fork_child(exit_early);
        let webserver = fork_child(default_sigterm);
        let parent = Parent {
            pid: getpid(),
            children: [peer(Role::Store, store), peer(Role::Webserver, webserver)]
                .into_iter()
                .collect(),
        };

        let err = parent.supervise(Duration::from_secs(5)).await.unwrap_err();
        assert!(
            matches!(&err, Error::ChildExited(Role::Store, status) if status == "exit code 3"),
            "{}",
            err
        );
        // The other child was stopped and reaped as well.
        assert_eq!(
            waitpid(webserver, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }

    #[test]
    fn test_exec_failure_is_reported() {
        let program = cstring(b"/nonexistent/privpasted").unwrap();
        let argv = [cstring(b"store").unwrap()];
        let (control, _control_peer) = Handler::socketpair().unwrap();
        let (descriptors, _descriptors_peer) = Handler::socketpair().unwrap();
        let (output, stderr) = unistd::pipe().unwrap();

        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                if dup2(stderr, libc::STDERR_FILENO).is_err() {
                    unsafe { libc::_exit(1) }
                }
                exec_child(&program, &argv, &[], &control, &descriptors)
            }
        };
        unistd::close(stderr).unwrap();

        let mut message = vec![];
        let mut buf = [0u8; 128];
        loop {
            match unistd::read(output, &mut buf).unwrap() {
                0 => break,
                length => message.extend_from_slice(&buf[..length]),
            }
        }
        unistd::close(output).unwrap();

        assert_eq!(waitpid(pid, None), Ok(WaitStatus::Exited(pid, 127)));
        assert_eq!(
            String::from_utf8(message).unwrap(),
            "privpasted: failed to execute child process\n"
        );
    }
}
