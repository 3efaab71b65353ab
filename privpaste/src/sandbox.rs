//! Per-process syscall policies.
//!
//! A policy is a deny list that is installed after the privilege drop
//! and before the process reads its first untrusted byte.  On Linux it
//! becomes a seccomp filter that fails the denied syscalls with `EPERM`;
//! `PR_SET_NO_NEW_PRIVS` is set first and the filter is synchronized to
//! every thread of the runtime.

use crate::error::Error;

/// Syscall deny list of one process role.
///
/// Installing consumes the policy, and [`Child::harden`] consumes the
/// child that owns the channels, so a process ends up with one policy.
///
/// [`Child::harden`]: crate::process::Child::harden
#[derive(Debug, PartialEq, Eq)]
pub struct SandboxPolicy {
    name: &'static str,
    denied: Vec<i64>,
}

impl SandboxPolicy {
    /// The store owns the disk: no networking or process control.
    pub fn store() -> Self {
        let mut denied = common();
        denied.extend(store_only());
        Self::new("store", denied)
    }

    /// The webserver owns the network: no filesystem access, not even
    /// path lookups that only return metadata.
    pub fn webserver() -> Self {
        let mut denied = common();
        denied.extend(filesystem());
        Self::new("webserver", denied)
    }

    fn new(name: &'static str, mut denied: Vec<i64>) -> Self {
        denied.sort_unstable();
        denied.dedup();
        Self { name, denied }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Denied syscall numbers.
    pub fn denied(&self) -> &[i64] {
        &self.denied
    }

    /// Irreversibly install the policy.
    pub fn install(self) -> Result<(), Error> {
        install(&self)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn install(policy: &SandboxPolicy) -> Result<(), Error> {
            use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
            use std::{collections::BTreeMap, io};

            if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
                return Err(Error::Sandbox("no_new_privs", io::Error::last_os_error().into()));
            }

            // An empty rule list matches the syscall unconditionally.
            let rules = policy
                .denied
                .iter()
                .map(|syscall| (*syscall, vec![]))
                .collect::<BTreeMap<i64, Vec<SeccompRule>>>();

            let arch: TargetArch = std::env::consts::ARCH
                .try_into()
                .map_err(|err: seccompiler::BackendError| Error::Sandbox("arch", err.into()))?;
            let filter = SeccompFilter::new(
                rules,
                SeccompAction::Allow,
                SeccompAction::Errno(libc::EPERM as u32),
                arch,
            )
            .map_err(|err| Error::Sandbox("filter", err.into()))?;
            let program: BpfProgram = filter
                .try_into()
                .map_err(|err: seccompiler::BackendError| Error::Sandbox("compile", err.into()))?;

            seccompiler::apply_filter_all_threads(&program)
                .map_err(|err| Error::Sandbox("seccomp", err.into()))?;

            Ok(())
        }

        fn common() -> Vec<i64> {
            let mut denied = vec![
                libc::SYS_execve,
                libc::SYS_execveat,
                libc::SYS_kill,
                libc::SYS_ptrace,
                libc::SYS_process_vm_writev,
                libc::SYS_mount,
                libc::SYS_umount2,
                libc::SYS_pivot_root,
                libc::SYS_chroot,
                libc::SYS_setuid,
                libc::SYS_setgid,
                libc::SYS_setreuid,
                libc::SYS_setregid,
                libc::SYS_setresuid,
                libc::SYS_setresgid,
                libc::SYS_setfsuid,
                libc::SYS_setfsgid,
                libc::SYS_setgroups,
                libc::SYS_reboot,
                libc::SYS_init_module,
                libc::SYS_finit_module,
                libc::SYS_delete_module,
                libc::SYS_swapon,
                libc::SYS_swapoff,
                libc::SYS_socket,
                libc::SYS_connect,
                libc::SYS_bind,
                libc::SYS_listen,
            ];
            #[cfg(target_arch = "x86_64")]
            denied.extend([libc::SYS_fork, libc::SYS_vfork]);
            denied
        }

        fn store_only() -> Vec<i64> {
            vec![libc::SYS_accept, libc::SYS_accept4]
        }

        fn filesystem() -> Vec<i64> {
            let mut denied = vec![
                libc::SYS_openat,
                libc::SYS_openat2,
                libc::SYS_open_by_handle_at,
                libc::SYS_name_to_handle_at,
                libc::SYS_mkdirat,
                libc::SYS_mknodat,
                libc::SYS_unlinkat,
                libc::SYS_renameat,
                libc::SYS_renameat2,
                libc::SYS_linkat,
                libc::SYS_symlinkat,
                libc::SYS_truncate,
                libc::SYS_fchmodat,
                libc::SYS_fchownat,
                libc::SYS_utimensat,
                libc::SYS_statx,
                libc::SYS_faccessat,
                libc::SYS_faccessat2,
                libc::SYS_readlinkat,
                libc::SYS_getdents64,
                libc::SYS_chdir,
                libc::SYS_fchdir,
            ];
            #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
            denied.push(libc::SYS_newfstatat);
            #[cfg(target_arch = "x86_64")]
            denied.extend([
                libc::SYS_open,
                libc::SYS_creat,
                libc::SYS_mkdir,
                libc::SYS_rmdir,
                libc::SYS_unlink,
                libc::SYS_rename,
                libc::SYS_link,
                libc::SYS_symlink,
                libc::SYS_chmod,
                libc::SYS_chown,
                libc::SYS_lchown,
                libc::SYS_stat,
                libc::SYS_lstat,
                libc::SYS_access,
                libc::SYS_readlink,
                libc::SYS_getdents,
                libc::SYS_utime,
                libc::SYS_utimes,
                libc::SYS_futimesat,
            ]);
            denied
        }
    } else {
        fn install(policy: &SandboxPolicy) -> Result<(), Error> {
            Err(Error::Sandbox(
                policy.name,
                "no sandbox support on this platform".into(),
            ))
        }

        fn common() -> Vec<i64> {
            vec![]
        }

        fn store_only() -> Vec<i64> {
            vec![]
        }

        fn filesystem() -> Vec<i64> {
            vec![]
        }
    }
}
