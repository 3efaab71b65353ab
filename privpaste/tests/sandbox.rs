//! The webserver policy, installed for real.
//!
//! A seccomp filter cannot be removed again, so this binary holds a
//! single test and nothing else runs after it.
#![cfg(target_os = "linux")]

use privpaste::sandbox::SandboxPolicy;
use std::{
    ffi::CString,
    fs::File,
    io::{self, Read, Write},
    mem,
    os::unix::net::UnixStream,
};

/// `struct open_how` of `openat2(2)`.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

fn last_errno() -> Option<i32> {
    io::Error::last_os_error().raw_os_error()
}

#[test]
fn test_webserver_policy_blocks_filesystem() {
    let path = CString::new("/etc/passwd").unwrap();
    let manifest = env!("CARGO_MANIFEST_DIR");

    // Everything below is reachable before the filter is in place.
    assert!(File::open(manifest).is_ok());

    SandboxPolicy::webserver().install().unwrap();

    let how = OpenHow::default();
    let fd = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            libc::AT_FDCWD,
            path.as_ptr(),
            &how as *const OpenHow,
            mem::size_of::<OpenHow>(),
        )
    };
    assert_eq!(fd, -1);
    assert_eq!(last_errno(), Some(libc::EPERM));

    let err = File::open("/etc/passwd").unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));

    let mut stat = unsafe { mem::zeroed::<libc::stat>() };
    let result = unsafe { libc::fstatat(libc::AT_FDCWD, path.as_ptr(), &mut stat, 0) };
    assert_eq!(result, -1);
    assert_eq!(last_errno(), Some(libc::EPERM));

    let result = unsafe { libc::access(path.as_ptr(), libc::R_OK) };
    assert_eq!(result, -1);
    assert_eq!(last_errno(), Some(libc::EPERM));

    assert!(std::env::set_current_dir(manifest).is_err());

    // New sockets are denied, existing channels keep working.
    assert!(std::net::TcpListener::bind("127.0.0.1:0").is_err());
    let (mut a, mut b) = UnixStream::pair().unwrap();
    a.write_all(b"still talking").unwrap();
    drop(a);
    let mut content = String::new();
    b.read_to_string(&mut content).unwrap();
    assert_eq!(content, "still talking");
}
