use spindle::fd_manager::{FdManager, TimeoutKind, fd_manager};

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::ptr;

#[test]
fn test_socket_is_detected_and_made_nonblocking() {
    let (socket, _peer) = UnixStream::pair().unwrap();
    let manager = FdManager::new();

    let ctx = manager.get(socket.as_raw_fd(), true).unwrap();

    assert!(ctx.is_init());
    assert!(ctx.is_socket());
    assert!(ctx.sys_nonblock());
    assert!(!ctx.user_nonblock());

    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);
}

#[test]
fn test_regular_file_is_not_a_socket() {
    let file = File::open(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml")).unwrap();
    let manager = FdManager::new();

    let ctx = manager.get(file.as_raw_fd(), true).unwrap();

    assert!(ctx.is_init());
    assert!(!ctx.is_socket());
    assert!(!ctx.sys_nonblock());
}

#[test]
fn test_get_without_create_and_del() {
    let (socket, _peer) = UnixStream::pair().unwrap();
    let fd = socket.as_raw_fd();
    let manager = FdManager::new();

    assert!(manager.get(fd, false).is_none());

    let created = manager.get(fd, true).unwrap();
    let again = manager.get(fd, false).unwrap();
    assert!(ptr::eq(&*created, &*again));

    manager.del(fd);
    assert!(manager.get(fd, false).is_none());
    assert!(manager.get(-1, true).is_none());
}

#[test]
fn test_timeouts_and_flags() {
    let (socket, _peer) = UnixStream::pair().unwrap();
    let ctx = fd_manager().get(socket.as_raw_fd(), true).unwrap();

    assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

    ctx.set_timeout(TimeoutKind::Recv, Some(250));
    ctx.set_timeout(TimeoutKind::Send, Some(1_000));
    assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(250));
    assert_eq!(ctx.timeout(TimeoutKind::Send), Some(1_000));

    ctx.set_timeout(TimeoutKind::Recv, None);
    assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

    ctx.set_user_nonblock(true);
    ctx.set_closed(true);
    assert!(ctx.user_nonblock());
    assert!(ctx.is_closed());

    fd_manager().del(socket.as_raw_fd());
}

#[test]
fn test_table_grows_on_demand() {
    let (socket, _peer) = UnixStream::pair().unwrap();
    let manager = FdManager::new();

    let high = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 300) };
    assert!(high >= 300);

    let ctx = manager.get(high, true).unwrap();
    assert_eq!(ctx.fd(), high);
    assert!(ctx.is_socket());

    unsafe { libc::close(high) };
}
