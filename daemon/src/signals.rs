//! Self-pipe signal delivery: each handled signal writes its own number,
//! as a 4-byte host-order integer, into the write end of a pipe whose
//! read end the pipeline polls like any other fd.

use std::io;
use std::os::unix::io::RawFd;

const HANDLED: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT];

/// Returns the read end of the pipe. Registration is permanent for the
/// life of the process; there is no matching `unregister`.
pub fn install() -> io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    for &signal in &HANDLED {
        unsafe {
            signal_hook::low_level::register(signal, move || {
                let bytes = signal.to_ne_bytes();
                libc::write(write_fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
            })
        }
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to install signal handler"))?;
    }

    Ok(read_fd)
}
