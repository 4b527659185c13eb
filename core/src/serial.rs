//! Serial endpoint: opens and configures the raw 8N1 byte-stream device.
//!
//! Raw mode, no echo, no signal generation, no input/output translation,
//! no parity, no hardware flow control, at a selectable baud rate
//! (default 9600).

use std::fs::{File, OpenOptions};
use std::mem::MaybeUninit;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::endpoint::RawEndpoint;
use crate::error::{FatalReason, LoopResult};

pub const DEFAULT_BAUD: u32 = 9600;

pub struct SerialEndpoint {
    file: File,
}

impl SerialEndpoint {
    pub fn open<P: AsRef<Path>>(path: P, baud: u32) -> LoopResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|_| FatalReason::ResourceInit("open serial device"))?;

        configure_raw(file.as_raw_fd(), baud)?;

        Ok(SerialEndpoint { file })
    }

    /// Read whatever is currently available, up to `buf`'s capacity.
    pub fn read(&mut self, buf: &mut [u8]) -> LoopResult<usize> {
        use std::io::Read;
        match self.file.read(buf) {
            Ok(0) => Err(FatalReason::PeerClosed.into()),
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    /// Write as much of `buf` as the device accepts right now. A short
    /// write is not an error; the caller logs it and moves on.
    pub fn write(&mut self, buf: &[u8]) -> LoopResult<usize> {
        use std::io::Write;
        self.file.write(buf).map_err(Into::into)
    }
}

impl AsRawFd for SerialEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl RawEndpoint for SerialEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> LoopResult<usize> {
        SerialEndpoint::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> LoopResult<usize> {
        SerialEndpoint::write(self, buf)
    }
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    })
}

fn configure_raw(fd: RawFd, baud: u32) -> LoopResult<()> {
    let speed = baud_constant(baud).ok_or(FatalReason::ResourceInit("unsupported baud rate"))?;

    unsafe {
        let mut tty: libc::termios = {
            let mut uninit = MaybeUninit::<libc::termios>::uninit();
            if libc::tcgetattr(fd, uninit.as_mut_ptr()) != 0 {
                return Err(FatalReason::ResourceInit("tcgetattr").into());
            }
            uninit.assume_init()
        };

        libc::cfsetispeed(&mut tty, speed);
        libc::cfsetospeed(&mut tty, speed);

        tty.c_cflag |= libc::CLOCAL | libc::CREAD;
        tty.c_cflag &= !libc::CSIZE;
        tty.c_cflag |= libc::CS8;
        tty.c_cflag &= !libc::PARENB;
        tty.c_cflag &= !libc::CSTOPB;
        tty.c_cflag &= !libc::CRTSCTS;

        tty.c_iflag &= !(libc::IGNBRK
            | libc::BRKINT
            | libc::PARMRK
            | libc::ISTRIP
            | libc::INLCR
            | libc::IGNCR
            | libc::ICRNL
            | libc::IXON);
        tty.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
        tty.c_oflag &= !libc::OPOST;

        if libc::tcsetattr(fd, libc::TCSAFLUSH, &tty) != 0 {
            return Err(FatalReason::ResourceInit("tcsetattr").into());
        }
    }

    Ok(())
}
