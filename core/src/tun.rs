//! TUN endpoint: opens and owns the virtual L3 network interface.
//!
//! Opens `/dev/net/tun`, issues `TUNSETIFF` with `IFF_TUN | IFF_NO_PI` so
//! reads and writes carry whole raw IP datagrams with no link-layer
//! prefix, then `TUNSETPERSIST` so the interface survives process exit.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::endpoint::RawEndpoint;
use crate::error::{FatalReason, LoopResult};

const TUN_DEV: &str = "/dev/net/tun";

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

// Both derived from `_IOW('T', 202/203, int)` in linux/if_tun.h for the
// platforms this daemon targets.
const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54CB;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // rest of the union in struct ifreq, unused here
}

pub struct TunEndpoint {
    file: File,
    name: String,
}

impl TunEndpoint {
    /// Open the TUN device, optionally requesting `name`, and mark it
    /// persistent. Returns the resolved interface name on success.
    pub fn open(requested_name: Option<&str>) -> LoopResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_DEV)
            .map_err(|_| FatalReason::ResourceInit("open /dev/net/tun"))?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };

        if let Some(name) = requested_name {
            let cname = CString::new(name).map_err(|_| FatalReason::ResourceInit("interface name"))?;
            let bytes = cname.as_bytes_with_nul();
            let len = bytes.len().min(IFNAMSIZ);
            for (dst, src) in ifr.ifr_name[..len].iter_mut().zip(bytes.iter()) {
                *dst = *src as libc::c_char;
            }
        }

        let fd = file.as_raw_fd();
        unsafe {
            if libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReq) < 0 {
                return Err(FatalReason::ResourceInit("TUNSETIFF").into());
            }
            if libc::ioctl(fd, TUNSETPERSIST, 1) < 0 {
                return Err(FatalReason::ResourceInit("TUNSETPERSIST").into());
            }
        }

        let name = ifname_to_string(&ifr.ifr_name);
        Ok(TunEndpoint { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one whole IP datagram. Short reads are not expected for L3
    /// tunnels; a zero-length read means the device went away. `buf` must
    /// be at least `MAX_PACKET_SIZE` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> LoopResult<usize> {
        use std::io::Read;
        match self.file.read(buf) {
            Ok(0) => Err(FatalReason::PeerClosed.into()),
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    /// Write one whole IP datagram. A partial write is logged by the
    /// caller as an anomaly, not treated as fatal (the kernel may discard).
    pub fn write(&mut self, buf: &[u8]) -> LoopResult<usize> {
        use std::io::Write;
        self.file.write(buf).map_err(Into::into)
    }
}

impl AsRawFd for TunEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl RawEndpoint for TunEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> LoopResult<usize> {
        TunEndpoint::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> LoopResult<usize> {
        TunEndpoint::write(self, buf)
    }
}

fn ifname_to_string(raw: &[libc::c_char; IFNAMSIZ]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
