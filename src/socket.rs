//! Thin FFI wrapper around the raw `PF_PACKET` socket and the handful of
//! `ioctl`s this module needs. Grounded on the teacher's `socket.rs`
//! (`Socket`, `IfReq`, the ioctl-via-union trick); generalized from
//! interface-flags toggling to the `ioctl`s the engine actually needs
//! (`SIOCGIFINDEX`, `SIOCGIFHWADDR`) since promiscuous mode is now carried
//! via `PACKET_ADD_MEMBERSHIP` (socket-scoped, auto-dropped on close)
//! rather than a persistent interface-flag change.

use libc::{
    c_int, c_short, c_uint, c_ulong, c_void, close, getsockopt, if_nametoindex, ioctl, setsockopt,
    socket, socklen_t, IF_NAMESIZE, SOCK_RAW, SOL_PACKET,
};
pub use libc::{AF_PACKET, ETH_P_ALL, PF_PACKET};

use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::tpacket::{SIOCGIFHWADDR, SIOCGIFINDEX};

const IFREQUNIONSIZE: usize = 24;

#[repr(C)]
struct IfReq {
    ifr_name: [i8; IF_NAMESIZE],
    data: [u8; IFREQUNIONSIZE],
}

impl IfReq {
    /// Reads the first two bytes of the union as a `c_short` — valid for
    /// both `ifr_flags` and `ifr_hwaddr.sa_family`, which both place their
    /// value at the union's base offset.
    fn as_short(&self) -> c_short {
        (self.data[0] as c_short) | ((self.data[1] as c_short) << 8)
    }

    fn as_int(&self) -> c_int {
        i32::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    fn with_if_name(if_name: &str) -> Result<IfReq> {
        let mut req = IfReq::default();
        if if_name.len() >= req.ifr_name.len() {
            return Err(Error::new(ErrorKind::Other, "Interface name too long"));
        }
        for (a, c) in req.ifr_name.iter_mut().zip(if_name.bytes()) {
            *a = c as i8;
        }
        Ok(req)
    }
}

impl Default for IfReq {
    fn default() -> IfReq {
        IfReq {
            ifr_name: [0; IF_NAMESIZE],
            data: [0; IFREQUNIONSIZE],
        }
    }
}

#[derive(Debug)]
pub struct Socket {
    pub fd: c_int,
    pub if_name: String,
    pub if_index: c_uint,
}

impl Socket {
    /// Opens a `PF_PACKET`/`SOCK_RAW` socket. The interface bind happens
    /// later, at start.
    pub fn open(if_name: &str) -> Result<Socket> {
        let fd = unsafe { socket(PF_PACKET, SOCK_RAW, (ETH_P_ALL as u16).to_be() as i32) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let if_index = get_if_index(if_name)?;
        if if_index == 0 {
            unsafe {
                close(fd);
            }
            return Err(Error::new(ErrorKind::NotFound, "no such device"));
        }

        Ok(Socket {
            if_name: String::from(if_name),
            if_index,
            fd,
        })
    }

    fn ioctl_req(&self, ident: c_ulong, if_req: IfReq) -> Result<IfReq> {
        let mut req = if_req;
        match unsafe { ioctl(self.fd, ident, &mut req) } {
            -1 => Err(Error::last_os_error()),
            _ => Ok(req),
        }
    }

    /// `SIOCGIFHWADDR`: the low 16 bits of `ifr_hwaddr` carry the ARP
    /// hardware type (`sa_family`), e.g. `ARPHRD_ETHER`.
    pub fn arp_type(&self) -> Result<c_int> {
        let req = self.ioctl_req(SIOCGIFHWADDR, IfReq::with_if_name(&self.if_name)?)?;
        Ok(req.as_short() as c_int)
    }

    /// Cross-check against `if_nametoindex`, via `SIOCGIFINDEX`. Used by
    /// `Instance::start` to catch a renumbered/removed interface between
    /// `Socket::open` and bind.
    pub fn ioctl_ifindex(&self) -> Result<c_int> {
        let req = self.ioctl_req(SIOCGIFINDEX, IfReq::with_if_name(&self.if_name)?)?;
        Ok(req.as_int())
    }

    pub fn setsockopt<T>(&self, opt: c_int, opt_val: T) -> Result<()> {
        match unsafe {
            setsockopt(
                self.fd,
                SOL_PACKET,
                opt,
                &opt_val as *const _ as *const c_void,
                mem::size_of_val(&opt_val) as socklen_t,
            )
        } {
            0 => Ok(()),
            _ => Err(Error::last_os_error()),
        }
    }

    pub fn getsockopt<T: Default>(&self, opt: c_int) -> Result<T> {
        let mut val = T::default();
        let mut len = mem::size_of::<T>() as socklen_t;
        let rc = unsafe {
            getsockopt(
                self.fd,
                SOL_PACKET,
                opt,
                &mut val as *mut T as *mut c_void,
                &mut len,
            )
        };
        if rc == 0 {
            Ok(val)
        } else {
            Err(Error::last_os_error())
        }
    }

    /// Any pending socket-level error (e.g. "network is down"), checked
    /// right after bind, via `SO_ERROR`.
    pub fn take_pending_error(&self) -> Result<()> {
        let mut err: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        let rc = unsafe {
            getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut c_int as *mut c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        if err != 0 {
            return Err(Error::from_raw_os_error(err));
        }
        Ok(())
    }

    pub fn set_non_blocking(&self) -> Result<()> {
        unsafe {
            let mut flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags != -1 {
                flags = libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            if flags == -1 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Closes the fd now, rather than waiting on `Drop`. Idempotent: `Drop`
    /// checks `fd >= 0` before closing again.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                close(self.fd);
            }
            self.fd = -1;
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                close(self.fd);
            }
        }
    }
}

pub fn get_if_index(name: &str) -> Result<c_uint> {
    let cname = CString::new(name)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "NUL byte in interface name"))?;
    let index = unsafe { if_nametoindex(cname.as_ptr()) };
    Ok(index)
}
