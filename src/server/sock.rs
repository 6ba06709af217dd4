//! The well-known-port socket
//!
//! On a multihomed host the server needs to know which local address a
//! request was sent to, so the session can report it to the handler.
//! That takes per-packet control information (`IP_PKTINFO` /
//! `IPV6_RECVPKTINFO`) read via `recvmsg`. Where the platform or the
//! kernel refuses, the socket falls back to a plain `recv_from` and
//! reports no local IP.

use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

pub(crate) struct RequestSocket {
    socket: UdpSocket,
    pktinfo: bool,
}

impl RequestSocket {
    pub(crate) fn new(socket: UdpSocket) -> io::Result<Self> {
        let pktinfo = imp::enable_pktinfo(&socket)?;
        if !pktinfo {
            debug!("destination-address reporting unavailable on this socket");
        }
        Ok(RequestSocket { socket, pktinfo })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram, reporting its source address and, when
    /// the platform cooperates, the local IP it was addressed to.
    pub(crate) async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        if !self.pktinfo {
            let (len, src) = self.socket.recv_from(buf).await?;
            return Ok((len, src, None));
        }
        self.socket
            .async_io(Interest::READABLE, || imp::recv_with_dst(&self.socket, buf))
            .await
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios"))]
mod imp {
    use super::*;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::AsRawFd;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const IPV4_PKTINFO_OPT: libc::c_int = libc::IP_PKTINFO;
    // Apple platforms keep the set and receive halves apart: the
    // option is IP_RECVPKTINFO, the control message still IP_PKTINFO.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const IPV4_PKTINFO_OPT: libc::c_int = libc::IP_RECVPKTINFO;

    /// Ask the kernel to attach the destination address to every
    /// received datagram. `false` means the socket option was refused
    /// and the caller should fall back to plain receives.
    pub(super) fn enable_pktinfo(socket: &UdpSocket) -> io::Result<bool> {
        let fd = socket.as_raw_fd();
        let on: libc::c_int = 1;
        let (level, option) = if socket.local_addr()?.is_ipv4() {
            (libc::IPPROTO_IP, IPV4_PKTINFO_OPT)
        } else {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                option,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        Ok(rc == 0)
    }

    // Room for one pktinfo control message of either family.
    #[repr(align(8))]
    struct ControlBuf([u8; 128]);

    pub(super) fn recv_with_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        let fd = socket.as_raw_fd();

        let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = ControlBuf([0; 128]);

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut name as *mut libc::sockaddr_storage as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.0.len() as _;

        let len = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }

        let src = decode_name(&name)?;
        let dst = unsafe { decode_dst(&msg) };
        Ok((len as usize, src, dst))
    }

    fn decode_name(name: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
        match name.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr = unsafe {
                    &*(name as *const libc::sockaddr_storage as *const libc::sockaddr_in)
                };
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                    u16::from_be(addr.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let addr = unsafe {
                    &*(name as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
                };
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                    addr.sin6_flowinfo,
                    addr.sin6_scope_id,
                )))
            }
            family => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address family {}", family),
            )),
        }
    }

    unsafe fn decode_dst(msg: &libc::msghdr) -> Option<IpAddr> {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let kind = (*cmsg).cmsg_type;
            if level == libc::IPPROTO_IP && kind == libc::IP_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                return Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                    info.ipi_addr.s_addr,
                ))));
            }
            if level == libc::IPPROTO_IPV6 && kind == libc::IPV6_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                return Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
        None
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
mod imp {
    use super::*;

    pub(super) fn enable_pktinfo(_socket: &UdpSocket) -> io::Result<bool> {
        Ok(false)
    }

    pub(super) fn recv_with_dst(
        _socket: &UdpSocket,
        _buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "destination-address reporting is not available on this platform",
        ))
    }
}
