//! TPACKET v2 wire layout: the kernel ABI this engine speaks. Grounded on
//! the teacher's `tpacket3.rs`, which hand-rolls the analogous TPACKET_V3
//! structures rather than trust `libc` to carry them; we do the same for
//! v2, since this module's Non-goals rule out v3 block mode entirely.
//!
//! Used digits for these consts; where the Linux UAPI header spells them
//! differently the C name is noted in a comment.

use libc::{c_int, c_uint};

pub const TPACKET_V2: c_int = 1; // TPACKET_V2

/// `tp_status` / `block_status` bits (RX).
pub const TP_STATUS_KERNEL: u32 = 0x0;
pub const TP_STATUS_USER: u32 = 0x1;
pub const TP_STATUS_VLAN_VALID: u32 = 0x10;
pub const TP_STATUS_VLAN_TPID_VALID: u32 = 0x40;

/// `tp_status` values (TX).
pub const TP_STATUS_AVAILABLE: u32 = 0x0;
pub const TP_STATUS_SEND_REQUEST: u32 = 0x1;

/// `SOL_PACKET` option names (linux/if_packet.h).
pub const PACKET_ADD_MEMBERSHIP: c_int = 1;
pub const PACKET_RX_RING: c_int = 5;
pub const PACKET_STATISTICS: c_int = 6;
pub const PACKET_VERSION: c_int = 10;
pub const PACKET_HDRLEN: c_int = 11;
pub const PACKET_RESERVE: c_int = 12;
pub const PACKET_TX_RING: c_int = 13;
pub const PACKET_FANOUT: c_int = 18;

/// `packet_mreq.mr_type` values.
pub const PACKET_MR_PROMISC: c_uint = 1;

pub const VLAN_TAG_LEN: usize = 4;
pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const ETH_P_8021Q: u16 = 0x8100;

/// ARP hardware type for Ethernet, from `linux/if_arp.h`.
pub const ARPHRD_ETHER: c_int = 1;

/// `ioctl` request numbers this module needs beyond the interface-flags
/// pair the socket layer already has.
pub const SIOCGIFINDEX: libc::c_ulong = 0x8933;
pub const SIOCGIFHWADDR: libc::c_ulong = 0x8927;

/// `PACKET_ADD_MEMBERSHIP` / `PACKET_DROP_MEMBERSHIP` payload.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct PacketMreq {
    pub mr_ifindex: c_int,
    pub mr_type: u16,
    pub mr_alen: u16,
    pub mr_address: [u8; 8],
}

impl PacketMreq {
    pub fn promisc(ifindex: c_int) -> Self {
        PacketMreq {
            mr_ifindex: ifindex,
            mr_type: PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        }
    }
}

/// `PACKET_RX_RING` / `PACKET_TX_RING` layout request. Same shape for v1
/// and v2 (`struct tpacket_req`).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TpacketReq {
    pub tp_block_size: c_uint,
    pub tp_block_nr: c_uint,
    pub tp_frame_size: c_uint,
    pub tp_frame_nr: c_uint,
}

/// Kernel drop/receive counters returned by `PACKET_STATISTICS`. Reading
/// this option clears the kernel-side counters, so callers accumulate
/// deltas across reads.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TpacketStats {
    pub tp_packets: c_uint,
    pub tp_drops: c_uint,
}

/// Per-frame header written by the kernel at the start of every RX/TX
/// ring slot (`struct tpacket2_hdr`).
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Tpacket2Hdr {
    pub tp_status: u32,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_vlan_tci: u16,
    pub tp_vlan_tpid: u16,
    pub tp_padding: [u8; 4],
}

/// `TPACKET_ALIGN`: rounds up to the kernel's frame alignment (`sizeof(long)`
/// on every architecture this module targets).
pub const TPACKET_ALIGNMENT: usize = 16;

pub const fn tpacket_align(x: usize) -> usize {
    (x + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}
