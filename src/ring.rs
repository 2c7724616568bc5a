//! The ring buffer and the per-interface instance that owns one. Grounded
//! on the teacher's `rx/mod.rs` (`RingBuilder`, `Ring`, `RawBlock`, the
//! mmap/bind/fanout sequencing) and on the original's `set_up_ring` /
//! `calculate_layout` / `start_instance`, generalized from TPACKET v3
//! block-mode to the v2 per-frame ring this module specifies.

use std::io::{Error, ErrorKind};
use std::ptr;

use libc::{c_int, c_void, mmap, munmap, sendto, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};

use crate::error::{AfPacketError, Result};
use crate::socket::Socket;
use crate::tpacket::{
    self, tpacket_align, PacketMreq, Tpacket2Hdr, TpacketReq, TpacketStats, ETH_HLEN,
    PACKET_ADD_MEMBERSHIP, PACKET_FANOUT, PACKET_HDRLEN, PACKET_RESERVE, PACKET_RX_RING,
    PACKET_STATISTICS, PACKET_TX_RING, PACKET_VERSION, TPACKET_V2, TP_STATUS_AVAILABLE,
    TP_STATUS_KERNEL, TP_STATUS_SEND_REQUEST, TP_STATUS_USER, VLAN_TAG_LEN,
};

const DEFAULT_ORDER: i32 = 3;

/// Kernel-facing ring dimensions. Immutable after successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub frame_size: u32,
    pub frame_count: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl RingLayout {
    /// §4.2: computes frame/block geometry for a given allocation `order`.
    /// Pure and unit-testable without a socket.
    pub fn calculate(
        tp_hdrlen: usize,
        snaplen: u32,
        per_ring_bytes: u64,
        page_size: usize,
        order: u32,
    ) -> std::result::Result<RingLayout, String> {
        let tp_hdrlen_sll = tpacket_align(tp_hdrlen) + std::mem::size_of::<libc::sockaddr_ll>();
        let netoff = tpacket_align(tp_hdrlen_sll + ETH_HLEN) + VLAN_TAG_LEN;
        let frame_size = tpacket_align(netoff - ETH_HLEN + snaplen as usize) as u32;

        let mut block_size = (page_size as u64) << order;
        while (block_size as u32) < frame_size {
            block_size <<= 1;
        }
        let block_size = block_size as u32;

        let frames_per_block = block_size / frame_size;
        if frames_per_block == 0 {
            return Err(format!(
                "invalid frames per block ({}/{})",
                block_size, frame_size
            ));
        }

        let mut frame_count = (per_ring_bytes / frame_size as u64) as u32;
        let block_count = frame_count / frames_per_block;
        frame_count = block_count * frames_per_block;

        Ok(RingLayout {
            frame_size,
            frame_count,
            block_size,
            block_count,
        })
    }

    fn kernel_req(self) -> TpacketReq {
        TpacketReq {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count,
        }
    }

    pub fn total_bytes(self) -> usize {
        self.block_size as usize * self.block_count as usize
    }
}

/// One entry per kernel ring frame: its byte offset from the ring's base.
/// A plain index-into-array design per the design notes — no heap-allocated
/// linked nodes, `next` is implicit (`(idx + 1) % frame_count`).
#[derive(Debug, Clone, Copy)]
struct FrameSlot {
    offset: usize,
}

/// A single direction's (RX or TX) mmap'd ring, plus the cursor naming the
/// next slot this side intends to inspect.
pub struct Ring {
    layout: RingLayout,
    base: *mut u8,
    slots: Vec<FrameSlot>,
    cursor: usize,
}

unsafe impl Send for Ring {}

impl Ring {
    /// §4.3: build the slot array for a ring whose kernel allocation begins
    /// at `base` within the combined mapping.
    fn build(layout: RingLayout, base: *mut u8) -> Ring {
        let frames_per_block = layout.block_size / layout.frame_size;
        let mut slots = Vec::with_capacity(layout.frame_count as usize);
        for b in 0..layout.block_count {
            for f in 0..frames_per_block {
                let idx = b * frames_per_block + f;
                if idx >= layout.frame_count {
                    break;
                }
                let offset = b as usize * layout.block_size as usize
                    + f as usize * layout.frame_size as usize;
                slots.push(FrameSlot { offset });
            }
        }
        Ring {
            layout,
            base,
            slots,
            cursor: 0,
        }
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { self.base.add(self.slots[idx].offset) }
    }

    fn header(&self, idx: usize) -> &Tpacket2Hdr {
        unsafe { &*(self.slot_ptr(idx) as *const Tpacket2Hdr) }
    }

    fn header_mut(&mut self, idx: usize) -> &mut Tpacket2Hdr {
        unsafe { &mut *(self.slot_ptr(idx) as *mut Tpacket2Hdr) }
    }

    /// RX: is the cursor slot owned by userspace (kernel has written a
    /// frame into it)?
    pub fn rx_ready(&self) -> bool {
        self.header(self.cursor).tp_status & TP_STATUS_USER != 0
    }

    /// Claims the cursor slot (the caller has read its status as
    /// user-owned) and advances the cursor. Returns the claimed slot index.
    pub fn claim_rx(&mut self) -> usize {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        idx
    }

    /// Releases a slot back to the kernel.
    pub fn release_rx(&mut self, idx: usize) {
        self.header_mut(idx).tp_status = TP_STATUS_KERNEL;
    }

    /// Raw frame bytes for slot `idx`, the whole frame (header + payload).
    pub fn frame_bytes(&self, idx: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr(idx), self.layout.frame_size as usize) }
    }

    pub fn frame_bytes_mut(&mut self, idx: usize) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.slot_ptr(idx), self.layout.frame_size as usize)
        }
    }

    pub fn rx_header(&self, idx: usize) -> &Tpacket2Hdr {
        self.header(idx)
    }

    /// TX: is the cursor slot available for a new send request?
    pub fn tx_available(&self) -> bool {
        self.header(self.cursor).tp_status == TP_STATUS_AVAILABLE
    }

    /// Copies `data` into the TX cursor slot, marks it send-requested, and
    /// advances the TX cursor. Caller still has to kick the socket.
    pub fn enqueue_tx(&mut self, tp_hdrlen: usize, data: &[u8]) {
        let idx = self.cursor;
        let aligned_hdrlen = tpacket_align(tp_hdrlen);
        let ptr = self.slot_ptr(idx);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(aligned_hdrlen), data.len());
        }
        let hdr = self.header_mut(idx);
        hdr.tp_len = data.len() as u32;
        hdr.tp_status = TP_STATUS_SEND_REQUEST;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }
}

/// Owns the combined RX+TX mmap; unmaps on drop.
struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MappedRegion {}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                munmap(self.ptr as *mut c_void, self.len);
            }
        }
    }
}

/// One capture interface: its socket, negotiated rings, and (if bridged) a
/// non-owning reference to its peer.
pub struct Instance {
    pub(crate) socket: Socket,
    pub(crate) name: String,
    pub(crate) ifindex: i32,
    tp_hdrlen: usize,
    mapped: Option<MappedRegion>,
    pub(crate) rx: Option<Ring>,
    pub(crate) tx: Option<Ring>,
    sll: libc::sockaddr_ll,
    pub(crate) peer: Option<usize>,
}

impl Instance {
    /// Opens the socket and resolves the ifindex; does not bind or
    /// allocate rings (that happens at `start`).
    pub(crate) fn new(name: &str) -> Result<Instance> {
        let socket = Socket::open(name)
            .map_err(|e| classify_open_error(name, e))?;
        let ifindex = socket.if_index as i32;

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_ifindex = ifindex;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();

        Ok(Instance {
            socket,
            name: name.to_string(),
            ifindex,
            tp_hdrlen: 0,
            mapped: None,
            rx: None,
            tx: None,
            sll,
            peer: None,
        })
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bridged(&self) -> bool {
        self.peer.is_some()
    }

    /// §4.4: bind, promiscuous membership, ARP type check, version
    /// negotiation, ring creation, mmap, descriptor build, optional
    /// fan-out join.
    pub(crate) fn start(
        &mut self,
        snaplen: u32,
        per_ring_bytes: u64,
        fanout: Option<(crate::config::FanoutConfig, u16)>,
        debug: bool,
    ) -> Result<()> {
        bind_instance(&self.socket)?;
        self.socket
            .take_pending_error()
            .map_err(|e| AfPacketError::kernel("pending socket error after bind", e))?;

        let mr = PacketMreq::promisc(self.ifindex);
        self.socket
            .setsockopt(PACKET_ADD_MEMBERSHIP, mr)
            .map_err(|e| AfPacketError::kernel("enabling promiscuous mode", e))?;

        match self.socket.arp_type() {
            Ok(t) if t == tpacket::ARPHRD_ETHER => {}
            Ok(arptype) => {
                return Err(AfPacketError::UnsupportedDevice {
                    name: self.name.clone(),
                    arptype,
                })
            }
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                return Err(AfPacketError::NoDevice(self.name.clone()))
            }
            Err(e) => return Err(AfPacketError::kernel("reading ARP hardware type", e)),
        }

        match self.socket.ioctl_ifindex() {
            Ok(idx) if idx == self.ifindex => {}
            Ok(idx) => {
                return Err(AfPacketError::kernel(
                    "ifindex mismatch between if_nametoindex and SIOCGIFINDEX",
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("if_nametoindex gave {}, SIOCGIFINDEX gave {}", self.ifindex, idx),
                    ),
                ))
            }
            Err(e) => return Err(AfPacketError::kernel("reading ifindex via ioctl", e)),
        }

        self.negotiate_version()?;

        let page_size = page_size();
        let bridged = self.is_bridged();

        let rx_layout = create_ring(
            &self.socket,
            self.tp_hdrlen,
            snaplen,
            PACKET_RX_RING,
            per_ring_bytes,
            page_size,
        )?;
        let tx_layout = if bridged {
            Some(create_ring(
                &self.socket,
                self.tp_hdrlen,
                snaplen,
                PACKET_TX_RING,
                per_ring_bytes,
                page_size,
            )?)
        } else {
            None
        };

        if debug {
            tracing::debug!(
                interface = %self.name,
                frame_size = rx_layout.frame_size,
                frame_count = rx_layout.frame_count,
                block_size = rx_layout.block_size,
                block_count = rx_layout.block_count,
                "negotiated rx ring layout"
            );
            if let Some(tx) = tx_layout {
                tracing::debug!(
                    interface = %self.name,
                    frame_size = tx.frame_size,
                    frame_count = tx.frame_count,
                    block_size = tx.block_size,
                    block_count = tx.block_count,
                    "negotiated tx ring layout"
                );
            }
        }

        let rx_bytes = rx_layout.total_bytes();
        let tx_bytes = tx_layout.map(|l| l.total_bytes()).unwrap_or(0);
        let total = rx_bytes + tx_bytes;

        let base = unsafe {
            mmap(
                ptr::null_mut(),
                total,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                self.socket.fd,
                0,
            )
        };
        if base == MAP_FAILED {
            return Err(AfPacketError::kernel("mmap ring", Error::last_os_error()));
        }
        let base = base as *mut u8;
        self.mapped = Some(MappedRegion { ptr: base, len: total });

        self.rx = Some(Ring::build(rx_layout, base));
        self.tx = tx_layout.map(|l| Ring::build(l, unsafe { base.add(rx_bytes) }));

        if let Some((cfg, group_id)) = fanout {
            let arg = cfg.pack(group_id);
            self.socket
                .setsockopt(PACKET_FANOUT, arg)
                .map_err(|e| AfPacketError::kernel("joining fanout group", e))?;
        }

        Ok(())
    }

    fn negotiate_version(&mut self) -> Result<()> {
        let hdrlen: c_int = self
            .socket
            .getsockopt(PACKET_HDRLEN)
            .map_err(|e| AfPacketError::kernel("retrieving TPACKET_V2 header length", e))?;
        self.tp_hdrlen = hdrlen as usize;

        self.socket
            .setsockopt(PACKET_VERSION, TPACKET_V2)
            .map_err(|e| AfPacketError::kernel("activating TPACKET_V2", e))?;

        let reserve: c_int = VLAN_TAG_LEN as c_int;
        self.socket
            .setsockopt(PACKET_RESERVE, reserve)
            .map_err(|e| AfPacketError::kernel("reserving VLAN tag space", e))?;

        Ok(())
    }

    pub fn tp_hdrlen(&self) -> usize {
        self.tp_hdrlen
    }

    pub(crate) fn read_hw_stats(&self) -> Result<TpacketStats> {
        self.socket
            .getsockopt(PACKET_STATISTICS)
            .map_err(|e| AfPacketError::kernel("reading PACKET_STATISTICS", e))
    }

    /// Ring-based (bridged) or socket-based transmit, per §4.8.
    pub(crate) fn transmit(&mut self, data: &[u8]) -> Result<()> {
        let tp_hdrlen = self.tp_hdrlen;
        if let Some(tx) = &mut self.tx {
            if !tx.tx_available() {
                return Err(AfPacketError::TxFull);
            }
            tx.enqueue_tx(tp_hdrlen, data);
            let rc = unsafe { libc::send(self.socket.fd, ptr::null(), 0, 0) };
            if rc < 0 {
                return Err(AfPacketError::kernel("tx ring wakeup send", Error::last_os_error()));
            }
            Ok(())
        } else {
            if data.len() < 2 * tpacket::ETH_ALEN + 2 {
                return Err(AfPacketError::CorruptFrame(
                    "frame too short for an Ethernet header".into(),
                ));
            }
            let eth_type = [data[12], data[13]];
            self.sll.sll_protocol = u16::from_be_bytes(eth_type).to_be();
            let rc = unsafe {
                sendto(
                    self.socket.fd,
                    data.as_ptr() as *const c_void,
                    data.len(),
                    0,
                    &self.sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_ll>() as u32,
                )
            };
            if rc < 0 {
                return Err(AfPacketError::kernel("sendto", Error::last_os_error()));
            }
            Ok(())
        }
    }

    /// Teardown, per the original's `destroy_instance`: unmap, zero out the
    /// kernel rings, then close the socket fd now rather than waiting on
    /// `Drop` — the instance may be held (e.g. for a later `stats()` read)
    /// after `stop()` returns.
    pub(crate) fn stop(&mut self) {
        self.rx = None;
        self.tx = None;
        self.mapped = None;

        let zero = TpacketReq::default();
        let _ = self.socket.setsockopt(PACKET_RX_RING, zero);
        let _ = self.socket.setsockopt(PACKET_TX_RING, zero);

        self.socket.close();
    }
}

fn classify_open_error(name: &str, e: Error) -> AfPacketError {
    if e.kind() == ErrorKind::NotFound {
        AfPacketError::NoDevice(name.to_string())
    } else {
        AfPacketError::kernel(format!("opening socket for {}", name), e)
    }
}

fn bind_instance(socket: &Socket) -> Result<()> {
    unsafe {
        let mut sll: libc::sockaddr_ll = std::mem::zeroed();
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_ifindex = socket.if_index as c_int;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();

        let rc = libc::bind(
            socket.fd,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as u32,
        );
        if rc == -1 {
            return Err(AfPacketError::kernel(
                format!("bind({})", socket.if_name),
                Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

/// §4.2: negotiate a ring with the kernel, starting at block order 3 and
/// retrying down to order 0 on `ENOMEM`. Any other error is fatal.
fn create_ring(
    socket: &Socket,
    tp_hdrlen: usize,
    snaplen: u32,
    optname: c_int,
    per_ring_bytes: u64,
    page_size: usize,
) -> Result<RingLayout> {
    for order in (0..=DEFAULT_ORDER as u32).rev() {
        let layout = RingLayout::calculate(tp_hdrlen, snaplen, per_ring_bytes, page_size, order)
            .map_err(AfPacketError::Oom)?;

        match socket.setsockopt(optname, layout.kernel_req()) {
            Ok(()) => return Ok(layout),
            Err(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                tracing::debug!(
                    interface = %socket.if_name,
                    order,
                    "kernel ring allocation failed with ENOMEM, retrying at a smaller order"
                );
                continue;
            }
            Err(e) => return Err(AfPacketError::kernel("creating kernel packet ring", e)),
        }
    }

    Err(AfPacketError::Oom(format!(
        "couldn't allocate enough memory for the kernel packet ring on {}",
        socket.if_name
    )))
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TP_HDRLEN: usize = 52;
    const PAGE_SIZE: usize = 4096;

    #[test]
    fn frame_size_covers_header_and_snaplen() {
        let layout = RingLayout::calculate(TP_HDRLEN, 1514, 1 << 20, PAGE_SIZE, 0).unwrap();
        assert!(layout.frame_size as usize >= tpacket_align(TP_HDRLEN) + 1514);
        assert_eq!(layout.frame_size as usize % tpacket::TPACKET_ALIGNMENT, 0);
    }

    #[test]
    fn block_size_grows_to_fit_an_oversized_frame() {
        // A large snaplen should force block_size above the base page-order
        // size so at least one frame fits per block.
        let layout = RingLayout::calculate(TP_HDRLEN, 1 << 16, 8 << 20, PAGE_SIZE, 0).unwrap();
        assert!(layout.block_size >= layout.frame_size);
        assert!(layout.block_size / layout.frame_size >= 1);
    }

    #[test]
    fn frame_count_is_an_exact_multiple_of_frames_per_block() {
        let layout = RingLayout::calculate(TP_HDRLEN, 1514, 4 << 20, PAGE_SIZE, 3).unwrap();
        let frames_per_block = layout.block_size / layout.frame_size;
        assert_eq!(layout.frame_count % frames_per_block, 0);
        assert_eq!(layout.frame_count / frames_per_block, layout.block_count);
    }

    #[test]
    fn total_bytes_matches_block_geometry() {
        let layout = RingLayout::calculate(TP_HDRLEN, 1514, 4 << 20, PAGE_SIZE, 3).unwrap();
        assert_eq!(
            layout.total_bytes(),
            layout.block_size as usize * layout.block_count as usize
        );
    }

    #[test]
    fn tiny_budget_yields_zero_frames_not_an_error() {
        // Below one frame's worth of bytes, calculate() degrades to zero
        // frames rather than failing; create_ring's retry loop is what
        // handles genuine exhaustion (ENOMEM from the kernel).
        let layout = RingLayout::calculate(TP_HDRLEN, 1514, 1024, PAGE_SIZE, 0).unwrap();
        assert_eq!(layout.frame_count, 0);
    }
}
