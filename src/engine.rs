//! The capture/bridging context. Grounded on the original's `AFPacketContext`
//! (`afpacket_daq_initialize`, `afpacket_find_packet`, `afpacket_wait_for_packet`,
//! `afpacket_daq_msg_receive`, `afpacket_daq_msg_finalize`, `afpacket_daq_inject`,
//! `update_hw_stats`, `af_packet_close`) and, for the FFI shapes `poll` needs, on
//! the teacher's own `socket.rs` style of wrapping a libc call behind a typed
//! `Result`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::IF_NAMESIZE;

use crate::config::{Capabilities, Mode, ModuleConfig, Verdict, VERDICT_COUNT};
use crate::error::{AfPacketError, Result};
use crate::filter::{CompiledFilter, FilterCompiler};
use crate::ring::Instance;

/// A fixed cap on the number of interfaces one context may own, mirroring the
/// original's `AF_PACKET_MAX_INTERFACES`. The interface-spec parser rejects a
/// spec that would reach it.
const MAX_INTERFACES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
}

/// Running counters, refreshed from the kernel at read time for the `hw_*`
/// fields (§4.9/§7: hardware counters are a live snapshot, not an event log).
#[derive(Debug, Clone)]
pub struct Stats {
    pub hw_packets_received: u64,
    pub hw_packets_dropped: u64,
    pub packets_received: u64,
    pub packets_filtered: u64,
    pub packets_injected: u64,
    pub verdicts: [u64; VERDICT_COUNT],
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            hw_packets_received: 0,
            hw_packets_dropped: 0,
            packets_received: 0,
            packets_filtered: 0,
            packets_injected: 0,
            verdicts: [0; VERDICT_COUNT],
        }
    }
}

/// A signal-safe handle to request that a context's receive loop exit at the
/// next outer-loop boundary. Cloning and sending this to a signal handler or
/// a watchdog thread is the only cross-thread interaction this module
/// supports; every other method requires exclusive access to the `Engine`.
#[derive(Clone)]
pub struct BreakHandle(Arc<AtomicBool>);

impl BreakHandle {
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A borrowed view into one ring slot: the frame data plus its descriptor.
/// Holds a raw pointer rather than a borrow of `Engine` so a caller can call
/// other `&mut Engine` methods (`inject`, `stats`) while a message is live;
/// the pointer stays valid because the originating slot remains user-owned
/// until `Engine::msg_finalize` consumes this value and releases it. That
/// consumption-by-value is what makes "never touch it again after finalize"
/// a compile error rather than a rule to remember.
pub struct Message {
    instance_idx: usize,
    peer_idx: Option<usize>,
    slot_idx: usize,
    data_ptr: *const u8,
    caplen: u32,
    wirelen: u32,
    ts_sec: u32,
    ts_usec: u32,
    ingress_index: i32,
    egress_index: Option<i32>,
}

unsafe impl Send for Message {}

impl Message {
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data_ptr, self.caplen as usize) }
    }

    pub fn caplen(&self) -> u32 {
        self.caplen
    }

    pub fn wirelen(&self) -> u32 {
        self.wirelen
    }

    pub fn timestamp(&self) -> (u32, u32) {
        (self.ts_sec, self.ts_usec)
    }

    pub fn ingress_index(&self) -> i32 {
        self.ingress_index
    }

    pub fn egress_index(&self) -> Option<i32> {
        self.egress_index
    }
}

enum PollOutcome {
    Ready,
    Timeout,
}

pub struct Engine {
    snaplen: u32,
    poll_timeout_ms: i32,
    debug: bool,
    fanout: Option<crate::config::FanoutConfig>,
    instances: Vec<Instance>,
    filter_compiler: Box<dyn FilterCompiler>,
    filter: Option<Box<dyn CompiledFilter>>,
    state: EngineState,
    stats: Stats,
    last_error: Option<AfPacketError>,
    break_flag: Arc<AtomicBool>,
    current_instance: usize,
    per_ring_bytes: u64,
}

impl Engine {
    /// §4.1: split the colon-separated interface spec, create one `Instance`
    /// per non-empty token, and pair consecutive instances for inline modes.
    /// §4.4/§6.2: compute the per-ring byte budget once, up front.
    pub fn initialize(config: ModuleConfig, filter_compiler: Box<dyn FilterCompiler>) -> Result<Engine> {
        let names = parse_interfaces(&config.input, config.mode)?;

        let mut instances = Vec::with_capacity(names.len());
        for name in &names {
            instances.push(Instance::new(name)?);
        }

        if !config.mode.is_passive() {
            let mut i = 0;
            while i + 1 < instances.len() {
                instances[i].peer = Some(i + 1);
                instances[i + 1].peer = Some(i);
                i += 2;
            }
        }

        let num_rings: u64 = instances
            .iter()
            .map(|inst| if inst.is_bridged() { 2 } else { 1 })
            .sum();
        let per_ring_bytes = config.options.total_buffer_bytes() / num_rings.max(1);

        Ok(Engine {
            snaplen: config.snaplen,
            poll_timeout_ms: config.poll_timeout_ms,
            debug: config.options.debug,
            fanout: config.options.fanout,
            instances,
            filter_compiler,
            filter: None,
            state: EngineState::Initialized,
            stats: Stats::default(),
            last_error: None,
            break_flag: Arc::new(AtomicBool::new(false)),
            current_instance: 0,
            per_ring_bytes,
        })
    }

    pub fn break_handle(&self) -> BreakHandle {
        BreakHandle(self.break_flag.clone())
    }

    pub fn breakloop(&self) {
        self.break_flag.store(true, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<&AfPacketError> {
        self.last_error.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn device_index(&self, name: &str) -> Option<i32> {
        self.instances.iter().find(|i| i.name() == name).map(|i| i.ifindex())
    }

    pub fn set_filter(&mut self, datalink_type: i32, expr: &str) -> Result<()> {
        let program = self
            .filter_compiler
            .compile(self.snaplen, datalink_type, expr)
            .map_err(|e| AfPacketError::InvalidSpec(e.0))?;
        self.filter = Some(program);
        Ok(())
    }

    /// §4.4: bring every instance up, joining the fan-out group identified by
    /// its own ifindex when fan-out is configured (multiple sockets opened
    /// against the same interface, in or out of process, converge on the
    /// same group id this way).
    pub fn start(&mut self) -> Result<()> {
        self.require_state(EngineState::Initialized)?;

        for instance in self.instances.iter_mut() {
            let fanout = self.fanout.map(|cfg| {
                let group_id = (instance.ifindex() as u32 & 0xFFFF) as u16;
                (cfg, group_id)
            });
            instance.start(self.snaplen, self.per_ring_bytes, fanout, self.debug)?;
        }

        self.current_instance = 0;
        self.state = EngineState::Started;
        Ok(())
    }

    fn require_state(&self, expected: EngineState) -> Result<()> {
        if self.state != expected {
            return Err(AfPacketError::InvalidSpec(format!(
                "operation requires state {:?}, context is in state {:?}",
                expected, self.state
            )));
        }
        Ok(())
    }

    /// §4.5: one full round-robin rotation over the instances, starting
    /// after `current_instance`, falling back to `poll` when nothing is
    /// ready. Filtered-out frames are forwarded through a bridge (if any)
    /// and never surface to the caller; the rotation resumes from there.
    pub fn msg_receive(&mut self) -> Result<Option<Message>> {
        self.require_state(EngineState::Started)?;

        loop {
            if self.break_flag.load(Ordering::SeqCst) {
                return Ok(None);
            }

            if let Some((instance_idx, slot_idx)) = self.find_ready_slot() {
                self.current_instance = instance_idx;
                if let Some(msg) = self.materialize(instance_idx, slot_idx)? {
                    return Ok(Some(msg));
                }
                continue;
            }

            match self.poll_instances() {
                Ok(PollOutcome::Ready) => continue,
                Ok(PollOutcome::Timeout) => return Ok(None),
                Err(AfPacketError::Interrupted) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn find_ready_slot(&mut self) -> Option<(usize, usize)> {
        let n = self.instances.len();
        for step in 1..=n {
            let idx = (self.current_instance + step) % n;
            let ready = self.instances[idx]
                .rx
                .as_ref()
                .map(|r| r.rx_ready())
                .unwrap_or(false);
            if ready {
                let slot = self.instances[idx].rx.as_mut().unwrap().claim_rx();
                return Some((idx, slot));
            }
        }
        None
    }

    /// §4.6/§4.7: reconstruct a stripped VLAN tag, run the filter gate, and
    /// either deliver the frame (`Some`) or forward it through a bridge and
    /// release the slot (`None`, loop continues).
    fn materialize(&mut self, instance_idx: usize, slot_idx: usize) -> Result<Option<Message>> {
        let peer_idx = self.instances[instance_idx].peer;
        let ingress_index = self.instances[instance_idx].ifindex();
        let egress_index = peer_idx.map(|p| self.instances[p].ifindex());

        let rx = self.instances[instance_idx].rx.as_mut().unwrap();
        let hdr = *rx.rx_header(slot_idx);
        let frame_size = rx.layout().frame_size as usize;

        let mut mac_offset = hdr.tp_mac as usize;
        let mut caplen = hdr.tp_snaplen;
        let mut wirelen = hdr.tp_len;

        if mac_offset + caplen as usize > frame_size {
            return Err(AfPacketError::CorruptFrame(format!(
                "slot {} on {}: tp_mac ({}) + tp_snaplen ({}) exceeds frame size ({})",
                slot_idx, self.instances[instance_idx].name(), mac_offset, caplen, frame_size
            )));
        }

        let vlan_valid = hdr.tp_vlan_tci != 0
            || hdr.tp_status & crate::tpacket::TP_STATUS_VLAN_VALID != 0;
        if vlan_valid && caplen >= 12 && mac_offset >= crate::tpacket::VLAN_TAG_LEN {
            let tpid = if hdr.tp_status & crate::tpacket::TP_STATUS_VLAN_TPID_VALID != 0 {
                hdr.tp_vlan_tpid
            } else {
                crate::tpacket::ETH_P_8021Q
            };

            let rx = self.instances[instance_idx].rx.as_mut().unwrap();
            let frame = rx.frame_bytes_mut(slot_idx);
            mac_offset = reinsert_vlan_tag(frame, mac_offset, tpid, hdr.tp_vlan_tci);
            caplen += crate::tpacket::VLAN_TAG_LEN as u32;
            wirelen += crate::tpacket::VLAN_TAG_LEN as u32;
        }

        let rx = self.instances[instance_idx].rx.as_ref().unwrap();
        let frame = rx.frame_bytes(slot_idx);
        let data = &frame[mac_offset..mac_offset + caplen as usize];

        let admitted = match &self.filter {
            Some(f) => f.evaluate(data, caplen, wirelen),
            None => true,
        };

        if !admitted {
            self.stats.packets_filtered += 1;
            if let Some(peer) = peer_idx {
                let owned = data.to_vec();
                self.forward(peer, &owned);
            }
            self.instances[instance_idx]
                .rx
                .as_mut()
                .unwrap()
                .release_rx(slot_idx);
            return Ok(None);
        }

        self.stats.packets_received += 1;
        let data_ptr = frame[mac_offset..].as_ptr();

        Ok(Some(Message {
            instance_idx,
            peer_idx,
            slot_idx,
            data_ptr,
            caplen,
            wirelen,
            ts_sec: hdr.tp_sec,
            ts_usec: hdr.tp_nsec / 1000,
            ingress_index,
            egress_index,
        }))
    }

    fn forward(&mut self, target_idx: usize, data: &[u8]) {
        if let Err(e) = self.instances[target_idx].transmit(data) {
            if !e.is_transient() {
                tracing::warn!(error = %e, "bridge forwarding failed");
            }
            self.last_error = Some(e);
        }
    }

    /// §4.9: sanitize the verdict, bump its histogram slot, forward through
    /// a bridge on a passing verdict, and return the slot to the kernel.
    /// Consumes `msg` so the caller cannot reference it afterward.
    pub fn msg_finalize(&mut self, msg: Message, verdict: Verdict) -> Result<()> {
        self.require_state(EngineState::Started)?;

        let sanitized = Verdict::sanitize(Some(verdict));
        self.stats.verdicts[sanitized.index()] += 1;

        if sanitized.forwards() {
            if let Some(peer) = msg.peer_idx {
                let bytes = msg.data().to_vec();
                self.forward(peer, &bytes);
            }
        }

        self.instances[msg.instance_idx]
            .rx
            .as_mut()
            .unwrap()
            .release_rx(msg.slot_idx);
        Ok(())
    }

    /// §4.8: locate the instance whose ifindex matches `ingress_index`, then
    /// transmit out its peer unless `reverse` is set, in which case transmit
    /// back out the instance itself.
    pub fn inject(&mut self, ingress_index: i32, data: &[u8], reverse: bool) -> Result<()> {
        self.require_state(EngineState::Started)?;

        let origin = self
            .instances
            .iter()
            .position(|i| i.ifindex() == ingress_index)
            .ok_or_else(|| {
                AfPacketError::InvalidSpec(format!("no instance with ifindex {}", ingress_index))
            })?;

        let target = if reverse {
            origin
        } else {
            self.instances[origin].peer.ok_or_else(|| {
                AfPacketError::InvalidSpec(format!(
                    "instance {} has no peer to inject through",
                    self.instances[origin].name()
                ))
            })?
        };

        self.instances[target].transmit(data)?;
        self.stats.packets_injected += 1;
        Ok(())
    }

    fn update_hw_stats(&mut self) {
        if self.state != EngineState::Started {
            return;
        }
        for instance in &self.instances {
            match instance.read_hw_stats() {
                Ok(s) => {
                    let drops = s.tp_drops as u64;
                    let packets = s.tp_packets as u64;
                    self.stats.hw_packets_received += packets.saturating_sub(drops);
                    self.stats.hw_packets_dropped += drops;
                }
                Err(e) => tracing::warn!(error = %e, "failed to read hardware statistics"),
            }
        }
    }

    pub fn stats(&mut self) -> Stats {
        self.update_hw_stats();
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
        for instance in &self.instances {
            let _ = instance.read_hw_stats();
        }
    }

    /// §4.10: snapshot hardware counters, tear every instance down, then
    /// move to `Stopped`. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }
        self.update_hw_stats();
        for instance in self.instances.iter_mut() {
            instance.stop();
        }
        self.filter = None;
        self.state = EngineState::Stopped;
        Ok(())
    }

    fn poll_instances(&self) -> Result<PollOutcome> {
        let mut pfds: Vec<libc::pollfd> = self
            .instances
            .iter()
            .map(|i| libc::pollfd {
                fd: i.socket.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout = if self.poll_timeout_ms <= 0 {
            -1
        } else {
            self.poll_timeout_ms
        };

        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Err(AfPacketError::Interrupted);
            }
            return Err(AfPacketError::kernel("poll", err));
        }
        if ret == 0 {
            return Ok(PollOutcome::Timeout);
        }

        for pfd in &pfds {
            if pfd.revents & (libc::POLLHUP | libc::POLLRDHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                let kind = if pfd.revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                    "hang-up"
                } else if pfd.revents & libc::POLLERR != 0 {
                    "error condition"
                } else {
                    "invalid polling request"
                };
                return Err(AfPacketError::PollError(format!(
                    "{} on a packet socket (fd {})",
                    kind, pfd.fd
                )));
            }
        }

        Ok(PollOutcome::Ready)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// §4.6: the kernel strips a hardware VLAN tag out-of-band and reports it in
/// `tp_vlan_tci`/`tp_vlan_tpid`; this shifts the 12 bytes of MAC addresses
/// back 4 bytes into the reserve space `PACKET_RESERVE` carved out at
/// version-negotiation time, then writes TPID/TCI into the vacated slot.
/// Pure byte manipulation on an already-borrowed frame slice, kept separate
/// from `materialize` so it can be unit-tested without a live ring.
/// Returns the new `mac_offset`.
fn reinsert_vlan_tag(frame: &mut [u8], mac_offset: usize, tpid: u16, tci: u16) -> usize {
    let new_mac_offset = mac_offset - crate::tpacket::VLAN_TAG_LEN;
    frame.copy_within(mac_offset..mac_offset + 12, new_mac_offset);
    frame[new_mac_offset + 12..new_mac_offset + 14].copy_from_slice(&tpid.to_be_bytes());
    frame[new_mac_offset + 14..new_mac_offset + 16].copy_from_slice(&tci.to_be_bytes());
    new_mac_offset
}

/// §4.1: split on `:`. A leading or trailing colon is always invalid. A
/// passive mode may not contain an empty interior token (`eth0::eth1`); an
/// inline mode treats it as a separator with nothing between, and drops it.
/// Inline modes require an even number of surviving tokens; a dangling last
/// interface is rejected rather than silently run passive.
fn parse_interfaces(spec: &str, mode: Mode) -> Result<Vec<String>> {
    if spec.is_empty() {
        return Err(AfPacketError::InvalidSpec("empty interface specification".into()));
    }
    if spec.starts_with(':') || spec.ends_with(':') {
        return Err(AfPacketError::InvalidSpec(
            "interface specification may not start or end with ':'".into(),
        ));
    }
    if mode.is_passive() && spec.contains("::") {
        return Err(AfPacketError::InvalidSpec(
            "passive mode does not allow an empty interface token".into(),
        ));
    }

    let mut names = Vec::new();
    for token in spec.split(':') {
        if token.is_empty() {
            continue;
        }
        if token.len() >= IF_NAMESIZE {
            return Err(AfPacketError::InvalidSpec(format!(
                "interface name '{}' is too long",
                token
            )));
        }
        names.push(token.to_string());
        if names.len() >= MAX_INTERFACES {
            return Err(AfPacketError::InvalidSpec(format!(
                "too many interfaces (cap is {})",
                MAX_INTERFACES
            )));
        }
    }

    if names.is_empty() {
        return Err(AfPacketError::InvalidSpec(
            "no interfaces in specification".into(),
        ));
    }
    if !mode.is_passive() && names.len() % 2 != 0 {
        return Err(AfPacketError::InvalidSpec(format!(
            "inline mode requires an even number of interfaces, got {}",
            names.len()
        )));
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_single_interface() {
        assert_eq!(parse_interfaces("eth0", Mode::Passive).unwrap(), vec!["eth0"]);
    }

    #[test]
    fn inline_pair() {
        assert_eq!(
            parse_interfaces("eth0:eth1", Mode::Inline).unwrap(),
            vec!["eth0", "eth1"]
        );
    }

    #[test]
    fn passive_leading_colon_is_invalid() {
        assert!(parse_interfaces(":eth0", Mode::Passive).is_err());
    }

    #[test]
    fn inline_trailing_dangling_interface_is_invalid() {
        assert!(parse_interfaces("eth0:eth1:eth2", Mode::Inline).is_err());
    }

    #[test]
    fn inline_empty_interior_token_is_dropped() {
        assert_eq!(
            parse_interfaces("eth0::eth1", Mode::Inline).unwrap(),
            vec!["eth0", "eth1"]
        );
    }

    #[test]
    fn passive_empty_interior_token_is_invalid() {
        assert!(parse_interfaces("eth0::eth1", Mode::Passive).is_err());
    }

    #[test]
    fn rejects_name_at_ifnamesize() {
        let long = "a".repeat(IF_NAMESIZE);
        assert!(parse_interfaces(&long, Mode::Passive).is_err());
    }

    #[test]
    fn vlan_reinsertion_shifts_mac_addresses_and_writes_the_tag() {
        // 4 bytes of reserve, then dst[6] src[6] ethertype[2] payload...
        let mut frame = vec![0u8; 4 + 12 + 2 + 4];
        let dst = [1, 2, 3, 4, 5, 6];
        let src = [6, 5, 4, 3, 2, 1];
        frame[4..10].copy_from_slice(&dst);
        frame[10..16].copy_from_slice(&src);
        frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[18..22].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

        let new_offset = reinsert_vlan_tag(&mut frame, 4, 0x8100, 0x0005);
        assert_eq!(new_offset, 0);
        assert_eq!(&frame[0..6], &dst);
        assert_eq!(&frame[6..12], &src);
        assert_eq!(&frame[12..14], &0x8100u16.to_be_bytes());
        assert_eq!(&frame[14..16], &0x0005u16.to_be_bytes());
        // ethertype and payload, now pushed 4 bytes later, are untouched
        assert_eq!(&frame[16..18], &0x0800u16.to_be_bytes());
        assert_eq!(&frame[18..22], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn rejects_cap_overflow() {
        let many = (0..MAX_INTERFACES)
            .map(|i| format!("eth{}", i))
            .collect::<Vec<_>>()
            .join(":");
        assert!(parse_interfaces(&many, Mode::Passive).is_err());
    }
}
