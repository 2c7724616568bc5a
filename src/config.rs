//! Typed configuration surface. The original module parsed these out of a
//! generic key/value config API; here they are a closed, typed record built
//! directly by the caller (no string parsing beyond the interface spec and
//! the environment-variable fallback, per design note "present the closed
//! option set as a typed configuration record").

use std::env;

/// One of the two capture modes. `Inline` covers "several inline variants"
/// in the distilled spec (e.g. a bridged tap vs. a bridged block-capable
/// bridge); this module does not distinguish between them for the purposes
/// of interface pairing or forwarding, so a single variant is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Passive,
    Inline,
}

impl Mode {
    pub fn is_passive(self) -> bool {
        matches!(self, Mode::Passive)
    }
}

/// `buffer_size_mb` option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Megabytes(u32),
    Max,
}

/// `fanout_type` option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutType {
    Hash,
    Lb,
    Cpu,
    Rollover,
    Rnd,
    Qm,
}

impl FanoutType {
    pub(crate) fn kernel_value(self) -> u16 {
        match self {
            FanoutType::Hash => 0,
            FanoutType::Lb => 1,
            FanoutType::Cpu => 2,
            FanoutType::Rollover => 3,
            FanoutType::Rnd => 4,
            FanoutType::Qm => 5,
        }
    }
}

/// `fanout_flag` options are repeatable and OR-combined. A hand-rolled pair
/// of bits rather than a `bitflags` dependency, since there are only two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanoutFlags(u16);

impl FanoutFlags {
    pub const ROLLOVER: FanoutFlags = FanoutFlags(0x1000);
    pub const DEFRAG: FanoutFlags = FanoutFlags(0x8000);

    pub const fn empty() -> Self {
        FanoutFlags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for FanoutFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        FanoutFlags(self.0 | rhs.0)
    }
}

/// Kernel-facing fan-out configuration, derived from `fanout_type` /
/// `fanout_flag` options once at least one `fanout_type` is present.
#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub fanout_type: FanoutType,
    pub flags: FanoutFlags,
}

impl FanoutConfig {
    /// Packs type and flags into the single 32-bit argument `PACKET_FANOUT`
    /// expects: `(type | flags) << 16 | group_id`, per the kernel's own
    /// wire format (not a free design choice).
    pub(crate) fn pack(self, group_id: u16) -> u32 {
        let hi = (self.fanout_type.kernel_value() | self.flags.bits()) as u32;
        (hi << 16) | group_id as u32
    }
}

/// The closed key/value option set.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub buffer_size_mb: Option<BufferSize>,
    pub debug: bool,
    pub fanout: Option<FanoutConfig>,
}

impl Options {
    /// Resolves the total capture buffer size in bytes: `buffer_size_mb`,
    /// else `AF_PACKET_BUFFER_SIZE` from the environment, else the 128 MiB
    /// default. `max` / an absent/unset environment variable both fall back
    /// to the default.
    pub fn total_buffer_bytes(&self) -> u64 {
        const DEFAULT_MB: u64 = 128;

        let mb = match self.buffer_size_mb {
            Some(BufferSize::Megabytes(mb)) => mb as u64,
            Some(BufferSize::Max) => DEFAULT_MB,
            None => match env::var("AF_PACKET_BUFFER_SIZE") {
                Ok(val) if val != "max" => val.parse::<u64>().unwrap_or(DEFAULT_MB),
                _ => DEFAULT_MB,
            },
        };
        mb * 1024 * 1024
    }
}

/// Replaces `DAQ_ModuleConfig_h`: everything `initialize` needs, typed.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Colon-separated interface list, e.g. `eth0:eth1`.
    pub input: String,
    pub mode: Mode,
    pub snaplen: u32,
    /// Milliseconds; `<= 0` means infinite.
    pub poll_timeout_ms: i32,
    pub options: Options,
}

/// Sanitized, binary verdict a delivered message is finalized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Block,
    Replace,
    Whitelist,
    Blacklist,
    Ignore,
    Retry,
}

pub const VERDICT_COUNT: usize = 7;

impl Verdict {
    pub fn index(self) -> usize {
        match self {
            Verdict::Pass => 0,
            Verdict::Block => 1,
            Verdict::Replace => 2,
            Verdict::Whitelist => 3,
            Verdict::Blacklist => 4,
            Verdict::Ignore => 5,
            Verdict::Retry => 6,
        }
    }

    /// Unknown/out-of-range raw verdicts sanitize to `Pass`.
    pub fn sanitize(raw: Option<Verdict>) -> Verdict {
        raw.unwrap_or(Verdict::Pass)
    }

    /// Binary disposition: forward to peer, or drop.
    pub fn forwards(self) -> bool {
        matches!(
            self,
            Verdict::Pass | Verdict::Replace | Verdict::Whitelist | Verdict::Ignore
        )
    }
}

/// Capabilities advertised to the host, mirroring `DAQ_CAPA_*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub block: bool,
    pub replace: bool,
    pub inject: bool,
    pub unprivileged_start: bool,
    pub breakloop: bool,
    pub filter: bool,
    pub device_index: bool,
}

impl Capabilities {
    /// The fixed set this module always advertises.
    pub fn all() -> Self {
        Capabilities {
            block: true,
            replace: true,
            inject: true,
            unprivileged_start: true,
            breakloop: true,
            filter: true,
            device_index: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_pack_places_type_and_flags_in_the_high_bits() {
        let cfg = FanoutConfig {
            fanout_type: FanoutType::Hash,
            flags: FanoutFlags::empty(),
        };
        assert_eq!(cfg.pack(7), 7);

        let cfg = FanoutConfig {
            fanout_type: FanoutType::Cpu,
            flags: FanoutFlags::ROLLOVER,
        };
        let packed = cfg.pack(42);
        assert_eq!(packed & 0xFFFF, 42);
        assert_eq!(packed >> 16, (FanoutType::Cpu.kernel_value() | FanoutFlags::ROLLOVER.bits()) as u32);
    }

    #[test]
    fn fanout_flags_combine() {
        let mut flags = FanoutFlags::empty();
        flags.insert(FanoutFlags::ROLLOVER);
        flags.insert(FanoutFlags::DEFRAG);
        assert_eq!(flags, FanoutFlags::ROLLOVER | FanoutFlags::DEFRAG);
    }

    #[test]
    fn verdict_sanitize_defaults_to_pass() {
        assert_eq!(Verdict::sanitize(None), Verdict::Pass);
        assert_eq!(Verdict::sanitize(Some(Verdict::Block)), Verdict::Block);
    }

    #[test]
    fn verdict_forwards_matches_the_pass_through_set() {
        assert!(Verdict::Pass.forwards());
        assert!(Verdict::Replace.forwards());
        assert!(Verdict::Whitelist.forwards());
        assert!(Verdict::Ignore.forwards());
        assert!(!Verdict::Block.forwards());
        assert!(!Verdict::Blacklist.forwards());
        assert!(!Verdict::Retry.forwards());
    }

    #[test]
    fn verdict_index_is_dense_and_unique() {
        let all = [
            Verdict::Pass,
            Verdict::Block,
            Verdict::Replace,
            Verdict::Whitelist,
            Verdict::Blacklist,
            Verdict::Ignore,
            Verdict::Retry,
        ];
        let mut seen = [false; VERDICT_COUNT];
        for v in all {
            assert!(!seen[v.index()]);
            seen[v.index()] = true;
        }
    }

    #[test]
    fn total_buffer_bytes_defaults_to_128mb() {
        let opts = Options::default();
        assert_eq!(opts.total_buffer_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn total_buffer_bytes_honors_explicit_megabytes() {
        let opts = Options {
            buffer_size_mb: Some(BufferSize::Megabytes(16)),
            debug: false,
            fanout: None,
        };
        assert_eq!(opts.total_buffer_bytes(), 16 * 1024 * 1024);
    }
}
