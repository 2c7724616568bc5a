use std::io;

/// Stable, host-visible error taxonomy for the capture engine.
///
/// Every variant maps to one of the kinds named in the design: transient
/// kinds (`Interrupted`, `TxFull`) are never fatal to the receive loop and
/// are never counted as packet loss; everything else is.
#[derive(Debug, thiserror::Error)]
pub enum AfPacketError {
    /// Malformed interface string, name too long, too many interfaces, or an
    /// unpaired bridge.
    #[error("invalid interface specification: {0}")]
    InvalidSpec(String),

    /// Interface not found, or ARP type retrieval reported "no such device".
    #[error("no such device: {0}")]
    NoDevice(String),

    /// ARP hardware type is something other than Ethernet.
    #[error("unsupported device type on {name}: arptype {arptype} != ARPHRD_ETHER")]
    UnsupportedDevice { name: String, arptype: i32 },

    /// Userspace allocation failure, or kernel ring allocation exhausted at
    /// the smallest block order.
    #[error("out of memory: {0}")]
    Oom(String),

    /// Any non-transient socket option, mmap, bind, or send failure.
    #[error("{context}: {source}")]
    KernelError {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A ring slot's metadata failed a bounds check; the ring is corrupted.
    #[error("corrupted ring frame: {0}")]
    CorruptFrame(String),

    /// Transient: the TX ring's cursor slot is not in the "available" state.
    #[error("TX ring full")]
    TxFull,

    /// Transient: `poll` was interrupted by a signal. Callers may retry.
    #[error("interrupted")]
    Interrupted,

    /// `poll` reported a hang-up, error, or invalid-request bit on a packet
    /// socket fd.
    #[error("poll error: {0}")]
    PollError(String),
}

impl AfPacketError {
    pub(crate) fn kernel(context: impl Into<String>, source: io::Error) -> Self {
        AfPacketError::KernelError {
            context: context.into(),
            source,
        }
    }

    /// True for kinds that are reported but never counted as loss and never
    /// abort the caller's loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, AfPacketError::TxFull | AfPacketError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, AfPacketError>;
