//! Kernel-assisted Ethernet capture on Linux `PF_PACKET`/`TPACKET_V2`, with
//! optional inline L2 bridging between interface pairs.
//!
//! A context (`Engine`) owns one socket and mmap'd ring per interface,
//! multiplexes them round-robin without a syscall per packet, and for
//! bridged interfaces can forward frames between the two sides of a pair
//! either automatically (a verdict that passes) or on the host's explicit
//! `inject`. The module never parses packets past the VLAN tag it
//! reconstructs on the kernel's behalf; filtering and the forward/drop
//! decision are delegated to collaborators the host plugs in
//! ([`filter::FilterCompiler`], [`config::Verdict`]).

mod config;
mod engine;
mod error;
mod filter;
mod module;
mod ring;
mod socket;
mod tpacket;

pub use config::{
    BufferSize, Capabilities, FanoutConfig, FanoutFlags, FanoutType, Mode, ModuleConfig, Options,
    Verdict, VERDICT_COUNT,
};
pub use engine::{BreakHandle, Engine, EngineState, Message, Stats};
pub use error::{AfPacketError, Result};
pub use filter::{AdmitAll, CompiledFilter, FilterCompiler, FilterError};
pub use module::Module;
