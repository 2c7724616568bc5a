//! The host-facing function table, mirroring the original's `DAQ_ModuleAPI`
//! entry points (`prepare`, `initialize`, `set_filter`, `start`,
//! `msg_receive`, `msg_finalize`, `inject`, `breakloop`, `stop`, `shutdown`,
//! `get_stats`, `reset_stats`, `get_capabilities`, `get_datalink_type`,
//! `get_device_index`) as a single Rust trait instead of a struct of function
//! pointers.

use crate::config::{Capabilities, ModuleConfig, Verdict};
use crate::engine::{BreakHandle, Engine, Message};
use crate::error::Result;
use crate::filter::FilterCompiler;

/// Everything a host needs to drive one capture context through its
/// lifecycle. `Engine` is this module's only implementation; the trait
/// exists so the host can depend on a narrow interface rather than the
/// concrete type, the way the original's DAQ API separated the module
/// contract from any one module's internals.
pub trait Module: Sized {
    fn initialize(config: ModuleConfig, filter_compiler: Box<dyn FilterCompiler>) -> Result<Self>;

    fn set_filter(&mut self, datalink_type: i32, expr: &str) -> Result<()>;
    fn start(&mut self) -> Result<()>;

    fn msg_receive(&mut self) -> Result<Option<Message>>;
    fn msg_finalize(&mut self, msg: Message, verdict: Verdict) -> Result<()>;
    fn inject(&mut self, ingress_index: i32, data: &[u8], reverse: bool) -> Result<()>;

    fn break_handle(&self) -> BreakHandle;
    fn breakloop(&self);

    fn stop(&mut self) -> Result<()>;
    fn shutdown(self);

    fn stats(&mut self) -> crate::engine::Stats;
    fn reset_stats(&mut self);

    fn capabilities(&self) -> Capabilities;
    fn snaplen(&self) -> u32;
    fn device_index(&self, name: &str) -> Option<i32>;
    fn last_error(&self) -> Option<&crate::error::AfPacketError>;
}

impl Module for Engine {
    fn initialize(config: ModuleConfig, filter_compiler: Box<dyn FilterCompiler>) -> Result<Self> {
        Engine::initialize(config, filter_compiler)
    }

    fn set_filter(&mut self, datalink_type: i32, expr: &str) -> Result<()> {
        Engine::set_filter(self, datalink_type, expr)
    }

    fn start(&mut self) -> Result<()> {
        Engine::start(self)
    }

    fn msg_receive(&mut self) -> Result<Option<Message>> {
        Engine::msg_receive(self)
    }

    fn msg_finalize(&mut self, msg: Message, verdict: Verdict) -> Result<()> {
        Engine::msg_finalize(self, msg, verdict)
    }

    fn inject(&mut self, ingress_index: i32, data: &[u8], reverse: bool) -> Result<()> {
        Engine::inject(self, ingress_index, data, reverse)
    }

    fn break_handle(&self) -> BreakHandle {
        Engine::break_handle(self)
    }

    fn breakloop(&self) {
        Engine::breakloop(self)
    }

    fn stop(&mut self) -> Result<()> {
        Engine::stop(self)
    }

    fn shutdown(self) {
        drop(self);
    }

    fn stats(&mut self) -> crate::engine::Stats {
        Engine::stats(self)
    }

    fn reset_stats(&mut self) {
        Engine::reset_stats(self)
    }

    fn capabilities(&self) -> Capabilities {
        Engine::capabilities(self)
    }

    fn snaplen(&self) -> u32 {
        Engine::snaplen(self)
    }

    fn device_index(&self, name: &str) -> Option<i32> {
        Engine::device_index(self, name)
    }

    fn last_error(&self) -> Option<&crate::error::AfPacketError> {
        Engine::last_error(self)
    }
}
