//! The filter compiler/evaluator is an external collaborator: "a BPF-style
//! program producer and evaluator... consumed as a black box exposing
//! `compile(snaplen, dlt, expr) -> program` and
//! `run(program, frame, caplen, wirelen) -> 0|nonzero`." This crate never
//! implements a BPF virtual machine; it only defines the seam a caller
//! plugs a real compiler into.

use std::fmt;

#[derive(Debug)]
pub struct FilterError(pub String);

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter compilation failed: {}", self.0)
    }
}

impl std::error::Error for FilterError {}

/// A compiled filter program, evaluated once per candidate frame.
///
/// `evaluate` returns `true` to admit the frame (deliver it to the host)
/// and `false` to reject it (count a filter hit and forward-through on a
/// bridge, per §4.7). This mirrors `run(program, frame, caplen, wirelen)
/// -> 0|nonzero`, inverted to a bool for ergonomics: the original's
/// "nonzero" (a BPF snaplen) means "admit", zero means "reject".
pub trait CompiledFilter: Send {
    fn evaluate(&self, frame: &[u8], caplen: u32, wirelen: u32) -> bool;
}

/// "empty means admit all" per the data model.
pub struct AdmitAll;

impl CompiledFilter for AdmitAll {
    fn evaluate(&self, _frame: &[u8], _caplen: u32, _wirelen: u32) -> bool {
        true
    }
}

/// Black-box compiler: `compile(snaplen, dlt, expr) -> program`.
pub trait FilterCompiler {
    fn compile(
        &self,
        snaplen: u32,
        datalink_type: i32,
        expr: &str,
    ) -> Result<Box<dyn CompiledFilter>, FilterError>;
}
