//! Call-stack reconstruction for a simulated machine.
//!
//! The simulator reports every instruction that touches the stack pointer. Debug info produced
//! by the assembler attaches [`command::CommandFrame`]s to instruction addresses, describing the
//! slots each instruction pushes or pops. [`StackTracer`] replays those frames into a model of
//! one or more [`Stack`]s and flags any disagreement with the simulator.

pub mod command;
pub mod model;
pub mod tracer;
pub mod types;

pub use command::{
    CommandFrame, CommandPacket, DebugInfo, DebugInfoError, Operand, StackOp, TraceTag,
};
pub use model::{Frame, Slot, SlotLocation, Stack};
pub use tracer::{Diagnostic, StackTracer, TraceOutcome};
pub use types::{Primitive, Type, TypeRegistry};

use serde::{Deserialize, Serialize};

/// Stack-relevant class of an executed instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    /// Subroutine call, pushes a return address.
    Call,
    /// Return from subroutine, pops a return address.
    Ret,
    /// Software interrupt, saves the process context on the system stack.
    Trap,
    /// Return from interrupt, restores the process context.
    TrapRet,
    /// Stack pointer decremented to make room for locals or arguments.
    Allocate,
    /// Stack pointer incremented to release locals or arguments.
    Deallocate,
    /// Stack pointer loaded with an arbitrary value.
    Assignment,
}
