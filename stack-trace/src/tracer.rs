use tracing::{debug, trace, warn};

use crate::command::{CommandFrame, DebugInfo, Operand, StackOp};
use crate::model::{Slot, SlotLocation, Stack};
use crate::InstructionKind;

/// Problems found while replaying command frames. They never stop the tracer, the model keeps
/// going with its best guess.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("no active stack for instruction at {pc:#06x}")]
    NoActiveStack { pc: u16 },

    #[error("{op} requires a frame, but the stack has none")]
    MissingFrame { op: &'static str },

    #[error("cannot pop {name:?} from an empty frame")]
    EmptyFrame { name: String },

    #[error("popped {name:?} as {expected} bytes, but its slot holds {actual}")]
    PopSizeMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("cannot remove a frame still holding {slots} slots")]
    FrameNotEmpty { slots: usize },

    #[error("unknown type {ty:?} for {name:?}")]
    UnknownType { name: String, ty: String },

    #[error("stack model expected sp {expected:#06x}, simulator reports {observed:#06x}")]
    Desync { expected: u32, observed: u32 },
}

/// Result of a single notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceOutcome {
    /// Every problem found while replaying the instruction, in order.
    pub diagnostics: Vec<Diagnostic>,
    /// Index of the active stack after the instruction.
    pub stack: Option<usize>,
    /// `true` if a command frame was replayed.
    pub modeled: bool,
    /// `true` if the active stack changed.
    pub switched: bool,
}

impl TraceOutcome {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Keeps a model of the program's call stacks in sync with the simulator.
///
/// The simulator reports every stack-affecting instruction through
/// [`StackTracer::notify_instruction`]. The tracer replays the command frame attached to the
/// instruction's address (or a default one for calls, returns and traps) and checks the result
/// against the stack pointer the simulator observed.
#[derive(Debug, Clone, Default)]
pub struct StackTracer {
    info: DebugInfo,
    stacks: Vec<Stack>,
    active: Option<usize>,
}

impl StackTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug_info(info: DebugInfo) -> Self {
        Self {
            info,
            ..Self::default()
        }
    }

    /// Installs new debug info and forgets every stack.
    pub fn set_debug_info(&mut self, info: DebugInfo) {
        debug!(
            commands = info.commands.len(),
            types = info.types.len(),
            "installed debug info"
        );
        self.info = info;
        self.reset();
    }

    pub fn debug_info(&self) -> &DebugInfo {
        &self.info
    }

    /// Forgets every stack.
    pub fn reset(&mut self) {
        self.stacks.clear();
        self.active = None;
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Index of the stack the program is currently running on.
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn active_stack(&self) -> Option<&Stack> {
        self.stacks.get(self.active?)
    }

    /// Finds the slot holding `address`.
    pub fn locate(&self, address: u32) -> Option<SlotLocation> {
        self.stacks.iter().enumerate().find_map(|(stack, s)| {
            s.frames().iter().enumerate().find_map(|(frame, f)| {
                f.slots()
                    .iter()
                    .position(|slot| slot.contains(address))
                    .map(|slot| SlotLocation { stack, frame, slot })
            })
        })
    }

    pub fn slot(&self, location: SlotLocation) -> Option<&Slot> {
        self.stacks
            .get(location.stack)?
            .frames()
            .get(location.frame)?
            .slots()
            .get(location.slot)
    }

    /// Updates the model for an instruction at `pc` that left the stack pointer at `sp_after`.
    pub fn notify_instruction(
        &mut self,
        pc: u16,
        sp_after: u32,
        kind: InstructionKind,
    ) -> TraceOutcome {
        let _span = tracing::trace_span!("notify_instruction", pc = pc).entered();
        let mut outcome = TraceOutcome::default();
        let previous = self.active;

        let frame = match self.info.frame(pc) {
            Some(frame) => Some(frame.clone()),
            None => CommandFrame::default_for(kind),
        };
        outcome.modeled = frame.is_some();

        match (kind, frame) {
            (InstructionKind::Assignment, frame) => {
                let stack = self.select_or_create(sp_after, 0);
                self.active = Some(stack);
                if let Some(frame) = frame {
                    let start = self.stacks[stack].sp();
                    self.replay(stack, start, &frame, &mut outcome);
                }
                self.stacks[stack].set_sp(sp_after);
            }
            (InstructionKind::Trap, Some(frame)) => {
                let pushed = frame.pushed_bytes(&self.info.types).max(0) as u32;
                let stack = self.select_or_create(sp_after, pushed);
                self.active = Some(stack);
                let start = self.stacks[stack].sp();
                let end = self.replay(stack, start, &frame, &mut outcome);
                self.check(stack, end, sp_after, &mut outcome);
            }
            (InstructionKind::TrapRet, Some(frame)) => match self.active {
                Some(current) => {
                    let start = self.stacks[current].sp();
                    let end = self.replay(current, start, &frame, &mut outcome);
                    self.stacks[current].set_sp(end);
                    let future = self.select_or_create(sp_after, 0);
                    if future == current {
                        self.check(current, end, sp_after, &mut outcome);
                    } else {
                        self.stacks[future].set_sp(sp_after);
                        self.active = Some(future);
                    }
                }
                None => {
                    outcome.modeled = false;
                    report(&mut outcome, Diagnostic::NoActiveStack { pc });
                }
            },
            (_, Some(frame)) => match self.active {
                Some(stack) => {
                    let start = self.stacks[stack].sp();
                    let end = self.replay(stack, start, &frame, &mut outcome);
                    self.check(stack, end, sp_after, &mut outcome);
                }
                None => {
                    outcome.modeled = false;
                    report(&mut outcome, Diagnostic::NoActiveStack { pc });
                }
            },
            (_, None) => {
                // Unmodeled instructions still move the pointer of the stack they run on.
                if let Some(stack) = self.active {
                    self.stacks[stack].set_sp(sp_after);
                }
            }
        }

        outcome.stack = self.active;
        outcome.switched = self.active != previous;
        if outcome.switched {
            debug!(from = ?previous, to = ?self.active, sp = sp_after, "switched stacks");
        }
        outcome
    }

    /// Returns the stack with the smallest base at or above `sp`, creating one at `sp + pushed`
    /// if none qualifies.
    fn select_or_create(&mut self, sp: u32, pushed: u32) -> usize {
        let found = self
            .stacks
            .iter()
            .enumerate()
            .filter(|(_, stack)| stack.base_address() >= sp)
            .min_by_key(|(_, stack)| stack.base_address())
            .map(|(index, _)| index);
        if let Some(index) = found {
            return index;
        }
        let base = sp.saturating_add(pushed);
        self.stacks.push(Stack::new(base));
        debug!(base = base, index = self.stacks.len() - 1, "created stack");
        self.stacks.len() - 1
    }

    /// Compares the replayed pointer with the observed one and resyncs the stack to the latter.
    fn check(&mut self, stack: usize, expected: u32, observed: u32, outcome: &mut TraceOutcome) {
        if expected != observed {
            report(outcome, Diagnostic::Desync { expected, observed });
        }
        self.stacks[stack].set_sp(observed);
    }

    /// Applies every op of `frame` to `stack`, starting from `sp`. Returns the final pointer.
    fn replay(
        &mut self,
        stack: usize,
        mut sp: u32,
        frame: &CommandFrame,
        outcome: &mut TraceOutcome,
    ) -> u32 {
        for op in frame.ops() {
            trace!(op = ?op, sp = sp, "replaying stack op");
            sp = self.apply(stack, op, sp, outcome);
        }
        sp
    }

    fn apply(&mut self, index: usize, op: &StackOp, sp: u32, outcome: &mut TraceOutcome) -> u32 {
        let types = &self.info.types;
        let stack = &mut self.stacks[index];
        let size_of = |operand: &Operand, outcome: &mut TraceOutcome| {
            let size = types.size_of(&operand.ty);
            if size.is_none() {
                report(
                    outcome,
                    Diagnostic::UnknownType {
                        name: operand.name.clone(),
                        ty: operand.ty.clone(),
                    },
                );
            }
            size
        };

        match op {
            StackOp::Push(operand) | StackOp::Call(operand) => {
                let Some(size) = size_of(operand, outcome) else {
                    return sp;
                };
                if matches!(op, StackOp::Call(_)) {
                    match stack.top_mut() {
                        Some(top) if !top.is_active() => top.set_active(true),
                        _ => stack.push_active_frame(sp),
                    }
                } else if stack.top().is_none() {
                    stack.push_active_frame(sp);
                }
                let sp = sp.wrapping_sub(size);
                if let Some(top) = stack.top_mut() {
                    top.push_slot(Slot::new(sp, size, operand.name.as_str(), operand.ty.as_str()));
                }
                sp
            }
            StackOp::Pop(operand) | StackOp::Ret(operand) => {
                let Some(expected) = size_of(operand, outcome) else {
                    return sp;
                };
                let is_ret = matches!(op, StackOp::Ret(_));
                let Some(top) = stack.top_mut() else {
                    report(outcome, Diagnostic::MissingFrame { op: op_name(op) });
                    return sp.wrapping_add(expected);
                };
                match top.pop_slot() {
                    Some(slot) if slot.size() != expected => report(
                        outcome,
                        Diagnostic::PopSizeMismatch {
                            name: operand.name.clone(),
                            expected,
                            actual: slot.size(),
                        },
                    ),
                    Some(_) => {}
                    None => report(
                        outcome,
                        Diagnostic::EmptyFrame {
                            name: operand.name.clone(),
                        },
                    ),
                }
                if is_ret {
                    top.set_active(false);
                    if top.is_empty() {
                        stack.pop_frame();
                    }
                }
                sp.wrapping_add(expected)
            }
            StackOp::AddFrame => {
                stack.push_frame(sp);
                sp
            }
            StackOp::RemoveFrame => {
                match stack.top() {
                    None => report(outcome, Diagnostic::MissingFrame { op: op_name(op) }),
                    Some(top) if !top.is_empty() => {
                        report(outcome, Diagnostic::FrameNotEmpty { slots: top.len() })
                    }
                    Some(_) => {
                        stack.pop_frame();
                    }
                }
                sp
            }
            StackOp::MarkActive(active) => {
                match stack.top_mut() {
                    Some(top) => top.set_active(*active),
                    None => report(outcome, Diagnostic::MissingFrame { op: op_name(op) }),
                }
                sp
            }
        }
    }
}

fn op_name(op: &StackOp) -> &'static str {
    match op {
        StackOp::Push(_) => "PUSH",
        StackOp::Pop(_) => "POP",
        StackOp::Call(_) => "CALL",
        StackOp::Ret(_) => "RET",
        StackOp::MarkActive(_) => "MARK_ACTIVE",
        StackOp::AddFrame => "ADD_FRAME",
        StackOp::RemoveFrame => "REMOVE_FRAME",
    }
}

fn report(outcome: &mut TraceOutcome, diagnostic: Diagnostic) {
    match &diagnostic {
        Diagnostic::Desync { expected, observed } => {
            warn!(expected = expected, observed = observed, "{diagnostic}")
        }
        Diagnostic::PopSizeMismatch { expected, actual, .. } => {
            warn!(expected = expected, actual = actual, "{diagnostic}")
        }
        _ => warn!("{diagnostic}"),
    }
    outcome.diagnostics.push(diagnostic);
}
