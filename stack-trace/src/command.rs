use std::collections::BTreeMap;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::TypeRegistry;
use crate::InstructionKind;

/// Name of the slot holding a return address.
pub const RETURN_ADDRESS: &str = "retAddr";

/// A named value whose size is given by a type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operand {
    pub name: String,
    pub ty: String,
}

impl Operand {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

/// A single stack mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum StackOp {
    Push(Operand),
    Pop(Operand),
    Call(Operand),
    Ret(Operand),
    MarkActive(bool),
    AddFrame,
    RemoveFrame,
}

/// Ops contributed by one trace tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandPacket {
    pub ops: Vec<StackOp>,
}

impl CommandPacket {
    pub fn new(ops: Vec<StackOp>) -> Self {
        Self { ops }
    }
}

/// Every op attached to one instruction address, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandFrame {
    pub packets: Vec<CommandPacket>,
}

impl CommandFrame {
    pub fn new(packets: Vec<CommandPacket>) -> Self {
        Self { packets }
    }

    pub fn ops(&self) -> impl Iterator<Item = &StackOp> + '_ {
        self.packets.iter().flat_map(|packet| packet.ops.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.ops().next().is_none()
    }

    /// Frame used for instructions without debug info, if their kind has a sensible default.
    pub fn default_for(kind: InstructionKind) -> Option<Self> {
        let ret_addr = || Operand::new(RETURN_ADDRESS, "u16");
        let ops = match kind {
            InstructionKind::Call => vec![StackOp::Call(ret_addr())],
            InstructionKind::Ret => vec![StackOp::Ret(ret_addr())],
            InstructionKind::Trap => {
                let mut ops = vec![StackOp::AddFrame];
                ops.extend(
                    TRAP_CONTEXT
                        .iter()
                        .map(|(name, ty)| StackOp::Push(Operand::new(*name, *ty))),
                );
                ops.push(StackOp::MarkActive(true));
                ops
            }
            InstructionKind::TrapRet => {
                let mut ops = vec![StackOp::MarkActive(false)];
                ops.extend(
                    TRAP_CONTEXT
                        .iter()
                        .rev()
                        .map(|(name, ty)| StackOp::Pop(Operand::new(*name, *ty))),
                );
                ops.push(StackOp::RemoveFrame);
                ops
            }
            InstructionKind::Allocate
            | InstructionKind::Deallocate
            | InstructionKind::Assignment => return None,
        };
        Some(Self::new(vec![CommandPacket::new(ops)]))
    }

    /// Net number of bytes the frame pushes, given the sizes in `types`. Unknown types count as 0.
    pub fn pushed_bytes(&self, types: &TypeRegistry) -> i64 {
        self.ops()
            .map(|op| match op {
                StackOp::Push(operand) | StackOp::Call(operand) => {
                    types.size_of(&operand.ty).unwrap_or(0) as i64
                }
                StackOp::Pop(operand) | StackOp::Ret(operand) => {
                    -(types.size_of(&operand.ty).unwrap_or(0) as i64)
                }
                _ => 0,
            })
            .sum()
    }
}

/// Context saved by a Pep/10 trap, in push order. The last entry ends up at the lowest address.
const TRAP_CONTEXT: [(&str, &str); 7] = [
    ("OS", "u16"),
    ("IS", "u8"),
    ("SP", "u16"),
    ("PC", "u16"),
    ("X", "u16"),
    ("A", "u16"),
    ("NZVC", "u8"),
];

/// Stack annotations written next to instructions in assembly source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TraceTag {
    Call,
    Ret,
    /// Local variables allocated or freed by the tagged instruction.
    Locals(Vec<String>),
    /// Parameters, which live in a frame of their own.
    Param(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown trace tag: {0:?}")]
pub struct UnknownTraceTag(pub String);

/// Parses `@call`, `@ret`, `@locals a b` and `@param a, b`. The leading `@` is optional.
impl FromStr for TraceTag {
    type Err = UnknownTraceTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s
            .trim()
            .trim_start_matches('@')
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|word| !word.is_empty());
        let command = words.next().unwrap_or_default();
        let args = || words.map(str::to_owned).collect();
        match command {
            "call" => Ok(Self::Call),
            "ret" => Ok(Self::Ret),
            "locals" => Ok(Self::Locals(args())),
            "param" => Ok(Self::Param(args())),
            _ => Err(UnknownTraceTag(s.to_owned())),
        }
    }
}

impl TraceTag {
    /// Builds the ops for this tag. `is_push` selects between the allocating and freeing side of
    /// `locals` and `param`. Each argument is both the slot name and its type name.
    pub fn to_packet(&self, is_push: bool) -> CommandPacket {
        let operand = |arg: &String| Operand::new(arg.as_str(), arg.as_str());
        let ops = match self {
            Self::Call => vec![StackOp::Call(Operand::new(RETURN_ADDRESS, "u16"))],
            Self::Ret => vec![StackOp::Ret(Operand::new(RETURN_ADDRESS, "u16"))],
            Self::Locals(args) if is_push => {
                args.iter().map(|a| StackOp::Push(operand(a))).collect()
            }
            Self::Locals(args) => args.iter().rev().map(|a| StackOp::Pop(operand(a))).collect(),
            Self::Param(args) if is_push => {
                let mut ops = vec![StackOp::AddFrame];
                ops.extend(args.iter().map(|a| StackOp::Push(operand(a))));
                ops.push(StackOp::MarkActive(true));
                ops
            }
            Self::Param(args) => {
                let mut ops = vec![StackOp::MarkActive(false)];
                ops.extend(args.iter().rev().map(|a| StackOp::Pop(operand(a))));
                ops.push(StackOp::RemoveFrame);
                ops
            }
        };
        CommandPacket::new(ops)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DebugInfoError {
    #[error("failed to parse debug info")]
    Json(#[from] serde_json::Error),

    #[error("failed to read debug info")]
    Io(#[from] io::Error),
}

/// Everything the stack tracer knows about the program being run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    #[serde(default)]
    pub types: TypeRegistry,
    #[serde(default)]
    pub commands: BTreeMap<u16, CommandFrame>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, DebugInfoError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, DebugInfoError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_json(&self) -> Result<String, DebugInfoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Attaches the ops for `tag` to the instruction at `pc`, after any already attached.
    pub fn add_tag(&mut self, pc: u16, tag: &TraceTag, is_push: bool) {
        self.commands
            .entry(pc)
            .or_default()
            .packets
            .push(tag.to_packet(is_push));
    }

    pub fn frame(&self, pc: u16) -> Option<&CommandFrame> {
        self.commands.get(&pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse() {
        assert_eq!("@call".parse::<TraceTag>(), Ok(TraceTag::Call));
        assert_eq!(" ret ".parse::<TraceTag>(), Ok(TraceTag::Ret));
        assert_eq!(
            "@param a, b".parse::<TraceTag>(),
            Ok(TraceTag::Param(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            "locals x".parse::<TraceTag>(),
            Ok(TraceTag::Locals(vec!["x".into()]))
        );
        assert!("@global g".parse::<TraceTag>().is_err());
    }

    #[test]
    fn param_tags_manage_a_frame() {
        let tag = TraceTag::Param(vec!["a".into(), "b".into()]);
        let push = tag.to_packet(true).ops;
        assert_eq!(push.first(), Some(&StackOp::AddFrame));
        assert_eq!(push.last(), Some(&StackOp::MarkActive(true)));
        assert_eq!(push[1], StackOp::Push(Operand::new("a", "a")));

        let pop = tag.to_packet(false).ops;
        assert_eq!(pop.first(), Some(&StackOp::MarkActive(false)));
        assert_eq!(pop[1], StackOp::Pop(Operand::new("b", "b")));
        assert_eq!(pop.last(), Some(&StackOp::RemoveFrame));
    }

    #[test]
    fn trap_context_is_twelve_bytes() {
        let types = TypeRegistry::new();
        let trap = CommandFrame::default_for(InstructionKind::Trap).unwrap();
        let trap_ret = CommandFrame::default_for(InstructionKind::TrapRet).unwrap();
        assert_eq!(trap.pushed_bytes(&types), 12);
        assert_eq!(trap_ret.pushed_bytes(&types), -12);
        assert!(CommandFrame::default_for(InstructionKind::Allocate).is_none());
    }

    #[test]
    fn debug_info_json() {
        let mut info = DebugInfo::new();
        info.types.declare_tag("n", "type 2d").unwrap();
        info.add_tag(0x0010, &TraceTag::Locals(vec!["n".into()]), true);
        info.add_tag(0x0010, &TraceTag::Call, true);

        let json = info.to_json().unwrap();
        let loaded = DebugInfo::from_json(&json).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.frame(0x10).map(|f| f.ops().count()), Some(2));

        let written = r#"{
            "types": { "count": { "primitive": "u16" } },
            "commands": {
                "32": { "packets": [ { "ops": [
                    { "op": "push", "arg": { "name": "count", "ty": "count" } },
                    { "op": "mark_active", "arg": true },
                    { "op": "add_frame" }
                ] } ] }
            }
        }"#;
        let info = DebugInfo::from_json(written).unwrap();
        let ops: Vec<_> = info.frame(32).unwrap().ops().cloned().collect();
        assert_eq!(
            ops,
            [
                StackOp::Push(Operand::new("count", "count")),
                StackOp::MarkActive(true),
                StackOp::AddFrame,
            ]
        );
        assert_eq!(info.types.size_of("count"), Some(2));
        assert!(DebugInfo::from_json("{ \"commands\": 5 }").is_err());
    }
}
