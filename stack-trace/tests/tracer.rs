use stack_trace::{DebugInfo, Diagnostic, InstructionKind, StackTracer, TraceTag, TypeRegistry};

const USER_STACK: u32 = 0xfb8f;
const SYSTEM_STACK: u32 = 0xfc4f;

fn tag(text: &str) -> TraceTag {
    text.parse().unwrap()
}

fn memory(address: u32) -> u8 {
    (address >> 4) as u8
}

#[test]
fn push_then_pop_is_balanced_for_every_width() {
    let mut types = TypeRegistry::new();
    types.declare_tag("byte", "type 1c").unwrap();
    types.declare_tag("word", "type 2d").unwrap();
    types.declare_tag("point", "struct word word byte").unwrap();

    for (name, size) in [("byte", 1u32), ("word", 2), ("point", 5)] {
        let mut info = DebugInfo::new();
        info.types = types.clone();
        info.add_tag(0x10, &tag(&format!("@locals {name}")), true);
        info.add_tag(0x20, &tag(&format!("@locals {name}")), false);

        let mut tracer = StackTracer::with_debug_info(info);
        tracer.notify_instruction(0x00, USER_STACK, InstructionKind::Assignment);
        let pushed = tracer.notify_instruction(0x10, USER_STACK - size, InstructionKind::Allocate);
        assert!(pushed.is_clean(), "{name}: {:?}", pushed.diagnostics);
        assert_eq!(tracer.active_stack().unwrap().slot_count(), 1);

        let popped = tracer.notify_instruction(0x20, USER_STACK, InstructionKind::Deallocate);
        assert!(popped.is_clean(), "{name}: {:?}", popped.diagnostics);
        let stack = tracer.active_stack().unwrap();
        assert_eq!(stack.sp(), USER_STACK);
        assert!(stack.top().unwrap().is_empty());
    }
}

#[test]
fn mismatched_pop_is_reported_and_resynced() {
    let mut info = DebugInfo::new();
    info.types.declare_tag("x", "type 2h").unwrap();
    info.add_tag(0x10, &tag("@locals x"), true);
    info.add_tag(0x20, &tag("@locals x"), false);

    let mut tracer = StackTracer::with_debug_info(info);
    tracer.notify_instruction(0x00, 0x1000, InstructionKind::Assignment);
    assert!(tracer
        .notify_instruction(0x10, 0x0ffe, InstructionKind::Allocate)
        .is_clean());

    let outcome = tracer.notify_instruction(0x20, 0x0fff, InstructionKind::Deallocate);
    assert_eq!(
        outcome.diagnostics,
        [Diagnostic::Desync {
            expected: 0x1000,
            observed: 0x0fff
        }]
    );
    assert_eq!(tracer.active_stack().unwrap().sp(), 0x0fff);
}

#[test]
fn nested_calls_with_parameters() {
    let mut info = DebugInfo::new();
    info.types.declare_tag("n", "type 2d").unwrap();
    info.types.declare_tag("result", "type 2d").unwrap();
    info.types.declare_tag("tmp", "type 1c").unwrap();
    // main: SUBSP 4 ;@param n result
    info.add_tag(0x0003, &tag("@param n result"), true);
    // fn: SUBSP 1 ;@locals tmp
    info.add_tag(0x0020, &tag("@locals tmp"), true);
    // fn: ADDSP 1 ;@locals tmp
    info.add_tag(0x0030, &tag("@locals tmp"), false);
    // main: ADDSP 4 ;@param n result
    info.add_tag(0x0009, &tag("@param n result"), false);

    let mut tracer = StackTracer::new();
    tracer.set_debug_info(info);
    let mut sp = USER_STACK;
    let mut step = |tracer: &mut StackTracer, pc: u16, delta: i32, kind: InstructionKind| {
        sp = sp.wrapping_add_signed(delta);
        let outcome = tracer.notify_instruction(pc, sp, kind);
        assert!(outcome.is_clean(), "{pc:#x}: {:?}", outcome.diagnostics);
    };

    step(&mut tracer, 0x0000, 0, InstructionKind::Assignment);
    step(&mut tracer, 0x0003, -4, InstructionKind::Allocate);
    step(&mut tracer, 0x0006, -2, InstructionKind::Call);
    step(&mut tracer, 0x0020, -1, InstructionKind::Allocate);

    {
        let stack = tracer.active_stack().unwrap();
        // root, parameters, call frame
        assert_eq!(stack.len(), 3);
        let frames = stack.frames();
        assert!(frames[1].is_active());
        assert_eq!(frames[1].slots().len(), 2);
        assert_eq!(frames[2].slots()[0].name(), "retAddr");
        assert_eq!(frames[2].top().unwrap().name(), "tmp");
        assert_eq!(frames[2].top().unwrap().address(), USER_STACK - 7);

        let lines = stack.render_lines(0, &memory);
        // Empty root frame renders nothing, the others add two border lines each.
        assert_eq!(lines.len(), 2 + 2 + 2 + 2);
        assert!(lines[1].starts_with("= tmp "));
    }

    step(&mut tracer, 0x0030, 1, InstructionKind::Deallocate);
    step(&mut tracer, 0x0040, 2, InstructionKind::Ret);
    step(&mut tracer, 0x0009, 4, InstructionKind::Deallocate);

    let stack = tracer.active_stack().unwrap();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack.slot_count(), 0);
    assert_eq!(stack.sp(), USER_STACK);
}

#[test]
fn traps_run_on_the_system_stack() {
    let mut tracer = StackTracer::new();
    tracer.notify_instruction(0x0000, USER_STACK, InstructionKind::Assignment);
    let user = tracer.active().unwrap();

    for _ in 0..2 {
        let trap = tracer.notify_instruction(0x0010, SYSTEM_STACK - 12, InstructionKind::Trap);
        assert!(trap.is_clean(), "{:?}", trap.diagnostics);
        assert!(trap.switched);
        let system = tracer.active_stack().unwrap();
        assert_eq!(system.base_address(), SYSTEM_STACK);
        let context = system.top().unwrap();
        assert!(context.is_active());
        assert_eq!(context.len(), 7);
        assert_eq!(context.top().unwrap().name(), "NZVC");
        assert_eq!(context.top().unwrap().address(), SYSTEM_STACK - 12);

        let ret = tracer.notify_instruction(0xfd00, USER_STACK, InstructionKind::TrapRet);
        assert!(ret.is_clean(), "{:?}", ret.diagnostics);
        assert!(ret.switched);
        assert_eq!(tracer.active(), Some(user));
    }

    assert_eq!(tracer.stacks().len(), 2);
    let system = &tracer.stacks()[1];
    assert_eq!(system.sp(), SYSTEM_STACK);
    assert_eq!(system.slot_count(), 0);
}

#[test]
fn debug_info_resets_stacks() {
    let mut tracer = StackTracer::new();
    tracer.notify_instruction(0x0000, USER_STACK, InstructionKind::Assignment);
    tracer.notify_instruction(0x0003, USER_STACK - 2, InstructionKind::Call);
    assert_eq!(tracer.stacks().len(), 1);

    let info = DebugInfo::from_json(r#"{ "types": {}, "commands": {} }"#).unwrap();
    tracer.set_debug_info(info);
    assert!(tracer.stacks().is_empty());
    assert_eq!(tracer.active(), None);
}

#[test]
fn locate_reports_slot_positions() {
    let mut tracer = StackTracer::new();
    tracer.notify_instruction(0x0000, USER_STACK, InstructionKind::Assignment);
    tracer.notify_instruction(0x0003, USER_STACK - 2, InstructionKind::Call);
    tracer.notify_instruction(0x0010, SYSTEM_STACK - 12, InstructionKind::Trap);

    let location = tracer.locate(SYSTEM_STACK - 1).unwrap();
    assert_eq!(location.stack, 1);
    assert_eq!(tracer.slot(location).unwrap().name(), "OS");

    let location = tracer.locate(USER_STACK - 2).unwrap();
    assert_eq!(location.stack, 0);
    assert_eq!(tracer.slot(location).unwrap().name(), "retAddr");
}
