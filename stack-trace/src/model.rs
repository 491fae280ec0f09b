//! Reconstructed call stacks. A [`Stack`] holds [`Frame`]s, bottom first, and each frame holds
//! the [`Slot`]s pushed into it, lowest address last.

const SLOT_NAME_WIDTH: usize = 7;
const SLOT_VALUE_WIDTH: usize = 6;
const SLOT_ADDRESS_WIDTH: usize = 4;
const SLOT_PADDING: usize = 2;

/// Width of a rendered slot line.
pub const SLOT_RENDER_WIDTH: usize =
    SLOT_NAME_WIDTH + SLOT_VALUE_WIDTH + SLOT_ADDRESS_WIDTH + 2 * SLOT_PADDING;

/// Width of a rendered frame line, the slot plus a border character and a space on each side.
pub const FRAME_RENDER_WIDTH: usize = SLOT_RENDER_WIDTH + 4;

/// A named value on the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    address: u32,
    size: u32,
    name: String,
    ty: String,
}

impl Slot {
    pub fn new(address: u32, size: u32, name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            address,
            size,
            name: name.into(),
            ty: ty.into(),
        }
    }

    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn contains(&self, address: u32) -> bool {
        self.address <= address && address - self.address < self.size
    }

    /// Reads the slot's bytes through `memory` and formats them as big-endian hex.
    pub fn value<M: Fn(u32) -> u8>(&self, memory: M) -> String {
        let value = (0..self.size.min(8)).fold(0u64, |value, offset| {
            (value << 8) | memory(self.address.wrapping_add(offset)) as u64
        });
        format!("{value:x}")
    }

    pub fn render(&self, value: &str) -> String {
        format!(
            "{:<name$} |{:^value_width$}| {:0address$x}",
            self.name,
            value,
            self.address,
            name = SLOT_NAME_WIDTH,
            value_width = SLOT_VALUE_WIDTH,
            address = SLOT_ADDRESS_WIDTH,
        )
    }
}

/// A group of slots belonging to one call or one set of parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    base_address: u32,
    active: bool,
    slots: Vec<Slot>,
}

impl Frame {
    pub fn new(base_address: u32, active: bool) -> Self {
        Self {
            base_address,
            active,
            slots: Vec::new(),
        }
    }

    /// Stack pointer at the time the frame was opened.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Lowest address occupied by the frame, or its base when it is empty.
    pub fn top_address(&self) -> u32 {
        self.slots
            .iter()
            .map(Slot::address)
            .min()
            .unwrap_or(self.base_address)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn top(&self) -> Option<&Slot> {
        self.slots.last()
    }

    pub fn push_slot(&mut self, slot: Slot) {
        self.slots.push(slot);
    }

    pub fn pop_slot(&mut self) -> Option<Slot> {
        self.slots.pop()
    }

    /// Renders the frame top slot first, between two border lines. Empty frames render nothing.
    pub fn render_lines<M: Fn(u32) -> u8>(&self, memory: &M) -> Vec<String> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        let fill = if self.active { '=' } else { '-' };
        let border: String = std::iter::repeat(fill).take(FRAME_RENDER_WIDTH).collect();
        let mut lines = Vec::with_capacity(self.slots.len() + 2);
        lines.push(border.clone());
        for slot in self.slots.iter().rev() {
            lines.push(format!("{fill} {} {fill}", slot.render(&slot.value(memory))));
        }
        lines.push(border);
        lines
    }
}

/// One region of memory used as a stack, e.g. the user stack or the system stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stack {
    base_address: u32,
    sp: u32,
    frames: Vec<Frame>,
}

impl Stack {
    /// Creates a stack holding a single empty, active root frame.
    pub fn new(base_address: u32) -> Self {
        Self {
            base_address,
            sp: base_address,
            frames: vec![Frame::new(base_address, true)],
        }
    }

    /// Highest address of the stack. Stacks grow toward lower addresses.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Last stack pointer observed for this stack.
    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub(crate) fn set_sp(&mut self, sp: u32) {
        self.sp = sp;
    }

    pub fn contains(&self, address: u32) -> bool {
        address <= self.base_address && address >= self.sp
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Pushes an inactive frame opened at `sp`. An empty, inactive top frame is reused instead.
    pub fn push_frame(&mut self, sp: u32) -> &mut Frame {
        let reuse = matches!(self.frames.last(), Some(top) if top.is_empty() && !top.is_active());
        if !reuse {
            self.frames.push(Frame::new(sp, false));
        }
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    pub(crate) fn push_active_frame(&mut self, sp: u32) {
        self.frames.push(Frame::new(sp, true));
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Total number of slots across all frames.
    pub fn slot_count(&self) -> usize {
        self.frames.iter().map(Frame::len).sum()
    }

    /// Renders every frame, most recent first, each line prefixed by `left_pad` spaces.
    pub fn render_lines<M: Fn(u32) -> u8>(&self, left_pad: usize, memory: &M) -> Vec<String> {
        let pad = " ".repeat(left_pad);
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.render_lines(memory))
            .map(|line| format!("{pad}{line}"))
            .collect()
    }
}

/// Position of a slot inside a [`crate::StackTracer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotLocation {
    pub stack: usize,
    pub frame: usize,
    pub slot: usize,
}
