use crate::value::Value;

use super::memory::Memory;
use super::opcode::Reg;

// ---- Compile-time register allocation ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Live,
    Protected,
}

/// Hands out register indices while one function body is lowered.
///
/// Every index below `current_register` has a slot state; only `Free`
/// slots sit in `free_registers`, so an index is never handed out twice
/// without a release in between.
#[derive(Debug, Default)]
pub struct FrameAllocator {
    current_register: u32,
    free_registers: Vec<Reg>,
    slots: Vec<SlotState>,
}

impl FrameAllocator {
    pub fn new() -> Self {
        FrameAllocator::default()
    }

    /// Reuses the most recently released register, else grows the frame.
    /// A protected register ignores plain releases.
    pub fn acquire(&mut self, protect: bool) -> Reg {
        let state = if protect { SlotState::Protected } else { SlotState::Live };
        match self.free_registers.pop() {
            Some(reg) => {
                debug_assert_eq!(self.slots[reg.index()], SlotState::Free);
                self.slots[reg.index()] = state;
                reg
            }
            None => self.grow(1, state),
        }
    }

    /// `count` consecutive fresh registers, returned as the first one.
    /// Skips the free list since reused registers are not contiguous.
    pub fn acquire_span(&mut self, count: u32) -> Reg {
        self.grow(count, SlotState::Live)
    }

    fn grow(&mut self, count: u32, state: SlotState) -> Reg {
        let base = Reg(self.current_register);
        self.current_register += count;
        self.slots.resize(self.current_register as usize, state);
        base
    }

    /// Returns `reg` to the free pool. Protected registers stay allocated
    /// unless `force` is set.
    pub fn release(&mut self, reg: Reg, force: bool) {
        let Some(state) = self.slots.get_mut(reg.index()) else {
            debug_assert!(false, "release of r{} which was never allocated", reg.0);
            return;
        };
        match *state {
            SlotState::Live => {}
            SlotState::Protected if force => {}
            SlotState::Protected => return,
            SlotState::Free => {
                debug_assert!(false, "double release of r{}", reg.0);
                return;
            }
        }
        *state = SlotState::Free;
        self.free_registers.push(reg);
    }

    pub fn release_span(&mut self, base: Reg, count: u32) {
        for i in 0..count {
            self.release(base.offset(i), false);
        }
    }

    pub fn reset(&mut self) {
        self.current_register = 0;
        self.free_registers.clear();
        self.slots.clear();
    }

    /// Register count the frame needs: the high-water mark.
    pub fn peak(&self) -> u32 {
        self.current_register
    }

    pub fn is_protected(&self, reg: Reg) -> bool {
        self.slots.get(reg.index()) == Some(&SlotState::Protected)
    }

    pub fn protected_registers(&self) -> impl Iterator<Item = Reg> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Protected)
            .map(|(i, _)| Reg(i as u32))
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| **s != SlotState::Free).count()
    }
}

// ---- Runtime frame ----

/// One activation record.
#[derive(Debug, Default)]
pub struct Frame {
    registers: Box<[Value]>,
    /// Where the caller resumes; `None` marks the outermost frame.
    pub return_address: Option<usize>,
    /// Caller register that receives this frame's return value.
    pub result_register: Reg,
}

impl Frame {
    pub fn new(size: u32, return_address: Option<usize>, result_register: Reg) -> Self {
        let mut frame = Frame::default();
        frame.setup(size, return_address, result_register);
        frame
    }

    pub fn allocate_registers(&mut self, size: u32) {
        self.registers = vec![Value::None; size as usize].into_boxed_slice();
    }

    pub fn free_registers(&mut self) {
        self.registers = Box::default();
    }

    pub fn setup(&mut self, size: u32, return_address: Option<usize>, result_register: Reg) {
        self.allocate_registers(size);
        self.return_address = return_address;
        self.result_register = result_register;
    }

    pub fn size(&self) -> usize {
        self.registers.len()
    }

    #[inline(always)]
    pub fn get(&self, reg: Reg) -> &Value {
        &self.registers[reg.index()]
    }

    #[inline(always)]
    pub fn set(&mut self, reg: Reg, value: Value) {
        self.registers[reg.index()] = value;
    }

    pub fn registers(&self) -> &[Value] {
        &self.registers
    }
}

// ---- Program ----

/// A compiled program: its memory and the root frame.
#[derive(Debug, Default)]
pub struct Program {
    pub memory: Memory,
    pub main_frame: Frame,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Sizes the root frame once the compiler knows its register count.
    pub fn declare_main_registers(&mut self, size: u32) {
        self.main_frame.setup(size, None, Reg(0));
    }
}
