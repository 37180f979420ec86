//! Call-stack synthesis: real frames recovered by CFI unwinding,
//! interleaved with inlined frames recovered from
//! DW_TAG_inlined_subroutine DIEs.

use crate::address::{AddressRanges, VirtualAddress};
use crate::dwarf::{
    evaluate_unwind_expression, CfaRule, DieRef, DwarfData, ExpressionOutcome, RegisterRule,
    UnwindRules,
};
use crate::error::{Error, Result};
use crate::loaded_elves::{LoadedElf, LoadedElves};
use crate::memory::Memory;
use crate::register::{register_by_dwarf_id, register_by_name, RegisterClass, RegisterState,
    RegisterValue};
use log::trace;
use std::path::PathBuf;

const MAX_FRAMES: usize = 256;

/// One stack frame. `registers` is the register file as if this frame's
/// callee had just returned.
#[derive(Clone, Debug)]
pub struct CallFrame {
    pub name: Option<String>,
    /// Code ranges in virtual space.
    pub ranges: AddressRanges,
    pub backtrace_pc: VirtualAddress,
    pub registers: RegisterState,
    pub source_file: Option<PathBuf>,
    pub source_line: Option<u64>,
    pub is_inlined: bool,
    /// Index (into the frame list) of the real frame hosting this inlined
    /// frame.
    pub base_frame: Option<usize>,
    pub die: Option<DieRef>,
}

/// Ordered list of frames, innermost first, with the executing-frame
/// cursor that "step into inlined function" moves.
#[derive(Clone, Debug, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    executing_frame: usize,
}

impl CallStack {
    pub fn empty() -> CallStack {
        CallStack::default()
    }

    /// Walk outward from the stopped pc: snap to line entries, collect
    /// the inlined chain above each real frame, then unwind to the caller
    /// until the rules or the return address run out.
    pub fn build(
        pc: VirtualAddress,
        registers: &RegisterState,
        elves: &LoadedElves,
        memory: &dyn Memory,
    ) -> Result<CallStack> {
        let mut frames: Vec<CallFrame> = Vec::new();
        let mut state = *registers;
        let mut current_pc = pc;

        while frames.len() < MAX_FRAMES {
            let (elf, fa) = match elves.find_by_virtual_address(current_pc) {
                Some(found) => found,
                None => break,
            };
            let dwarf = match &elf.dwarf {
                Some(dwarf) if dwarf.has_units() => dwarf,
                _ => break,
            };

            // Unwound PCs may point mid-instruction; snap to the line
            // entry's address for DIE lookups.
            let snapped = dwarf
                .line_entry_at(fa)
                .map(|entry| dwarf.line_entry(entry).address)
                .unwrap_or(fa);

            let function = match dwarf.function_definition_containing(snapped) {
                Some(function) => function,
                None => break,
            };

            push_frame_batch(&mut frames, elf, dwarf, function, snapped, current_pc, &state);

            let rules = match dwarf.compute_unwind_rules_at(fa)? {
                Some(rules) => rules,
                None => break,
            };
            let (caller_state, caller_pc) =
                match apply_unwind_rules(&rules, &state, memory, elf.load_bias)? {
                    Some(next) => next,
                    None => break,
                };

            trace!(
                "unwound {} -> caller pc {}",
                current_pc,
                caller_pc
            );
            state = caller_state;
            // Land inside the call instruction rather than at the return
            // address, which may already belong to the next line.
            current_pc = caller_pc - 1;
        }

        let mut stack = CallStack {
            frames,
            executing_frame: 0,
        };
        stack.reset_executing_frame(pc);
        Ok(stack)
    }

    fn reset_executing_frame(&mut self, pc: VirtualAddress) {
        let first_real = self
            .frames
            .iter()
            .position(|f| !f.is_inlined)
            .unwrap_or(0);
        // Innermost inlined frame already entered: its low address is
        // strictly below the pc.
        let entered_inlined = self.frames[..first_real].iter().position(|f| {
            f.ranges
                .low()
                .map(|low| low.as_u64() < pc.as_u64())
                .unwrap_or(false)
        });
        self.executing_frame = entered_inlined.unwrap_or(first_real);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All synthesized frames, innermost first, including inlined frames
    /// not yet entered.
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// The frames from the executing frame outwards.
    pub fn executing_stack(&self) -> &[CallFrame] {
        &self.frames[self.executing_frame.min(self.frames.len())..]
    }

    pub fn executing_frame(&self) -> Option<&CallFrame> {
        self.frames.get(self.executing_frame)
    }

    /// Inlined frames above the executing frame whose bodies start at the
    /// current pc but have not been stepped into.
    pub fn num_unexecuted_inlined_functions(&self) -> usize {
        self.executing_frame
    }

    /// Move the cursor one inlined frame inwards. Purely a cursor move;
    /// the tracee does not run. Returns false when no unexecuted inlined
    /// frame remains.
    pub fn step_into_inlined(&mut self) -> bool {
        if self.executing_frame == 0 {
            return false;
        }
        self.executing_frame -= 1;
        true
    }
}

/// Append the real frame for `function` and its inlined chain at `fa`.
/// The batch lands innermost-first: deepest inlined frame, then its
/// callers, then the hosting real frame.
fn push_frame_batch(
    frames: &mut Vec<CallFrame>,
    elf: &LoadedElf,
    dwarf: &DwarfData,
    function: DieRef,
    fa: crate::address::FileAddress,
    pc: VirtualAddress,
    state: &RegisterState,
) {
    // Chain of inlined subroutines containing fa, outermost first.
    let mut chain: Vec<DieRef> = Vec::new();
    let mut cursor = function;
    loop {
        let next = dwarf.children_of(cursor).find(|&child| {
            let die = dwarf.die(child);
            die.is_inlined_subroutine() && die.ranges.contains(fa)
        });
        match next {
            Some(child) => {
                chain.push(child);
                cursor = child;
            }
            None => break,
        }
    }

    let line_location = dwarf.line_entry_at(fa).map(|entry_ref| {
        let entry = dwarf.line_entry(entry_ref);
        (dwarf.line_entry_path(entry_ref), entry.line)
    });

    let to_virtual_ranges = |die: DieRef| {
        AddressRanges::new(
            dwarf
                .die(die)
                .ranges
                .iter()
                .map(|r| crate::address::AddressRange::new(
                    crate::address::FileAddress::new(r.low.as_u64() + elf.load_bias),
                    crate::address::FileAddress::new(r.high.as_u64() + elf.load_bias),
                ))
                .collect(),
        )
    };

    // The hosting real frame's source location is the innermost call
    // site leading out of it; the deepest inlined frame takes the line
    // entry at pc.
    let batch_base_index = frames.len() + chain.len();
    let mut batch: Vec<CallFrame> = Vec::new();

    for (depth, &die) in chain.iter().enumerate().rev() {
        let (source_file, source_line) = if depth == chain.len() - 1 {
            match &line_location {
                Some((path, line)) => (path.clone(), Some(*line)),
                None => (None, None),
            }
        } else {
            let (path, line) = dwarf.call_site(chain[depth + 1]);
            (path, line)
        };
        batch.push(CallFrame {
            name: dwarf.die_name(die),
            ranges: to_virtual_ranges(die),
            backtrace_pc: pc,
            registers: *state,
            source_file,
            source_line,
            is_inlined: true,
            base_frame: Some(batch_base_index),
            die: Some(die),
        });
    }

    let (real_file, real_line) = if let Some(&first_inlined) = chain.first() {
        dwarf.call_site(first_inlined)
    } else {
        match &line_location {
            Some((path, line)) => (path.clone(), Some(*line)),
            None => (None, None),
        }
    };
    batch.push(CallFrame {
        name: dwarf.die_name(function),
        ranges: to_virtual_ranges(function),
        backtrace_pc: pc,
        registers: *state,
        source_file: real_file,
        source_line: real_line,
        is_inlined: false,
        base_frame: None,
        die: Some(function),
    });

    frames.extend(batch);
}

/// Evaluate one row of CFI rules against `state`. Returns the caller's
/// state and return pc, or None when the caller's pc is undefined (outer
/// end of the stack).
fn apply_unwind_rules(
    rules: &UnwindRules,
    state: &RegisterState,
    memory: &dyn Memory,
    load_bias: u64,
) -> Result<Option<(RegisterState, VirtualAddress)>> {
    let register_value = |dwarf_id: u16| -> Option<u64> {
        register_by_dwarf_id(dwarf_id as i16).and_then(|spec| state.canonical_u64(spec))
    };

    let cfa = match &rules.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = register_value(*register).ok_or_else(|| {
                Error::decode(format!("CFA rule names undefined register {}", register))
            })?;
            base.wrapping_add(*offset as u64)
        }
        CfaRule::Expression(bytes) => {
            evaluate_expression_value(bytes, None, state, memory, load_bias)?
        }
    };

    let mut caller = *state;
    for (dwarf_id, rule) in &rules.registers {
        let spec = match register_by_dwarf_id(*dwarf_id as i16) {
            // Rules for registers outside the GPR file (x87, vector) are
            // not tracked through unwinding.
            Some(spec) if spec.class == RegisterClass::Gpr => spec,
            _ => continue,
        };
        caller = match rule {
            RegisterRule::Undefined => caller.with_undefined(spec),
            RegisterRule::SameValue => match state.canonical_u64(spec) {
                Some(v) => caller.with_value(spec, RegisterValue::U64(v))?,
                None => caller.with_undefined(spec),
            },
            RegisterRule::InRegister(other) => match register_value(*other) {
                Some(v) => caller.with_value(spec, RegisterValue::U64(v))?,
                None => caller.with_undefined(spec),
            },
            RegisterRule::Offset(offset) => {
                let value = memory.read_u64(VirtualAddress::new(cfa.wrapping_add(*offset as u64)))?;
                caller.with_value(spec, RegisterValue::U64(value))?
            }
            RegisterRule::ValueOffset(offset) => {
                caller.with_value(spec, RegisterValue::U64(cfa.wrapping_add(*offset as u64)))?
            }
            RegisterRule::Expression(bytes) => {
                let addr = evaluate_expression_value(bytes, Some(cfa), state, memory, load_bias)?;
                let value = memory.read_u64(VirtualAddress::new(addr))?;
                caller.with_value(spec, RegisterValue::U64(value))?
            }
            RegisterRule::ValueExpression(bytes) => {
                let value = evaluate_expression_value(bytes, Some(cfa), state, memory, load_bias)?;
                caller.with_value(spec, RegisterValue::U64(value))?
            }
        };
    }

    // The CFA is, by definition, the caller's stack pointer at the call
    // site.
    let rsp = register_by_name("rsp").unwrap();
    caller = caller.with_value(rsp, RegisterValue::U64(cfa))?;

    let ra_spec = match register_by_dwarf_id(rules.return_address_register as i16) {
        Some(spec) => spec,
        None => return Ok(None),
    };
    let caller_pc = match caller.canonical_u64(ra_spec) {
        Some(pc) if pc != 0 => pc,
        _ => return Ok(None),
    };
    caller = caller.with_program_counter(VirtualAddress::new(caller_pc));
    Ok(Some((caller, VirtualAddress::new(caller_pc))))
}

fn evaluate_expression_value(
    bytes: &[u8],
    initial: Option<u64>,
    state: &RegisterState,
    memory: &dyn Memory,
    load_bias: u64,
) -> Result<u64> {
    let mut get_register = |dwarf_id: u16| -> Option<u64> {
        register_by_dwarf_id(dwarf_id as i16).and_then(|spec| state.canonical_u64(spec))
    };
    let mut read_memory = |addr: u64, size: u8| -> Option<u64> {
        let mut buf = [0u8; 8];
        let size = size.min(8) as usize;
        memory
            .read(VirtualAddress::new(addr), &mut buf[..size])
            .ok()?;
        Some(u64::from_le_bytes(buf))
    };
    let outcome = evaluate_unwind_expression(
        bytes,
        initial,
        &mut get_register,
        &mut read_memory,
        load_bias,
    )?;
    match outcome {
        ExpressionOutcome::Address(addr) => Ok(addr),
        ExpressionOutcome::Value(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::register::register_by_name;

    fn state_with(pc: u64, sp: u64, bp: u64) -> RegisterState {
        let rip = register_by_name("rip").unwrap();
        let rsp = register_by_name("rsp").unwrap();
        let rbp = register_by_name("rbp").unwrap();
        RegisterState::empty()
            .with_value(rip, RegisterValue::U64(pc))
            .unwrap()
            .with_value(rsp, RegisterValue::U64(sp))
            .unwrap()
            .with_value(rbp, RegisterValue::U64(bp))
            .unwrap()
    }

    #[test]
    fn unwind_rules_recover_the_caller() {
        // Standard prologue-less leaf: CFA = rsp + 8, ra at CFA - 8.
        let rules = UnwindRules {
            cfa: CfaRule::RegisterOffset {
                register: 7,
                offset: 8,
            },
            registers: vec![(16, RegisterRule::Offset(-8))],
            return_address_register: 16,
        };
        let memory = FakeMemory::new();
        memory
            .write_u64(VirtualAddress::new(0x7000), 0x401234)
            .unwrap();
        let state = state_with(0x400000, 0x7000, 0);
        let (caller, caller_pc) = apply_unwind_rules(&rules, &state, &memory, 0)
            .unwrap()
            .unwrap();
        assert_eq!(caller_pc, VirtualAddress::new(0x401234));
        assert_eq!(caller.program_counter(), VirtualAddress::new(0x401234));
        // Caller's rsp is the CFA.
        assert_eq!(caller.stack_pointer(), VirtualAddress::new(0x7008));
    }

    #[test]
    fn undefined_return_address_ends_the_walk() {
        let rules = UnwindRules {
            cfa: CfaRule::RegisterOffset {
                register: 7,
                offset: 8,
            },
            registers: vec![(16, RegisterRule::Undefined)],
            return_address_register: 16,
        };
        let memory = FakeMemory::new();
        let state = state_with(0x400000, 0x7000, 0);
        assert!(apply_unwind_rules(&rules, &state, &memory, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn value_offset_skips_the_memory_read() {
        let rules = UnwindRules {
            cfa: CfaRule::RegisterOffset {
                register: 6,
                offset: 16,
            },
            registers: vec![
                (6, RegisterRule::ValueOffset(-16)),
                (16, RegisterRule::Offset(-8)),
            ],
            return_address_register: 16,
        };
        let memory = FakeMemory::new();
        memory
            .write_u64(VirtualAddress::new(0x7008), 0x40abcd)
            .unwrap();
        let state = state_with(0x400000, 0x6ff0, 0x7000);
        let (caller, _) = apply_unwind_rules(&rules, &state, &memory, 0)
            .unwrap()
            .unwrap();
        let rbp = register_by_name("rbp").unwrap();
        assert_eq!(caller.canonical_u64(rbp), Some(0x7000));
    }

    #[test]
    fn executing_cursor_moves_without_the_tracee() {
        let frame = |inlined: bool, low: u64| CallFrame {
            name: None,
            ranges: AddressRanges::new(vec![crate::address::AddressRange::new(
                crate::address::FileAddress::new(low),
                crate::address::FileAddress::new(low + 0x10),
            )]),
            backtrace_pc: VirtualAddress::new(0x1000),
            registers: RegisterState::empty(),
            source_file: None,
            source_line: None,
            is_inlined: inlined,
            base_frame: None,
            die: None,
        };
        let mut stack = CallStack {
            frames: vec![frame(true, 0x1000), frame(true, 0x1000), frame(false, 0xf00)],
            executing_frame: 0,
        };
        stack.reset_executing_frame(VirtualAddress::new(0x1000));
        // Neither inlined frame has been entered: low == pc.
        assert_eq!(stack.num_unexecuted_inlined_functions(), 2);
        assert!(stack.step_into_inlined());
        assert_eq!(stack.num_unexecuted_inlined_functions(), 1);
        assert!(stack.step_into_inlined());
        assert!(!stack.step_into_inlined());
    }
}
