//! Execution contexts for compiled updater routines.
//!
//! A [`Process`] is the stored suspension state of one entity's routine:
//! instruction pointer, value stack, and call frames with their local slots.
//! Resuming is an explicit call against that stored state; the process runs
//! until the routine waits or completes, and a wait leaves everything in
//! place so the next resume continues at the instruction after the wait.

use alloc::vec::Vec;

use crate::bytecode::{Instruction, Property};
use crate::runtime::*;

/// Maximum depth of the call stack before a resume faults.
pub const MAX_CALL_DEPTH: usize = 64;

/// Result of resuming a [`Process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The routine suspended on a wait instruction for the given number of
    /// frames. State is kept so the next resume continues past the wait.
    Wait { frames: u32 },
    /// The routine ran to normal completion. The scheduler decides whether
    /// to restart it from the beginning.
    Complete,
}

#[derive(Debug, Clone)]
struct Frame {
    block: usize,
    pos: usize,
    /// Value-stack height when this frame was entered (after its arguments
    /// were popped); everything above it belongs to this frame.
    stack_base: usize,
    locals: Vec<f32>,
}

/// A suspended execution state for one entity's updater routine.
#[derive(Debug, Clone, Default)]
pub struct Process {
    frames: Vec<Frame>,
    value_stack: Vec<f32>,
}

/// Validates an arithmetic result before it reaches the stack.
fn checked(value: f32) -> Result<f32, ErrorCause> {
    Ok(Number::new(value)?.get())
}

/// The cell a comparison or logic result encodes to.
fn bool_cell(value: bool) -> f32 {
    if value { 1.0 } else { 0.0 }
}

/// Reads an operand cell as a non-negative integral index.
fn cell_index(cell: f32) -> Option<usize> {
    let index = cell as usize;
    if index as f32 == cell { Some(index) } else { None }
}

impl Process {
    /// Creates a process poised at the start of `block`, with `args` bound to
    /// its first local slots.
    pub fn new(vm: &VirtualMachine, block: usize, args: &[f32]) -> Result<Self, ErrorCause> {
        let mut process = Process::default();
        process.initialize(vm, block, args)?;
        Ok(process)
    }

    /// Rewinds to the start of `block`, wiping all previous execution state.
    pub fn initialize(&mut self, vm: &VirtualMachine, block: usize, args: &[f32]) -> Result<(), ErrorCause> {
        let info = vm.block(block).ok_or(ErrorCause::InvalidBlock { index: block })?;
        let mut locals = alloc::vec![0.0; info.locals.max(args.len())];
        locals[..args.len()].copy_from_slice(args);
        self.frames.clear();
        self.value_stack.clear();
        self.frames.push(Frame { block, pos: 0, stack_base: 0, locals });
        Ok(())
    }

    /// Resumes execution until the routine waits or completes.
    ///
    /// `fuel` bounds the number of instructions executed across resumes;
    /// exhausting it is a fault, which keeps a routine that never waits from
    /// hanging the tick. On a fault the process state is meaningless and the
    /// owning entity should be deactivated.
    pub fn resume(
        &mut self,
        vm: &VirtualMachine,
        context: &mut dyn PropertyContext,
        fires: &mut Vec<FireCommand>,
        fuel: &mut usize,
    ) -> Result<StepResult, ErrorCause> {
        loop {
            let (block, pos) = match self.frames.last() {
                Some(frame) => (frame.block, frame.pos),
                None => return Ok(StepResult::Complete),
            };
            let code = vm.block(block).ok_or(ErrorCause::InvalidBlock { index: block })?.code.cells();

            if pos >= code.len() {
                let frame = self.frames.pop().unwrap();
                if self.frames.is_empty() {
                    return Ok(StepResult::Complete);
                }
                // a function that falls off its end without a return yields 0
                let result = if self.value_stack.len() > frame.stack_base {
                    self.value_stack.pop().ok_or(ErrorCause::StackUnderflow)?
                } else {
                    0.0
                };
                self.value_stack.truncate(frame.stack_base);
                self.value_stack.push(result);
                continue;
            }

            if *fuel == 0 {
                return Err(ErrorCause::ExecutionLimit);
            }
            *fuel -= 1;

            let cell = code[pos];
            let ins = Instruction::decode(cell).ok_or(ErrorCause::IllegalInstruction { cell })?;
            let aft = pos + 1 + ins.operand_count();
            if aft > code.len() {
                return Err(ErrorCause::IllegalInstruction { cell });
            }
            let operand = |i: usize| code[pos + 1 + i];
            self.frames.last_mut().unwrap().pos = aft;

            match ins {
                Instruction::Push => {
                    let value = checked(operand(0))?;
                    self.value_stack.push(value);
                }
                Instruction::Pop => {
                    self.pop()?;
                }
                Instruction::Negate => {
                    let value = self.pop()?;
                    self.value_stack.push(-value);
                }
                Instruction::OperatorNot => {
                    let value = self.pop()?;
                    self.value_stack.push(if value == 0.0 { 1.0 } else { 0.0 });
                }
                Instruction::OperatorAdd => self.binary_op(|a, b| checked(a + b))?,
                Instruction::OperatorSubtract => self.binary_op(|a, b| checked(a - b))?,
                Instruction::OperatorMultiply => self.binary_op(|a, b| checked(a * b))?,
                Instruction::OperatorDivide => self.binary_op(|a, b| checked(a / b))?,
                Instruction::OperatorMod => self.binary_op(|a, b| checked(a % b))?,
                Instruction::OperatorLessThan => self.binary_op(|a, b| Ok(bool_cell(a < b)))?,
                Instruction::OperatorLessThanEqual => self.binary_op(|a, b| Ok(bool_cell(a <= b)))?,
                Instruction::OperatorGreaterThan => self.binary_op(|a, b| Ok(bool_cell(a > b)))?,
                Instruction::OperatorGreaterThanEqual => self.binary_op(|a, b| Ok(bool_cell(a >= b)))?,
                Instruction::OperatorEqual => self.binary_op(|a, b| Ok(bool_cell(a == b)))?,
                Instruction::OperatorNotEqual => self.binary_op(|a, b| Ok(bool_cell(a != b)))?,
                Instruction::OperatorAnd => self.binary_op(|a, b| Ok(bool_cell(a != 0.0 && b != 0.0)))?,
                Instruction::OperatorOr => self.binary_op(|a, b| Ok(bool_cell(a != 0.0 || b != 0.0)))?,
                Instruction::Jump => {
                    let to = self.branch_target(operand(0), code.len())?;
                    self.frames.last_mut().unwrap().pos = to;
                }
                Instruction::IfZeroBranch => {
                    let to = self.branch_target(operand(0), code.len())?;
                    if self.pop()? == 0.0 {
                        self.frames.last_mut().unwrap().pos = to;
                    }
                }
                Instruction::GetVariable => {
                    let slot = cell_index(operand(0)).ok_or(ErrorCause::IllegalInstruction { cell: operand(0) })?;
                    let frame = self.frames.last().unwrap();
                    let value = *frame.locals.get(slot).ok_or(ErrorCause::InvalidVariableSlot { slot })?;
                    self.value_stack.push(value);
                }
                Instruction::SetVariable => {
                    let slot = cell_index(operand(0)).ok_or(ErrorCause::IllegalInstruction { cell: operand(0) })?;
                    let value = self.pop()?;
                    let frame = self.frames.last_mut().unwrap();
                    *frame.locals.get_mut(slot).ok_or(ErrorCause::InvalidVariableSlot { slot })? = value;
                }
                Instruction::GetProperty => {
                    let cell = operand(0);
                    let property = Property::decode(cell).ok_or(ErrorCause::IllegalProperty { cell })?;
                    let value = context.get_property(property).ok_or(ErrorCause::UnsupportedProperty { property })?;
                    self.value_stack.push(checked(value)?);
                }
                Instruction::SetProperty => {
                    let cell = operand(0);
                    let property = Property::decode(cell).ok_or(ErrorCause::IllegalProperty { cell })?;
                    let value = self.pop()?;
                    if !context.set_property(property, value) {
                        return Err(ErrorCause::UnsupportedProperty { property });
                    }
                }
                Instruction::FunctionCall => {
                    let index = cell_index(operand(0)).ok_or(ErrorCause::IllegalInstruction { cell: operand(0) })?;
                    let target = vm.block(index).ok_or(ErrorCause::InvalidBlock { index })?;
                    if self.frames.len() >= MAX_CALL_DEPTH {
                        return Err(ErrorCause::CallDepthLimit { limit: MAX_CALL_DEPTH });
                    }
                    let argc = target.params.len();
                    if self.value_stack.len() < argc {
                        return Err(ErrorCause::StackUnderflow);
                    }
                    let base = self.value_stack.len() - argc;
                    let mut locals = alloc::vec![0.0; target.locals.max(argc)];
                    locals[..argc].copy_from_slice(&self.value_stack[base..]);
                    self.value_stack.truncate(base);
                    self.frames.push(Frame { block: index, pos: 0, stack_base: base, locals });
                }
                Instruction::Fire => {
                    let command = self.fire_command(vm, operand(0), operand(1), operand(2), None)?;
                    fires.push(command);
                }
                Instruction::FireWithUpdater => {
                    let command = self.fire_command(vm, operand(0), operand(1), operand(2), Some((operand(3), operand(4))))?;
                    fires.push(command);
                }
                Instruction::WaitFrames => {
                    let delay = self.pop()?;
                    let frames = if delay > 0.0 { delay as u32 } else { 0 };
                    return Ok(StepResult::Wait { frames });
                }
            }
        }
    }

    fn pop(&mut self) -> Result<f32, ErrorCause> {
        self.value_stack.pop().ok_or(ErrorCause::StackUnderflow)
    }

    fn binary_op(&mut self, op: impl FnOnce(f32, f32) -> Result<f32, ErrorCause>) -> Result<(), ErrorCause> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.value_stack.push(op(left, right)?);
        Ok(())
    }

    fn branch_target(&self, cell: f32, size: usize) -> Result<usize, ErrorCause> {
        let to = cell_index(cell).ok_or(ErrorCause::IllegalInstruction { cell })?;
        // a target equal to the block size is the completion point return jumps use
        if to > size {
            return Err(ErrorCause::InvalidJumpTarget { to });
        }
        Ok(to)
    }

    /// Pops the argument groups of a fire instruction off the stack. Updater
    /// arguments were pushed last, so they come off first.
    fn fire_command(
        &mut self,
        vm: &VirtualMachine,
        type_cell: f32,
        firing_cell: f32,
        argc_cell: f32,
        updater_cells: Option<(f32, f32)>,
    ) -> Result<FireCommand, ErrorCause> {
        let type_index = cell_index(type_cell).ok_or(ErrorCause::IllegalInstruction { cell: type_cell })?;
        let firing_index = cell_index(firing_cell).ok_or(ErrorCause::IllegalInstruction { cell: firing_cell })?;
        let argc = cell_index(argc_cell).ok_or(ErrorCause::IllegalInstruction { cell: argc_cell })?;
        if vm.projectile_type(type_index).is_none() {
            return Err(ErrorCause::InvalidProjectileType { index: type_index });
        }
        if vm.firing_function_record(firing_index).is_none() {
            return Err(ErrorCause::InvalidFiringFunction { index: firing_index });
        }
        let updater = match updater_cells {
            Some((block_cell, argc_cell)) => {
                let block = cell_index(block_cell).ok_or(ErrorCause::IllegalInstruction { cell: block_cell })?;
                if vm.block(block).is_none() {
                    return Err(ErrorCause::InvalidBlock { index: block });
                }
                let argc = cell_index(argc_cell).ok_or(ErrorCause::IllegalInstruction { cell: argc_cell })?;
                Some(UpdaterSpawn { block, args: self.pop_args(argc)? })
            }
            None => None,
        };
        let args = self.pop_args(argc)?;
        Ok(FireCommand { type_index, firing_index, args, updater })
    }

    /// Pops `argc` values, restoring their push (left-to-right) order.
    fn pop_args(&mut self, argc: usize) -> Result<Vec<f32>, ErrorCause> {
        if self.value_stack.len() < argc {
            return Err(ErrorCause::StackUnderflow);
        }
        let args = self.value_stack.split_off(self.value_stack.len() - argc);
        Ok(args)
    }
}
