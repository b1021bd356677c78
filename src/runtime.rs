//! Miscellaneous types representing runtime state.

use alloc::vec::Vec;
use alloc::collections::BTreeMap;

use checked_float::{CheckedFloat, FloatChecker};
use compact_str::CompactString;

use crate::ast;
use crate::bytecode::{self, BlockKind, BlockRef, CodeBlock, CompileError, FiringRef, Property, PropertyRecord, Registry};

/// Error type used by [`NumberChecker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberError {
    Nan,
}

/// [`FloatChecker`] type used for validating a [`Number`].
pub struct NumberChecker;
impl FloatChecker<f32> for NumberChecker {
    type Error = NumberError;
    fn check(value: f32) -> Result<f32, Self::Error> {
        if value.is_nan() { return Err(NumberError::Nan); }
        Ok(value)
    }
}

/// The type used to validate numbers produced at runtime. Bytecode cells and
/// stack slots stay raw `f32`; every arithmetic result passes through this
/// gate so NaN becomes an entity-local fault instead of spreading.
pub type Number = CheckedFloat<f32, NumberChecker>;

/// The cause/explanation of an execution fault.
///
/// Faults are contained to the entity whose routine raised them: the entity
/// is deactivated, its execution context discarded, and the frame tick
/// continues with the remaining entities.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCause {
    /// The value stack held fewer operands than the current instruction pops.
    StackUnderflow,
    /// A cell was fetched for decoding that does not encode a complete instruction.
    IllegalInstruction { cell: f32 },
    /// A branch operand referenced a cell outside the current block.
    InvalidJumpTarget { to: usize },
    /// A variable operand referenced a slot outside the current frame.
    InvalidVariableSlot { slot: usize },
    /// A property operand did not decode to a registered property.
    IllegalProperty { cell: f32 },
    /// The running entity does not carry (or cannot write) the referenced property.
    UnsupportedProperty { property: Property },
    /// A call or updater operand referenced a block the machine does not contain.
    InvalidBlock { index: usize },
    /// A fire operand referenced a projectile type the machine does not know.
    InvalidProjectileType { index: usize },
    /// A fire operand referenced a firing function the machine does not know.
    InvalidFiringFunction { index: usize },
    /// A numeric operation produced an invalid value such as NaN.
    NumberError { error: NumberError },
    /// Exceeded the maximum call depth.
    CallDepthLimit { limit: usize },
    /// An updater consumed its whole per-tick execution budget without waiting.
    ExecutionLimit,
}
impl From<NumberError> for ErrorCause { fn from(error: NumberError) -> Self { Self::NumberError { error } } }

/// Script-visible property access for a live entity. Which properties an
/// entity carries depends on what it is; a miss is reported as a fault by
/// the machine, not here.
pub trait PropertyContext {
    /// Reads `property`, if this entity carries it.
    fn get_property(&self, property: Property) -> Option<f32>;
    /// Writes `property`; returns `false` if this entity does not carry it
    /// or it is read-only.
    fn set_property(&mut self, property: Property, value: f32) -> bool;
}

/// The updater binding a fire instruction requested for its spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterSpawn {
    pub block: usize,
    pub args: Vec<f32>,
}

/// A spawn request produced by a fire instruction. The scheduler applies
/// these after the resume step that produced them, at the firing entity's
/// position and angle.
#[derive(Debug, Clone, PartialEq)]
pub struct FireCommand {
    pub type_index: usize,
    pub firing_index: usize,
    pub args: Vec<f32>,
    pub updater: Option<UpdaterSpawn>,
}

/// A registered projectile type.
#[derive(Debug, Clone)]
pub struct ProjectileType {
    pub name: CompactString,
    pub sprite_index: i32,
    pub radius: f32,
}

/// A firing function registered for a projectile type: its positional
/// arguments initialize the listed properties on the spawned projectile.
#[derive(Debug, Clone)]
pub struct FiringFunction {
    pub type_index: usize,
    pub name: CompactString,
    pub params: Vec<Property>,
}

/// A compiled code block installed in the machine.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: CompactString,
    pub kind: BlockKind,
    pub params: Vec<CompactString>,
    /// Numeric local slots a frame for this block needs (parameters included).
    pub locals: usize,
    pub code: CodeBlock,
}

/// An error raised while registering types or firing functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateType { name: CompactString },
    DuplicateFiringFunction { type_name: CompactString, name: CompactString },
    UnknownType { name: CompactString },
    /// A firing-function parameter does not name a property.
    UnknownProperty { name: CompactString },
}

/// Owns every compiled code block plus the load-time registries the compiler
/// resolves names against.
#[derive(Debug, Default)]
pub struct VirtualMachine {
    blocks: Vec<Block>,
    block_names: BTreeMap<CompactString, usize>,
    types: Vec<ProjectileType>,
    type_names: BTreeMap<CompactString, usize>,
    firing: Vec<FiringFunction>,
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers a projectile type and returns its index.
    pub fn register_type(&mut self, name: &str, sprite_index: i32, radius: f32) -> Result<usize, RegisterError> {
        if self.type_names.contains_key(name) {
            return Err(RegisterError::DuplicateType { name: name.into() });
        }
        let index = self.types.len();
        self.types.push(ProjectileType { name: name.into(), sprite_index, radius });
        self.type_names.insert(name.into(), index);
        Ok(index)
    }
    /// Registers a firing function for an already registered type. `params`
    /// name the properties its positional arguments initialize on the spawn.
    pub fn register_firing_function(&mut self, type_name: &str, name: &str, params: &[&str]) -> Result<usize, RegisterError> {
        let &type_index = self.type_names.get(type_name).ok_or(RegisterError::UnknownType { name: type_name.into() })?;
        if self.firing.iter().any(|f| f.type_index == type_index && f.name == name) {
            return Err(RegisterError::DuplicateFiringFunction { type_name: type_name.into(), name: name.into() });
        }
        let mut properties = Vec::with_capacity(params.len());
        for param in params {
            properties.push(Property::lookup(param).ok_or(RegisterError::UnknownProperty { name: (*param).into() })?);
        }
        let index = self.firing.len();
        self.firing.push(FiringFunction { type_index, name: name.into(), params: properties });
        Ok(index)
    }
    /// Compiles `script` and installs its blocks. On error nothing is
    /// installed — compilation is all or nothing per script unit.
    pub fn compile(&mut self, script: &ast::Script) -> Result<(), CompileError> {
        let compiled = bytecode::compile(script, self, self.blocks.len())?;
        for block in compiled {
            let index = self.blocks.len();
            self.block_names.insert(block.name.clone(), index);
            self.blocks.push(Block {
                name: block.name,
                kind: block.kind,
                params: block.params,
                locals: block.locals,
                code: block.code,
            });
        }
        Ok(())
    }
    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }
    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.block_names.get(name).copied()
    }
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
    pub fn projectile_type(&self, index: usize) -> Option<&ProjectileType> {
        self.types.get(index)
    }
    pub fn firing_function_record(&self, index: usize) -> Option<&FiringFunction> {
        self.firing.get(index)
    }
    /// Installs a hand-assembled block, bypassing the compiler. Tests use
    /// this to exercise machine faults the compiler can never emit.
    #[cfg(test)]
    pub(crate) fn install_block(&mut self, block: Block) -> usize {
        let index = self.blocks.len();
        self.block_names.insert(block.name.clone(), index);
        self.blocks.push(block);
        index
    }
}

impl Registry for VirtualMachine {
    fn property(&self, name: &str) -> Option<PropertyRecord> {
        Property::lookup(name).map(|p| PropertyRecord { name: p.name().into(), index: p as usize })
    }
    fn code_block(&self, name: &str) -> Option<BlockRef<'_>> {
        let &index = self.block_names.get(name)?;
        let block = &self.blocks[index];
        Some(BlockRef { index, kind: block.kind, params: &block.params })
    }
    fn firing_function(&self, type_name: &str, name: &str) -> Option<FiringRef<'_>> {
        let &type_index = self.type_names.get(type_name)?;
        self.firing
            .iter()
            .enumerate()
            .find(|(_, f)| f.type_index == type_index && f.name == name)
            .map(|(index, f)| FiringRef { type_index, index, params: &f.params })
    }
}
