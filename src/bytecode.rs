//! Tools for generating executable bytecode from a script's syntax tree.
//!
//! Compiled code lives in [`CodeBlock`] buffers: flat sequences of `f32`
//! cells holding opcodes and operands interleaved. Forward branch targets are
//! emitted as placeholder cells and patched in place once the dependent code
//! has been generated and its final size is known.
//!
//! To compile a whole script, use [`compile`] (or
//! [`VirtualMachine::compile`](crate::runtime::VirtualMachine::compile),
//! which also installs the result).

use alloc::vec::Vec;
use alloc::collections::BTreeMap;

#[cfg(feature = "std")]
use std::io::{self, Write};

use compact_str::CompactString;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::ast;

/// A single opcode of the bullet-script virtual machine.
///
/// Operands are encoded as cells immediately following the opcode cell in the
/// same [`CodeBlock`]; the operand count is fixed per opcode (see
/// [`Instruction::operand_count`]). Branch operands always hold absolute cell
/// indices within the enclosing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    /// Pushes its operand cell onto the value stack.
    Push,
    /// Discards the top of the value stack.
    Pop,
    /// Replaces the top of the value stack with its arithmetic negation.
    Negate,
    /// Pops two values, pushes their sum.
    OperatorAdd,
    /// Pops two values, pushes their difference.
    OperatorSubtract,
    /// Pops two values, pushes their product.
    OperatorMultiply,
    /// Pops two values, pushes their quotient.
    OperatorDivide,
    /// Pops two values, pushes the remainder of their division.
    OperatorMod,
    /// Pops two values, pushes `1` if the first is less than the second, else `0`.
    OperatorLessThan,
    OperatorLessThanEqual,
    OperatorGreaterThan,
    OperatorGreaterThanEqual,
    OperatorEqual,
    OperatorNotEqual,
    /// Pops two values, pushes `1` if both are nonzero, else `0`. Both
    /// operands are always evaluated; there is no short circuit.
    OperatorAnd,
    /// Pops two values, pushes `1` if either is nonzero, else `0`.
    OperatorOr,
    /// Pops one value, pushes `1` if it is zero, else `0`.
    OperatorNot,
    /// Unconditionally transfers control to the cell index in its operand.
    Jump,
    /// Pops one value and transfers control to its operand's cell index when
    /// that value is zero.
    IfZeroBranch,
    /// Pushes the local variable slot named by its operand.
    GetVariable,
    /// Pops the stack top into the local variable slot named by its operand.
    SetVariable,
    /// Pushes the entity property named by its operand.
    GetProperty,
    /// Pops the stack top into the entity property named by its operand.
    SetProperty,
    /// Pops the target's declared argument count into a fresh call frame and
    /// transfers control to the block named by its operand; the frame's
    /// result is pushed when it completes.
    FunctionCall,
    /// Spawns a projectile. Operands: projectile type index, firing function
    /// index, argument count. The arguments are popped from the stack.
    Fire,
    /// Like [`Instruction::Fire`] with an updater bound to the spawned
    /// projectile. Two extra operands: updater block index and its argument
    /// count. Updater arguments are pushed after (and therefore popped
    /// before) the firing arguments.
    FireWithUpdater,
    /// Pops a frame delay from the value stack and suspends the running
    /// routine in place, yielding the delay to the scheduler.
    WaitFrames,
}

impl Instruction {
    /// Number of operand cells following the opcode cell.
    pub fn operand_count(self) -> usize {
        match self {
            Instruction::Push
            | Instruction::Jump
            | Instruction::IfZeroBranch
            | Instruction::GetVariable
            | Instruction::SetVariable
            | Instruction::GetProperty
            | Instruction::SetProperty
            | Instruction::FunctionCall => 1,
            Instruction::Fire => 3,
            Instruction::FireWithUpdater => 5,
            _ => 0,
        }
    }
    /// Decodes an opcode cell, rejecting cells that do not exactly encode an
    /// opcode (negative, fractional, or out of range).
    pub fn decode(cell: f32) -> Option<Self> {
        if cell as u8 as f32 != cell {
            return None;
        }
        Self::from_u8(cell as u8)
    }
}

/// A named entity property addressable from scripts via `$`-identifiers.
///
/// The discriminant doubles as the property's registry index; which
/// properties an entity actually carries is decided at runtime by its
/// [`PropertyContext`](crate::runtime::PropertyContext) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Property {
    Angle,
    Speed,
    Radius,
    OrbitDistance,
    OffsetX,
    OffsetY,
    FramesAlive,
}

impl Property {
    /// Resolves a canonical (sigil-stripped) property name.
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "angle" => Property::Angle,
            "speed" => Property::Speed,
            "radius" => Property::Radius,
            "orbitDistance" => Property::OrbitDistance,
            "offsetX" => Property::OffsetX,
            "offsetY" => Property::OffsetY,
            "framesAlive" => Property::FramesAlive,
            _ => return None,
        })
    }
    pub fn name(self) -> &'static str {
        match self {
            Property::Angle => "angle",
            Property::Speed => "speed",
            Property::Radius => "radius",
            Property::OrbitDistance => "orbitDistance",
            Property::OffsetX => "offsetX",
            Property::OffsetY => "offsetY",
            Property::FramesAlive => "framesAlive",
        }
    }
    /// Decodes a property operand cell.
    pub fn decode(cell: f32) -> Option<Self> {
        if cell as u8 as f32 != cell {
            return None;
        }
        Self::from_u8(cell as u8)
    }
}

/// A growable buffer of bytecode cells supporting append and in-place patch.
///
/// A block is owned by the construct currently generating into it and handed
/// to its parent wholesale via [`CodeBlock::append`]. Blocks only grow until
/// a unit is finalized, so a recorded patch index stays valid for the rest of
/// that unit's generation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodeBlock {
    code: Vec<f32>,
}

impl CodeBlock {
    pub fn new() -> Self {
        Self::default()
    }
    /// Current cell count.
    pub fn size(&self) -> usize {
        self.code.len()
    }
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
    /// Appends an opcode cell.
    pub fn add(&mut self, ins: Instruction) {
        self.code.push(ins as u8 as f32);
    }
    /// Appends a raw operand cell.
    pub fn add_cell(&mut self, cell: f32) {
        self.code.push(cell);
    }
    /// Appends an operand cell holding a cell or table index.
    pub fn add_index(&mut self, index: usize) {
        self.code.push(index as f32);
    }
    /// Takes ownership of `other`'s cells by concatenation.
    pub fn append(&mut self, other: CodeBlock) {
        self.code.extend(other.code);
    }
    /// Overwrites a previously appended cell. `index` must refer to an
    /// existing cell.
    pub fn patch(&mut self, index: usize, cell: f32) {
        self.code[index] = cell;
    }
    /// Overwrites a previously appended cell with a cell index.
    pub fn patch_index(&mut self, index: usize, target: usize) {
        self.code[index] = target as f32;
    }
    pub fn cells(&self) -> &[f32] {
        &self.code
    }
    /// Writes a human-readable listing of the block, one instruction per line.
    #[cfg(feature = "std")]
    pub fn dump(&self, f: &mut dyn Write) -> io::Result<()> {
        let mut pos = 0;
        while pos < self.code.len() {
            let cell = self.code[pos];
            match Instruction::decode(cell) {
                Some(ins) => {
                    write!(f, "{pos:>6}  {ins:?}")?;
                    for i in 0..ins.operand_count() {
                        match self.code.get(pos + 1 + i) {
                            Some(operand) => write!(f, " {operand}")?,
                            None => write!(f, " <missing>")?,
                        }
                    }
                    writeln!(f)?;
                    pos += 1 + ins.operand_count();
                }
                None => {
                    writeln!(f, "{pos:>6}  <raw {cell}>")?;
                    pos += 1;
                }
            }
        }
        Ok(())
    }
}

/// The kind of a declared symbol. Kinds are disjoint namespaces with their
/// own slot sequences; a symbol of one kind can never be used as the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Numeric,
    Emitter,
}

/// A name bound in a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: CompactString,
    pub index: usize,
    pub kind: SymbolKind,
}

/// Per-unit mapping from identifier to slot index and kind. Slot indices are
/// assigned monotonically per kind and never reused within the scope.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: BTreeMap<CompactString, Symbol>,
    counts: [usize; 2],
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Binds `name` in this scope and returns its slot index. Fails if the
    /// name is already bound here, whatever its kind.
    pub fn add_symbol(&mut self, name: &str, kind: SymbolKind) -> Result<usize, CompileError> {
        if self.symbols.contains_key(name) {
            return Err(CompileError::DuplicateSymbol { name: name.into() });
        }
        let index = self.counts[kind as usize];
        self.counts[kind as usize] += 1;
        self.symbols.insert(name.into(), Symbol { name: name.into(), index, kind });
        Ok(index)
    }
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }
    /// Number of numeric slots a frame running this scope's code needs.
    pub fn num_slots(&self) -> usize {
        self.counts[SymbolKind::Numeric as usize]
    }
}

/// Stack of lexical scopes for the unit currently being compiled.
///
/// Construct codegen only ever reads the current scope; pushing and popping
/// around unit visits is the compiler driver's responsibility. There is
/// always at least a root scope.
#[derive(Debug)]
pub struct ScopeManager {
    scopes: Vec<SymbolTable>,
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager { scopes: alloc::vec![SymbolTable::new()] }
    }
    pub fn push_scope(&mut self) {
        self.scopes.push(SymbolTable::new());
    }
    pub fn pop_scope(&mut self) -> SymbolTable {
        debug_assert!(self.scopes.len() > 1);
        self.scopes.pop().unwrap()
    }
    pub fn current_scope(&self) -> &SymbolTable {
        self.scopes.last().unwrap()
    }
    pub fn current_scope_mut(&mut self) -> &mut SymbolTable {
        self.scopes.last_mut().unwrap()
    }
}

/// An error encountered while lowering a script to bytecode.
///
/// Any of these aborts compilation of the whole script unit immediately; no
/// partial bytecode is ever installed for a unit that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A plain identifier is not bound in the current scope.
    UnknownIdentifier { name: CompactString },
    /// A `$`-identifier does not name a registered property.
    UnknownProperty { name: CompactString },
    /// A call names a block that is not a registered function.
    UnknownFunction { name: CompactString },
    /// A fire clause names a block that is not a registered bullet action.
    UnknownUpdater { name: CompactString },
    /// A fire statement names a type/function pair the registry does not know.
    UnknownFiringFunction { type_name: CompactString, name: CompactString },
    /// A declaration rebinds a name already bound in the current scope.
    DuplicateSymbol { name: CompactString },
    /// Two declarations in the same machine share a name.
    DuplicateBlock { name: CompactString },
    /// An emitter-kind symbol was used where a numeric value is required.
    WrongKind { name: CompactString },
    /// A call passes a different number of arguments than the target declares.
    ArityMismatch { name: CompactString, expected: usize, got: usize },
    BreakOutsideLoop,
    ContinueOutsideLoop,
}

/// A property record resolved from the VM-side registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRecord {
    pub name: CompactString,
    pub index: usize,
}

/// What a compiled block is for. The kind decides where a block may be
/// referenced from: functions from call expressions, actions from fire
/// clauses, emitter updaters from controller builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Function,
    Action,
    EmitterUpdater,
}

/// Compile-time view of a registered code block.
#[derive(Debug, Clone, Copy)]
pub struct BlockRef<'a> {
    pub index: usize,
    pub kind: BlockKind,
    pub params: &'a [CompactString],
}

/// Compile-time view of a registered firing function.
#[derive(Debug, Clone, Copy)]
pub struct FiringRef<'a> {
    pub type_index: usize,
    pub index: usize,
    pub params: &'a [Property],
}

/// Name-resolution services the code generator consumes. Implemented by
/// [`VirtualMachine`](crate::runtime::VirtualMachine); lookup failures become
/// compile errors at the querying construct.
pub trait Registry {
    fn property(&self, name: &str) -> Option<PropertyRecord>;
    fn code_block(&self, name: &str) -> Option<BlockRef<'_>>;
    fn firing_function(&self, type_name: &str, name: &str) -> Option<FiringRef<'_>>;
}

/// A compiled unit ready to be installed into the machine.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    pub name: CompactString,
    pub kind: BlockKind,
    pub params: Vec<CompactString>,
    /// Numeric local slots a frame for this block needs (parameters included).
    pub locals: usize,
    pub code: CodeBlock,
}

/// Registry view that layers the blocks currently being compiled over the
/// base registry, so declarations can reference each other in any order.
struct StagedRegistry<'a, R: Registry + ?Sized> {
    base: &'a R,
    staged: &'a [CompiledBlock],
    base_index: usize,
}

impl<R: Registry + ?Sized> Registry for StagedRegistry<'_, R> {
    fn property(&self, name: &str) -> Option<PropertyRecord> {
        self.base.property(name)
    }
    fn code_block(&self, name: &str) -> Option<BlockRef<'_>> {
        for (i, block) in self.staged.iter().enumerate() {
            if block.name == name {
                return Some(BlockRef { index: self.base_index + i, kind: block.kind, params: &block.params });
            }
        }
        self.base.code_block(name)
    }
    fn firing_function(&self, type_name: &str, name: &str) -> Option<FiringRef<'_>> {
        self.base.firing_function(type_name, name)
    }
}

/// Compiles every declaration of `script` against `registry`.
///
/// `base_index` is the block-table index the first compiled unit will be
/// installed at; call indices are encoded against it. Declarations are
/// compiled in two passes (records first, then bodies) so forward and mutual
/// references resolve. Returns the compiled blocks in declaration order, or
/// the first error with nothing partially built.
pub fn compile<R: Registry + ?Sized>(script: &ast::Script, registry: &R, base_index: usize) -> Result<Vec<CompiledBlock>, CompileError> {
    let mut staged: Vec<CompiledBlock> = Vec::with_capacity(script.items.len());
    for item in &script.items {
        let (kind, params) = match item {
            ast::Item::Function { params, .. } => (BlockKind::Function, params),
            ast::Item::Action { params, .. } => (BlockKind::Action, params),
            ast::Item::EmitterUpdater { params, .. } => (BlockKind::EmitterUpdater, params),
        };
        let name = item.name();
        if staged.iter().any(|b| b.name == name) || registry.code_block(name).is_some() {
            return Err(CompileError::DuplicateBlock { name: name.into() });
        }
        staged.push(CompiledBlock {
            name: name.into(),
            kind,
            params: params.clone(),
            locals: 0,
            code: CodeBlock::new(),
        });
    }

    let mut scopes = ScopeManager::new();
    for (i, item) in script.items.iter().enumerate() {
        let (params, body) = match item {
            ast::Item::Function { params, body, .. }
            | ast::Item::Action { params, body, .. }
            | ast::Item::EmitterUpdater { params, body, .. } => (params, body),
        };

        scopes.push_scope();
        let unit = (|| -> Result<CodeBlock, CompileError> {
            for param in params {
                scopes.current_scope_mut().add_symbol(param, SymbolKind::Numeric)?;
            }
            let staged_registry = StagedRegistry { base: registry, staged: &staged, base_index };
            let mut gen = CodeGen::new(&staged_registry, &mut scopes);
            let mut code = CodeBlock::new();
            for stmt in body {
                gen.emit_stmt(stmt, &mut code)?;
            }
            // every return placeholder jumps to the end of the finished unit
            for hole in gen.return_holes {
                code.patch_index(hole, code.size());
            }
            Ok(code)
        })();
        let scope = scopes.pop_scope();
        let code = unit?;
        staged[i].locals = scope.num_slots();
        staged[i].code = code;
    }
    Ok(staged)
}

/// Strips the `$` marker off a property identifier.
fn canonical_property_name(name: &str) -> &str {
    name.strip_prefix('$').unwrap_or(name)
}

fn binary_op_instruction(op: ast::BinaryOp) -> Instruction {
    match op {
        ast::BinaryOp::Multiply => Instruction::OperatorMultiply,
        ast::BinaryOp::Divide => Instruction::OperatorDivide,
        ast::BinaryOp::Mod => Instruction::OperatorMod,
        ast::BinaryOp::Add => Instruction::OperatorAdd,
        ast::BinaryOp::Subtract => Instruction::OperatorSubtract,
        ast::BinaryOp::LessThan => Instruction::OperatorLessThan,
        ast::BinaryOp::GreaterThan => Instruction::OperatorGreaterThan,
        ast::BinaryOp::LessThanEqual => Instruction::OperatorLessThanEqual,
        ast::BinaryOp::GreaterThanEqual => Instruction::OperatorGreaterThanEqual,
        ast::BinaryOp::Equal => Instruction::OperatorEqual,
        ast::BinaryOp::NotEqual => Instruction::OperatorNotEqual,
        ast::BinaryOp::And => Instruction::OperatorAnd,
        ast::BinaryOp::Or => Instruction::OperatorOr,
    }
}

/// Patch lists of the innermost loop being generated: cell indices of the
/// placeholder operands its `break`s and `continue`s left behind.
#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// One compilation's generator state. A fresh value is created per compiled
/// unit, so loop bookkeeping can never leak between compilations.
struct CodeGen<'a, R: Registry + ?Sized> {
    registry: &'a R,
    scopes: &'a mut ScopeManager,
    loops: Vec<LoopContext>,
    return_holes: Vec<usize>,
}

impl<'a, R: Registry + ?Sized> CodeGen<'a, R> {
    fn new(registry: &'a R, scopes: &'a mut ScopeManager) -> Self {
        CodeGen { registry, scopes, loops: Vec::new(), return_holes: Vec::new() }
    }

    /// Resolves an identifier to its read/write opcode pair and operand.
    fn resolve_ident(&self, ident: &ast::Ident) -> Result<(Instruction, Instruction, usize), CompileError> {
        match ident.kind {
            ast::IdentKind::Property => {
                let name = canonical_property_name(&ident.name);
                let record = self
                    .registry
                    .property(name)
                    .ok_or(CompileError::UnknownProperty { name: name.into() })?;
                Ok((Instruction::GetProperty, Instruction::SetProperty, record.index))
            }
            ast::IdentKind::Variable => {
                let symbol = self
                    .scopes
                    .current_scope()
                    .lookup(&ident.name)
                    .ok_or(CompileError::UnknownIdentifier { name: ident.name.clone() })?;
                if symbol.kind != SymbolKind::Numeric {
                    return Err(CompileError::WrongKind { name: ident.name.clone() });
                }
                Ok((Instruction::GetVariable, Instruction::SetVariable, symbol.index))
            }
        }
    }

    fn emit_expr(&mut self, expr: &ast::Expr, code: &mut CodeBlock) -> Result<(), CompileError> {
        match expr {
            ast::Expr::Number(value) => {
                code.add(Instruction::Push);
                code.add_cell(*value);
            }
            ast::Expr::Ident(ident) => {
                let (get, _, index) = self.resolve_ident(ident)?;
                code.add(get);
                code.add_index(index);
            }
            ast::Expr::Unary { op, value } => {
                self.emit_expr(value, code)?;
                code.add(match op {
                    ast::UnaryOp::Not => Instruction::OperatorNot,
                    ast::UnaryOp::Negate => Instruction::Negate,
                });
            }
            ast::Expr::Binary { op, left, right } => {
                self.emit_expr(left, code)?;
                self.emit_expr(right, code)?;
                code.add(binary_op_instruction(*op));
            }
            ast::Expr::Ternary { condition, then, otherwise } => {
                self.emit_expr(condition, code)?;
                code.add(Instruction::IfZeroBranch);
                let test_hole = code.size();
                code.add_index(0);
                self.emit_expr(then, code)?;
                code.patch_index(test_hole, code.size() + 2); // skip the jump about to be appended
                code.add(Instruction::Jump);
                let aft_hole = code.size();
                code.add_index(0);
                self.emit_expr(otherwise, code)?;
                code.patch_index(aft_hole, code.size());
            }
            ast::Expr::Call { function, args } => {
                let registry = self.registry;
                let block = registry
                    .code_block(function)
                    .filter(|b| b.kind == BlockKind::Function)
                    .ok_or(CompileError::UnknownFunction { name: function.clone() })?;
                if args.len() != block.params.len() {
                    return Err(CompileError::ArityMismatch {
                        name: function.clone(),
                        expected: block.params.len(),
                        got: args.len(),
                    });
                }
                let index = block.index;
                for arg in args {
                    self.emit_expr(arg, code)?;
                }
                code.add(Instruction::FunctionCall);
                code.add_index(index);
            }
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &ast::Stmt, code: &mut CodeBlock) -> Result<(), CompileError> {
        match stmt {
            ast::Stmt::Expr { value } => {
                self.emit_expr(value, code)?;
                code.add(Instruction::Pop);
            }
            ast::Stmt::VarDecl { name, value } => {
                let index = self.scopes.current_scope_mut().add_symbol(name, SymbolKind::Numeric)?;
                self.emit_expr(value, code)?;
                code.add(Instruction::SetVariable);
                code.add_index(index);
            }
            ast::Stmt::Assign { target, value } => {
                let (_, set, index) = self.resolve_ident(target)?;
                self.emit_expr(value, code)?;
                code.add(set);
                code.add_index(index);
            }
            ast::Stmt::CompoundAssign { target, op, value } => {
                let (get, set, index) = self.resolve_ident(target)?;
                code.add(get);
                code.add_index(index);
                self.emit_expr(value, code)?;
                code.add(binary_op_instruction(*op));
                code.add(set);
                code.add_index(index);
            }
            ast::Stmt::PostIncrement { target } => self.emit_post_inc_dec(target, Instruction::OperatorAdd, code)?,
            ast::Stmt::PostDecrement { target } => self.emit_post_inc_dec(target, Instruction::OperatorSubtract, code)?,
            ast::Stmt::Block { body } => {
                for stmt in body {
                    self.emit_stmt(stmt, code)?;
                }
            }
            ast::Stmt::If { condition, then, otherwise } => {
                self.emit_expr(condition, code)?;
                code.add(Instruction::IfZeroBranch);
                let test_hole = code.size();
                code.add_index(0);
                self.emit_stmt(then, code)?;
                match otherwise {
                    None => code.patch_index(test_hole, code.size()),
                    Some(otherwise) => {
                        code.patch_index(test_hole, code.size() + 2); // skip the jump about to be appended
                        code.add(Instruction::Jump);
                        let aft_hole = code.size();
                        code.add_index(0);
                        self.emit_stmt(otherwise, code)?;
                        code.patch_index(aft_hole, code.size());
                    }
                }
            }
            ast::Stmt::While { condition, body } => {
                self.loops.push(LoopContext::default());
                let top = code.size();
                self.emit_expr(condition, code)?;
                code.add(Instruction::IfZeroBranch);
                let exit_hole = code.size();
                code.add_index(0);
                self.emit_stmt(body, code)?;
                code.add(Instruction::Jump);
                code.add_index(top);
                let aft = code.size();
                code.patch_index(exit_hole, aft);
                let ctx = self.loops.pop().unwrap();
                for hole in ctx.continues {
                    code.patch_index(hole, top);
                }
                for hole in ctx.breaks {
                    code.patch_index(hole, aft);
                }
            }
            ast::Stmt::For { init, condition, update, body } => {
                if let Some(init) = init {
                    self.emit_stmt(init, code)?;
                }
                self.loops.push(LoopContext::default());
                let top = code.size();
                let exit_hole = match condition {
                    Some(condition) => {
                        self.emit_expr(condition, code)?;
                        code.add(Instruction::IfZeroBranch);
                        let hole = code.size();
                        code.add_index(0);
                        Some(hole)
                    }
                    None => None,
                };
                self.emit_stmt(body, code)?;
                let update_pos = code.size();
                for stmt in update {
                    self.emit_stmt(stmt, code)?;
                }
                code.add(Instruction::Jump);
                code.add_index(top);
                let aft = code.size();
                if let Some(hole) = exit_hole {
                    code.patch_index(hole, aft);
                }
                let ctx = self.loops.pop().unwrap();
                for hole in ctx.continues {
                    code.patch_index(hole, update_pos);
                }
                for hole in ctx.breaks {
                    code.patch_index(hole, aft);
                }
            }
            ast::Stmt::Break => {
                if self.loops.is_empty() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                code.add(Instruction::Jump);
                let hole = code.size();
                code.add_index(0);
                self.loops.last_mut().unwrap().breaks.push(hole);
            }
            ast::Stmt::Continue => {
                if self.loops.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop);
                }
                code.add(Instruction::Jump);
                let hole = code.size();
                code.add_index(0);
                self.loops.last_mut().unwrap().continues.push(hole);
            }
            ast::Stmt::Return { value } => {
                self.emit_expr(value, code)?;
                code.add(Instruction::Jump);
                let hole = code.size();
                code.add_index(0);
                self.return_holes.push(hole);
            }
            ast::Stmt::Wait { frames } => {
                self.emit_expr(frames, code)?;
                code.add(Instruction::WaitFrames);
            }
            ast::Stmt::Fire { type_name, function, args, updater } => {
                let registry = self.registry;
                let firing = registry
                    .firing_function(type_name, function)
                    .ok_or(CompileError::UnknownFiringFunction { type_name: type_name.clone(), name: function.clone() })?;
                if args.len() != firing.params.len() {
                    return Err(CompileError::ArityMismatch {
                        name: function.clone(),
                        expected: firing.params.len(),
                        got: args.len(),
                    });
                }
                let (type_index, firing_index) = (firing.type_index, firing.index);
                let updater_target = match updater {
                    Some(call) => {
                        let block = registry
                            .code_block(&call.name)
                            .filter(|b| b.kind == BlockKind::Action)
                            .ok_or(CompileError::UnknownUpdater { name: call.name.clone() })?;
                        if call.args.len() != block.params.len() {
                            return Err(CompileError::ArityMismatch {
                                name: call.name.clone(),
                                expected: block.params.len(),
                                got: call.args.len(),
                            });
                        }
                        Some(block.index)
                    }
                    None => None,
                };
                for arg in args {
                    self.emit_expr(arg, code)?;
                }
                match updater {
                    None => {
                        code.add(Instruction::Fire);
                        code.add_index(type_index);
                        code.add_index(firing_index);
                        code.add_index(args.len());
                    }
                    Some(call) => {
                        for arg in &call.args {
                            self.emit_expr(arg, code)?;
                        }
                        code.add(Instruction::FireWithUpdater);
                        code.add_index(type_index);
                        code.add_index(firing_index);
                        code.add_index(args.len());
                        code.add_index(updater_target.unwrap());
                        code.add_index(call.args.len());
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_post_inc_dec(&mut self, target: &ast::Ident, op: Instruction, code: &mut CodeBlock) -> Result<(), CompileError> {
        let (get, set, index) = self.resolve_ident(target)?;
        code.add(get);
        code.add_index(index);
        code.add(Instruction::Push);
        code.add_cell(1.0);
        code.add(op);
        code.add(set);
        code.add_index(index);
        Ok(())
    }
}

/// Generates a lone expression into a fresh block, for shape tests.
#[cfg(test)]
pub(crate) fn generate_expression<R: Registry + ?Sized>(
    expr: &ast::Expr,
    registry: &R,
    scopes: &mut ScopeManager,
) -> Result<CodeBlock, CompileError> {
    let mut gen = CodeGen::new(registry, scopes);
    let mut code = CodeBlock::new();
    gen.emit_expr(expr, &mut code)?;
    Ok(code)
}

/// Generates a lone statement into a fresh block, for shape tests.
#[cfg(test)]
pub(crate) fn generate_statement<R: Registry + ?Sized>(
    stmt: &ast::Stmt,
    registry: &R,
    scopes: &mut ScopeManager,
) -> Result<CodeBlock, CompileError> {
    let mut gen = CodeGen::new(registry, scopes);
    let mut code = CodeBlock::new();
    gen.emit_stmt(stmt, &mut code)?;
    Ok(code)
}
