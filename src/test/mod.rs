use alloc::boxed::Box;
use alloc::vec::Vec;

use compact_str::CompactString;

use crate::ast::*;
use crate::bytecode::*;

mod engine;

/// The cell an opcode encodes to.
pub(crate) fn op(ins: Instruction) -> f32 {
    ins as u8 as f32
}

pub(crate) fn assert_cells(code: &CodeBlock, expected: &[f32]) {
    assert_eq!(code.cells(), expected, "bytecode shape mismatch");
}

pub(crate) fn num(value: f32) -> Expr {
    Expr::Number(value)
}

pub(crate) fn var(name: &str) -> Ident {
    Ident { kind: IdentKind::Variable, name: name.into() }
}

pub(crate) fn prop(name: &str) -> Ident {
    Ident { kind: IdentKind::Property, name: name.into() }
}

pub(crate) fn read(ident: Ident) -> Expr {
    Expr::Ident(ident)
}

pub(crate) fn bin(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

pub(crate) fn call(function: &str, args: Vec<Expr>) -> Expr {
    Expr::Call { function: function.into(), args }
}

pub(crate) fn assign(target: Ident, value: Expr) -> Stmt {
    Stmt::Assign { target, value }
}

pub(crate) fn wait(frames: Expr) -> Stmt {
    Stmt::Wait { frames }
}

pub(crate) fn ret(value: Expr) -> Stmt {
    Stmt::Return { value }
}

/// Registry stand-in with hand-populated tables, in place of a full
/// [`VirtualMachine`](crate::runtime::VirtualMachine).
#[derive(Default)]
pub(crate) struct TestRegistry {
    pub(crate) blocks: Vec<(CompactString, BlockKind, Vec<CompactString>)>,
    pub(crate) types: Vec<CompactString>,
    /// (type index, name, parameter properties)
    pub(crate) firing: Vec<(usize, CompactString, Vec<Property>)>,
}

impl TestRegistry {
    pub(crate) fn with_function(mut self, name: &str, params: &[&str]) -> Self {
        self.blocks.push((name.into(), BlockKind::Function, params.iter().map(|p| (*p).into()).collect()));
        self
    }
    pub(crate) fn with_action(mut self, name: &str, params: &[&str]) -> Self {
        self.blocks.push((name.into(), BlockKind::Action, params.iter().map(|p| (*p).into()).collect()));
        self
    }
    pub(crate) fn with_firing_function(mut self, type_name: &str, name: &str, params: &[Property]) -> Self {
        let type_index = match self.types.iter().position(|t| t.as_str() == type_name) {
            Some(index) => index,
            None => {
                self.types.push(type_name.into());
                self.types.len() - 1
            }
        };
        self.firing.push((type_index, name.into(), params.to_vec()));
        self
    }
}

impl Registry for TestRegistry {
    fn property(&self, name: &str) -> Option<PropertyRecord> {
        Property::lookup(name).map(|p| PropertyRecord { name: p.name().into(), index: p as usize })
    }
    fn code_block(&self, name: &str) -> Option<BlockRef<'_>> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.0 == name)
            .map(|(index, b)| BlockRef { index, kind: b.1, params: &b.2 })
    }
    fn firing_function(&self, type_name: &str, name: &str) -> Option<FiringRef<'_>> {
        let type_index = self.types.iter().position(|t| t.as_str() == type_name)?;
        self.firing
            .iter()
            .enumerate()
            .find(|(_, f)| f.0 == type_index && f.1 == name)
            .map(|(index, f)| FiringRef { type_index, index, params: &f.2 })
    }
}
