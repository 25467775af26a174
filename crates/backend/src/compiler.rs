//! Verification and lowering of IR modules.
//!
//! Each body is checked by abstract interpretation of the stack depth:
//! every path must keep a consistent depth at merge points, never pop an
//! empty stack, stay inside the body and end in `ret`. Verified bodies are
//! lowered to [`Op`]s whose external references point into a per-module
//! import table that the loader binds once.

use lazyjit_core::JitError;
use lazyjit_ir::{Function, Inst, Module};
use rustc_hash::{FxHashMap, FxHashSet};

/// Binary operators after lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Eq,
}

impl BinOp {
    /// `None` when the operation traps.
    pub fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            BinOp::Add => Some(lhs.wrapping_add(rhs)),
            BinOp::Sub => Some(lhs.wrapping_sub(rhs)),
            BinOp::Mul => Some(lhs.wrapping_mul(rhs)),
            BinOp::Div if rhs != 0 => Some(lhs.wrapping_div(rhs)),
            BinOp::Rem if rhs != 0 => Some(lhs.wrapping_rem(rhs)),
            BinOp::Div | BinOp::Rem => None,
            BinOp::Lt => Some(i64::from(lhs < rhs)),
            BinOp::Eq => Some(i64::from(lhs == rhs)),
        }
    }
}

/// Lowered instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Const(i64),
    Arg(usize),
    /// Push the data value bound to an import slot.
    Load(usize),
    Binary(BinOp),
    Dup,
    Pop,
    Jump(usize),
    JumpIfZero(usize),
    /// Call the function bound to an import slot.
    Call { slot: usize, argc: usize },
    Ret,
}

/// What an import slot must be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Function { argc: u32 },
    Data,
}

/// One external reference of a compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub kind: ImportKind,
}

/// A verified, lowered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub name: String,
    pub params: u32,
    pub ops: Vec<Op>,
    /// Deepest operand stack any path reaches.
    pub max_stack: usize,
}

/// Payload produced by compiling one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub name: String,
    pub functions: Vec<CompiledFunction>,
    pub imports: Vec<Import>,
}

#[derive(Default)]
struct ImportTable {
    slots: FxHashMap<String, usize>,
    imports: Vec<Import>,
}

impl ImportTable {
    fn slot(&mut self, name: &str, kind: ImportKind) -> Result<usize, String> {
        if let Some(&slot) = self.slots.get(name) {
            let existing = self.imports.get(slot).map(|import| import.kind);
            if existing != Some(kind) {
                return Err(format!("`{name}` is referenced inconsistently"));
            }
            return Ok(slot);
        }
        let slot = self.imports.len();
        self.imports.push(Import {
            name: name.to_owned(),
            kind,
        });
        self.slots.insert(name.to_owned(), slot);
        Ok(slot)
    }
}

/// Verify and lower every defined function of `module`.
pub fn compile_module(module: &Module) -> Result<CompiledModule, JitError> {
    let mut imports = ImportTable::default();
    let mut seen = FxHashSet::default();
    let mut functions = Vec::new();
    for function in module.defined_functions() {
        if !seen.insert(function.name.as_str()) {
            return Err(JitError::compilation_failed(
                &module.name,
                format!("function `{}` is defined twice", function.name),
            ));
        }
        let compiled = lower_function(function, &mut imports).map_err(|reason| {
            JitError::compilation_failed(&module.name, format!("function `{}`: {reason}", function.name))
        })?;
        functions.push(compiled);
    }
    Ok(CompiledModule {
        name: module.name.clone(),
        functions,
        imports: imports.imports,
    })
}

fn lower_function(function: &Function, imports: &mut ImportTable) -> Result<CompiledFunction, String> {
    let body = function.body.as_deref().unwrap_or_default();
    if body.is_empty() {
        return Err("empty body".to_owned());
    }
    let max_stack = verify_stack(function.params, body)?;
    let ops = body
        .iter()
        .map(|inst| lower_inst(inst, imports))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledFunction {
        name: function.name.clone(),
        params: function.params,
        ops,
        max_stack,
    })
}

/// Returns the maximum stack depth.
fn verify_stack(params: u32, body: &[Inst]) -> Result<usize, String> {
    let mut depth_at: Vec<Option<usize>> = vec![None; body.len()];
    let mut worklist = vec![(0_usize, 0_usize)];
    let mut max_depth = 0;

    while let Some((pc, depth)) = worklist.pop() {
        let (Some(slot), Some(inst)) = (depth_at.get_mut(pc), body.get(pc)) else {
            return Err(format!("control falls off the end at {pc}"));
        };
        match *slot {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(format!("stack depth {depth} at {pc} conflicts with {known}"));
            }
            None => *slot = Some(depth),
        }

        if let Inst::Arg(index) = inst
            && *index >= params
        {
            return Err(format!("argument {index} out of range at {pc}"));
        }
        if let Some(target) = inst.jump_target()
            && target >= body.len()
        {
            return Err(format!("jump target {target} out of range at {pc}"));
        }

        let (pops, pushes) = inst.stack_effect();
        let next_depth = depth
            .checked_sub(pops)
            .ok_or_else(|| format!("stack underflow at {pc}"))?
            .saturating_add(pushes);
        max_depth = max_depth.max(depth).max(next_depth);

        match inst {
            Inst::Ret => {}
            Inst::Jump(target) => worklist.push((*target, next_depth)),
            Inst::JumpIfZero(target) => {
                worklist.push((*target, next_depth));
                worklist.push((pc.saturating_add(1), next_depth));
            }
            _ => worklist.push((pc.saturating_add(1), next_depth)),
        }
    }
    Ok(max_depth)
}

fn lower_inst(inst: &Inst, imports: &mut ImportTable) -> Result<Op, String> {
    Ok(match inst {
        Inst::Const(value) => Op::Const(*value),
        Inst::Arg(index) => Op::Arg(usize::try_from(*index).unwrap_or(usize::MAX)),
        Inst::Global(name) => Op::Load(imports.slot(name, ImportKind::Data)?),
        Inst::Add => Op::Binary(BinOp::Add),
        Inst::Sub => Op::Binary(BinOp::Sub),
        Inst::Mul => Op::Binary(BinOp::Mul),
        Inst::Div => Op::Binary(BinOp::Div),
        Inst::Rem => Op::Binary(BinOp::Rem),
        Inst::Lt => Op::Binary(BinOp::Lt),
        Inst::Eq => Op::Binary(BinOp::Eq),
        Inst::Dup => Op::Dup,
        Inst::Pop => Op::Pop,
        Inst::Jump(target) => Op::Jump(*target),
        Inst::JumpIfZero(target) => Op::JumpIfZero(*target),
        Inst::Call { callee, argc } => Op::Call {
            slot: imports.slot(callee, ImportKind::Function { argc: *argc })?,
            argc: usize::try_from(*argc).unwrap_or(usize::MAX),
        },
        Inst::Ret => Op::Ret,
    })
}
