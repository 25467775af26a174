//! Instruction set for function bodies.

use serde::{Deserialize, Serialize};

/// One instruction of the operand-stack machine.
///
/// Every value is an `i64`. Binary operators pop the right operand first,
/// then the left one, and push the result. Jump targets are instruction
/// indices within the same body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inst {
    /// Push a constant.
    Const(i64),
    /// Push the n-th argument of the current call.
    Arg(u32),
    /// Push the value of a global, by symbol name.
    Global(String),
    Add,
    Sub,
    Mul,
    /// Signed division. Division by zero traps.
    Div,
    /// Signed remainder. Division by zero traps.
    Rem,
    /// Push 1 if left < right, else 0.
    Lt,
    /// Push 1 if left == right, else 0.
    Eq,
    Dup,
    Pop,
    Jump(usize),
    /// Pop a value and jump if it is zero.
    JumpIfZero(usize),
    /// Pop `argc` arguments (last argument on top) and call `callee`.
    Call { callee: String, argc: u32 },
    /// Return the value on top of the stack.
    Ret,
}

impl Inst {
    /// Net stack effect as `(pops, pushes)`.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Inst::Const(_) | Inst::Arg(_) | Inst::Global(_) => (0, 1),
            Inst::Add | Inst::Sub | Inst::Mul | Inst::Div | Inst::Rem | Inst::Lt | Inst::Eq => {
                (2, 1)
            }
            Inst::Dup => (1, 2),
            Inst::Pop | Inst::JumpIfZero(_) | Inst::Ret => (1, 0),
            Inst::Jump(_) => (0, 0),
            Inst::Call { argc, .. } => (usize::try_from(*argc).unwrap_or(usize::MAX), 1),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jump(_) | Inst::Ret)
    }

    /// The branch target, if this instruction branches.
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Inst::Jump(target) | Inst::JumpIfZero(target) => Some(*target),
            _ => None,
        }
    }

    /// Mutable access to the branch target, if this instruction branches.
    pub fn jump_target_mut(&mut self) -> Option<&mut usize> {
        match self {
            Inst::Jump(target) | Inst::JumpIfZero(target) => Some(target),
            _ => None,
        }
    }

    /// Whether the instruction is a pure binary operator.
    pub fn is_binary_op(&self) -> bool {
        matches!(
            self,
            Inst::Add | Inst::Sub | Inst::Mul | Inst::Div | Inst::Rem | Inst::Lt | Inst::Eq
        )
    }

    /// Evaluate a binary operator on constants.
    ///
    /// Returns `None` for non-binary instructions and for operations that
    /// would trap at runtime (division by zero).
    pub fn eval_binary(&self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            Inst::Add => Some(lhs.wrapping_add(rhs)),
            Inst::Sub => Some(lhs.wrapping_sub(rhs)),
            Inst::Mul => Some(lhs.wrapping_mul(rhs)),
            Inst::Div if rhs != 0 => Some(lhs.wrapping_div(rhs)),
            Inst::Rem if rhs != 0 => Some(lhs.wrapping_rem(rhs)),
            Inst::Lt => Some(i64::from(lhs < rhs)),
            Inst::Eq => Some(i64::from(lhs == rhs)),
            _ => None,
        }
    }
}
