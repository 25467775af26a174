//! Execution of lowered functions.

use std::cell::Cell;
use std::sync::Arc;

use lazyjit_core::{JitError, LinkTarget, NativeFunction};

use crate::compiler::{CompiledFunction, Op};

/// Nested calls allowed per thread before execution traps.
pub const MAX_CALL_DEPTH: usize = 512;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter(function: &str) -> Result<Self, JitError> {
        CALL_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_CALL_DEPTH {
                return Err(JitError::trap(function, "call depth limit exceeded"));
            }
            depth.set(current.saturating_add(1));
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// A loaded function: lowered code plus the targets its imports were bound
/// to at load time.
pub struct ReferenceFunction {
    code: CompiledFunction,
    links: Arc<[LinkTarget]>,
}

impl ReferenceFunction {
    pub(crate) fn new(code: CompiledFunction, links: Arc<[LinkTarget]>) -> Self {
        Self { code, links }
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    fn trap(&self, reason: impl Into<String>) -> JitError {
        JitError::trap(&self.code.name, reason)
    }

    fn pop(&self, stack: &mut Vec<i64>) -> Result<i64, JitError> {
        stack.pop().ok_or_else(|| self.trap("stack underflow"))
    }

    fn run(&self, args: &[i64]) -> Result<i64, JitError> {
        let mut stack: Vec<i64> = Vec::with_capacity(self.code.max_stack);
        let mut pc = 0_usize;
        loop {
            let op = *self
                .code
                .ops
                .get(pc)
                .ok_or_else(|| self.trap(format!("pc {pc} out of range")))?;
            pc = pc.saturating_add(1);
            match op {
                Op::Const(value) => stack.push(value),
                Op::Arg(index) => {
                    let value = args
                        .get(index)
                        .copied()
                        .ok_or_else(|| self.trap(format!("missing argument {index}")))?;
                    stack.push(value);
                }
                Op::Load(slot) => match self.links.get(slot) {
                    Some(LinkTarget::Data(value)) => stack.push(*value),
                    _ => return Err(self.trap(format!("import {slot} is not data"))),
                },
                Op::Binary(operator) => {
                    let rhs = self.pop(&mut stack)?;
                    let lhs = self.pop(&mut stack)?;
                    let result = operator
                        .apply(lhs, rhs)
                        .ok_or_else(|| self.trap("division by zero"))?;
                    stack.push(result);
                }
                Op::Dup => {
                    let top = self.pop(&mut stack)?;
                    stack.push(top);
                    stack.push(top);
                }
                Op::Pop => {
                    self.pop(&mut stack)?;
                }
                Op::Jump(target) => pc = target,
                Op::JumpIfZero(target) => {
                    if self.pop(&mut stack)? == 0 {
                        pc = target;
                    }
                }
                Op::Call { slot, argc } => {
                    let Some(LinkTarget::Function(callee)) = self.links.get(slot) else {
                        return Err(self.trap(format!("import {slot} is not callable")));
                    };
                    let split = stack
                        .len()
                        .checked_sub(argc)
                        .ok_or_else(|| self.trap("stack underflow"))?;
                    let call_args = stack.split_off(split);
                    stack.push(callee.invoke(&call_args)?);
                }
                Op::Ret => return self.pop(&mut stack),
            }
        }
    }
}

impl NativeFunction for ReferenceFunction {
    fn invoke(&self, args: &[i64]) -> Result<i64, JitError> {
        if args.len() != usize::try_from(self.code.params).unwrap_or(usize::MAX) {
            return Err(self.trap(format!(
                "expected {} argument(s), got {}",
                self.code.params,
                args.len()
            )));
        }
        let _depth = DepthGuard::enter(&self.code.name)?;
        self.run(args)
    }

    fn arity(&self) -> u32 {
        self.code.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_module;
    use lazyjit_ir::{Function, Inst, Module};

    fn load_single(function: Function, links: Vec<LinkTarget>) -> ReferenceFunction {
        let compiled = compile_module(&Module::new("m").with_function(function)).unwrap();
        let code = compiled.functions.into_iter().next().unwrap();
        ReferenceFunction::new(code, links.into())
    }

    #[test]
    fn evaluates_arithmetic() {
        // (a - b) * 3
        let function = load_single(
            Function::define(
                "f",
                2,
                vec![Inst::Arg(0), Inst::Arg(1), Inst::Sub, Inst::Const(3), Inst::Mul, Inst::Ret],
            ),
            vec![],
        );
        assert_eq!(function.invoke(&[10, 4]).unwrap(), 18);
    }

    #[test]
    fn division_by_zero_traps() {
        let function = load_single(
            Function::define("f", 1, vec![Inst::Const(1), Inst::Arg(0), Inst::Div, Inst::Ret]),
            vec![],
        );
        assert_eq!(function.invoke(&[2]).unwrap(), 0);
        assert_eq!(
            function.invoke(&[0]),
            Err(JitError::trap("f", "division by zero"))
        );
    }

    #[test]
    fn arity_is_checked() {
        let function = load_single(Function::define("f", 1, vec![Inst::Arg(0), Inst::Ret]), vec![]);
        assert!(matches!(function.invoke(&[]), Err(JitError::Trap { .. })));
        assert_eq!(function.arity(), 1);
    }

    #[test]
    fn loads_data_links() {
        let function = load_single(
            Function::define("f", 0, vec![Inst::Global("g".to_string()), Inst::Ret]),
            vec![LinkTarget::Data(42)],
        );
        assert_eq!(function.invoke(&[]).unwrap(), 42);
    }

    struct Forever;

    impl NativeFunction for Forever {
        fn invoke(&self, _args: &[i64]) -> Result<i64, JitError> {
            Ok(7)
        }

        fn arity(&self) -> u32 {
            1
        }
    }

    #[test]
    fn calls_pass_arguments_in_order() {
        let function = load_single(
            Function::define(
                "f",
                0,
                vec![
                    Inst::Const(5),
                    Inst::Const(1),
                    Inst::Call {
                        callee: "ext".to_string(),
                        argc: 1,
                    },
                    Inst::Add,
                    Inst::Ret,
                ],
            ),
            vec![LinkTarget::Function(Arc::new(Forever))],
        );
        assert_eq!(function.invoke(&[]).unwrap(), 12);
    }

    #[test]
    fn loop_with_jumps() {
        // countdown(n): while n != 0 { n = n - 1 } ; return 99
        let function = load_single(
            Function::define(
                "countdown",
                1,
                vec![
                    Inst::Arg(0),
                    Inst::Dup,
                    Inst::JumpIfZero(6),
                    Inst::Const(1),
                    Inst::Sub,
                    Inst::Jump(1),
                    Inst::Pop,
                    Inst::Const(99),
                    Inst::Ret,
                ],
            ),
            vec![],
        );
        assert_eq!(function.invoke(&[5]).unwrap(), 99);
    }
}
