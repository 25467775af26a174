//! Reference optimization passes.
//!
//! A pipeline descriptor is either `default<O0>` .. `default<O3>` or a
//! comma separated list of pass names (`const-fold,dce`). Passes rewrite
//! function bodies in place and keep branch targets consistent: removed
//! instructions map to the next surviving one.
//!
//! # Example
//!
//! ```text
//! Before: const 3, const 4, add, ret
//! After:  const 7, ret
//! ```

use lazyjit_core::{JitError, PassPipeline};
use lazyjit_ir::{Inst, Module};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Upper bound on fixpoint iterations of a single pass.
const MAX_ROUNDS: usize = 16;

/// One transformation over every defined function of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// `const a, const b, <binop>` becomes `const (a op b)`. A constant
    /// feeding `jz` becomes an unconditional jump or disappears.
    ConstFold,
    /// Local no-op removal: pure push followed by `pop`, jumps to the next
    /// instruction, `+ 0`, `- 0`, `* 1`.
    Peephole,
    /// Loads of globals defined in the same module become constants.
    GlobalFold,
    /// Removes instructions unreachable from the entry.
    Dce,
}

impl Pass {
    pub fn name(self) -> &'static str {
        match self {
            Pass::ConstFold => "const-fold",
            Pass::Peephole => "peephole",
            Pass::GlobalFold => "global-fold",
            Pass::Dce => "dce",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "const-fold" => Some(Pass::ConstFold),
            "peephole" => Some(Pass::Peephole),
            "global-fold" => Some(Pass::GlobalFold),
            "dce" => Some(Pass::Dce),
            _ => None,
        }
    }
}

/// Statistics from running a pipeline over one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationStats {
    pub instructions_before: usize,
    pub instructions_after: usize,
    /// Rewrites performed across all passes.
    pub rewrites: usize,
}

/// Parse a pipeline descriptor into the passes it runs, in order.
pub fn parse_pipeline(descriptor: &str) -> Result<Vec<Pass>, JitError> {
    let descriptor = descriptor.trim();
    if descriptor.is_empty() {
        return Err(JitError::invalid_pipeline(descriptor, "empty pipeline"));
    }
    if let Some(level) = descriptor
        .strip_prefix("default<")
        .and_then(|rest| rest.strip_suffix('>'))
    {
        return default_pipeline(level)
            .ok_or_else(|| JitError::invalid_pipeline(descriptor, format!("unknown level `{level}`")));
    }
    descriptor
        .split(',')
        .map(str::trim)
        .map(|name| {
            Pass::from_name(name)
                .ok_or_else(|| JitError::invalid_pipeline(descriptor, format!("unknown pass `{name}`")))
        })
        .collect()
}

fn default_pipeline(level: &str) -> Option<Vec<Pass>> {
    let o2 = [
        Pass::GlobalFold,
        Pass::ConstFold,
        Pass::Peephole,
        Pass::ConstFold,
        Pass::Dce,
    ];
    match level {
        "O0" => Some(Vec::new()),
        "O1" => Some(vec![Pass::ConstFold, Pass::Dce]),
        "O2" => Some(o2.to_vec()),
        "O3" => Some(o2.iter().chain(o2.iter()).copied().collect()),
        _ => None,
    }
}

/// Run `passes` over every defined function of `module`.
pub fn run_passes(module: &mut Module, passes: &[Pass]) -> OptimizationStats {
    let mut stats = OptimizationStats {
        instructions_before: module.instruction_count(),
        ..Default::default()
    };
    let globals: FxHashMap<String, i64> = module
        .globals
        .iter()
        .map(|global| (global.name.clone(), global.value))
        .collect();

    for function in &mut module.functions {
        let Some(body) = function.body.as_mut() else {
            continue;
        };
        for pass in passes {
            let rewrites = match pass {
                Pass::ConstFold => to_fixpoint(body, fold_constants),
                Pass::Peephole => to_fixpoint(body, peephole),
                Pass::GlobalFold => fold_globals(body, &globals),
                Pass::Dce => eliminate_dead_code(body),
            };
            stats.rewrites = stats.rewrites.saturating_add(rewrites);
        }
    }
    stats.instructions_after = module.instruction_count();
    stats
}

fn to_fixpoint(body: &mut Vec<Inst>, pass: fn(&mut Vec<Inst>) -> usize) -> usize {
    let mut total = 0_usize;
    for _ in 0..MAX_ROUNDS {
        let rewrites = pass(body);
        if rewrites == 0 {
            break;
        }
        total = total.saturating_add(rewrites);
    }
    total
}

/// `targets[i]` is true when some branch lands on `i`.
fn branch_targets(body: &[Inst]) -> Vec<bool> {
    let mut targets = vec![false; body.len()];
    for target in body.iter().filter_map(Inst::jump_target) {
        if let Some(flag) = targets.get_mut(target) {
            *flag = true;
        }
    }
    targets
}

/// Drop the `None` slots and retarget branches.
fn compact(slots: Vec<Option<Inst>>) -> Vec<Inst> {
    // remap[i] = survivors before i, so a removed slot maps to the next kept one.
    let mut remap = Vec::with_capacity(slots.len().saturating_add(1));
    let mut kept = 0_usize;
    for slot in &slots {
        remap.push(kept);
        if slot.is_some() {
            kept = kept.saturating_add(1);
        }
    }
    remap.push(kept);

    slots
        .into_iter()
        .flatten()
        .map(|mut inst| {
            if let Some(target) = inst.jump_target_mut() {
                *target = remap.get(*target).copied().unwrap_or(kept);
            }
            inst
        })
        .collect()
}

fn fold_constants(body: &mut Vec<Inst>) -> usize {
    let targets = branch_targets(body);
    let is_target = |i: usize| targets.get(i).copied().unwrap_or(false);
    let mut slots: Vec<Option<Inst>> = body.drain(..).map(Some).collect();
    let mut rewrites = 0_usize;
    let mut i = 0_usize;

    while i < slots.len() {
        let second = i.saturating_add(1);
        let third = i.saturating_add(2);
        let window = (
            slots.get(i).cloned().flatten(),
            slots.get(second).cloned().flatten(),
            slots.get(third).cloned().flatten(),
        );
        match window {
            (Some(Inst::Const(lhs)), Some(Inst::Const(rhs)), Some(op))
                if op.is_binary_op() && !is_target(second) && !is_target(third) =>
            {
                if let Some(value) = op.eval_binary(lhs, rhs) {
                    set_slot(&mut slots, i, Some(Inst::Const(value)));
                    set_slot(&mut slots, second, None);
                    set_slot(&mut slots, third, None);
                    rewrites = rewrites.saturating_add(1);
                    i = third.saturating_add(1);
                    continue;
                }
            }
            (Some(Inst::Const(value)), Some(Inst::JumpIfZero(target)), _) if !is_target(second) => {
                let replacement = (value == 0).then_some(Inst::Jump(target));
                set_slot(&mut slots, i, replacement);
                set_slot(&mut slots, second, None);
                rewrites = rewrites.saturating_add(1);
                i = third;
                continue;
            }
            _ => {}
        }
        i = second;
    }
    *body = compact(slots);
    rewrites
}

fn peephole(body: &mut Vec<Inst>) -> usize {
    let targets = branch_targets(body);
    let is_target = |i: usize| targets.get(i).copied().unwrap_or(false);
    let mut slots: Vec<Option<Inst>> = body.drain(..).map(Some).collect();
    let mut rewrites = 0_usize;
    let mut i = 0_usize;

    while i < slots.len() {
        let next = i.saturating_add(1);
        let pair = (slots.get(i).cloned().flatten(), slots.get(next).cloned().flatten());
        let removable = match &pair {
            (Some(Inst::Jump(target)), _) if *target == next => {
                set_slot(&mut slots, i, None);
                rewrites = rewrites.saturating_add(1);
                i = next;
                continue;
            }
            (Some(Inst::Const(_) | Inst::Arg(_) | Inst::Global(_) | Inst::Dup), Some(Inst::Pop)) => true,
            (Some(Inst::Const(0)), Some(Inst::Add | Inst::Sub)) => true,
            (Some(Inst::Const(1)), Some(Inst::Mul)) => true,
            _ => false,
        };
        if removable && !is_target(next) {
            set_slot(&mut slots, i, None);
            set_slot(&mut slots, next, None);
            rewrites = rewrites.saturating_add(1);
            i = next.saturating_add(1);
            continue;
        }
        i = next;
    }
    *body = compact(slots);
    rewrites
}

fn fold_globals(body: &mut [Inst], globals: &FxHashMap<String, i64>) -> usize {
    let mut rewrites = 0_usize;
    for inst in body.iter_mut() {
        if let Inst::Global(name) = inst
            && let Some(value) = globals.get(name.as_str())
        {
            *inst = Inst::Const(*value);
            rewrites = rewrites.saturating_add(1);
        }
    }
    rewrites
}

fn eliminate_dead_code(body: &mut Vec<Inst>) -> usize {
    let mut reachable = vec![false; body.len()];
    let mut worklist = vec![0_usize];
    while let Some(pc) = worklist.pop() {
        let (Some(seen), Some(inst)) = (reachable.get_mut(pc), body.get(pc)) else {
            continue;
        };
        if *seen {
            continue;
        }
        *seen = true;
        if let Some(target) = inst.jump_target() {
            worklist.push(target);
        }
        if !inst.is_terminator() {
            worklist.push(pc.saturating_add(1));
        }
    }

    let removed = reachable.iter().filter(|live| !**live).count();
    if removed == 0 {
        return 0;
    }
    let slots = body
        .drain(..)
        .zip(reachable)
        .map(|(inst, live)| live.then_some(inst))
        .collect();
    *body = compact(slots);
    removed
}

fn set_slot(slots: &mut [Option<Inst>], index: usize, value: Option<Inst>) {
    if let Some(slot) = slots.get_mut(index) {
        *slot = value;
    }
}

/// [`PassPipeline`] over [`Pass`] descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferencePassPipeline;

impl PassPipeline for ReferencePassPipeline {
    fn validate(&self, descriptor: &str) -> Result<(), JitError> {
        parse_pipeline(descriptor).map(|_| ())
    }

    fn apply(&self, module: &mut Module, descriptor: &str) -> Result<(), JitError> {
        let passes = parse_pipeline(descriptor)?;
        let stats = run_passes(module, &passes);
        debug!(
            module = %module.name,
            pipeline = descriptor,
            before = stats.instructions_before,
            after = stats.instructions_after,
            rewrites = stats.rewrites,
            "Applied pass pipeline"
        );
        Ok(())
    }
}
