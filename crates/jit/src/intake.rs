//! Module intake: data layout check and internal symbol uniquing.
//!
//! Every internally linked definition is renamed to `<base><n>` with the
//! next free suffix for `<base>` and promoted to external linkage, so the
//! reoptimizer can address it by a session-wide unique name.

use lazyjit_ir::{DataLayout, Linkage, Module};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::JitError;
use crate::session::ExecutionSession;

/// Next free numeric suffix per base name.
///
/// Suffixes are handed out in increasing order and never reused within a
/// session.
#[derive(Debug, Default)]
pub struct RenameTable {
    next_suffix: FxHashMap<String, u64>,
}

impl RenameTable {
    /// Produce a new name for `base`, skipping candidates for which
    /// `is_taken` holds.
    pub fn next_name(&mut self, base: &str, is_taken: impl Fn(&str) -> bool) -> String {
        let next = self.next_suffix.entry(base.to_owned()).or_insert(0);
        loop {
            let candidate = format!("{base}{next}");
            *next = next.saturating_add(1);
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }

    /// The suffix `next_name` would try next for `base`.
    pub fn peek(&self, base: &str) -> u64 {
        self.next_suffix.get(base).copied().unwrap_or_default()
    }
}

/// An internal symbol renamed during intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub from: String,
    pub to: String,
}

/// Set an unset layout to the session's; reject a conflicting one.
pub fn apply_data_layout(module: &mut Module, session_layout: &DataLayout) -> Result<(), JitError> {
    match &module.data_layout {
        None => {
            module.data_layout = Some(session_layout.clone());
            Ok(())
        }
        Some(layout) if layout == session_layout => Ok(()),
        Some(layout) => Err(JitError::IncompatibleDataLayout {
            module: module.name.clone(),
            module_layout: layout.as_string(),
            session_layout: session_layout.as_string(),
        }),
    }
}

/// Validate and normalize `module` for the lazy pipeline.
///
/// Returns the renames that were applied. On error the module is left
/// untouched.
pub(crate) fn normalize(
    module: &mut Module,
    session: &ExecutionSession,
) -> Result<Vec<Renamed>, JitError> {
    apply_data_layout(module, session.data_layout())?;

    let internal_functions: Vec<String> = module
        .defined_functions()
        .filter(|function| function.has_internal_linkage())
        .map(|function| function.name.clone())
        .collect();
    let internal_globals: Vec<String> = module
        .globals
        .iter()
        .filter(|global| global.linkage == Linkage::Internal)
        .map(|global| global.name.clone())
        .collect();

    let renamed = session.with_renames(|table| {
        let mut renamed = Vec::new();
        for base in internal_functions {
            let name = table.next_name(&base, |candidate| {
                module.contains_symbol(candidate) || session.is_defined(candidate)
            });
            module.rename_function(&base, &name);
            if let Some(function) = module.function_mut(&name) {
                function.linkage = Linkage::External;
            }
            renamed.push(Renamed { from: base, to: name });
        }
        for base in internal_globals {
            let name = table.next_name(&base, |candidate| {
                module.contains_symbol(candidate) || session.is_defined(candidate)
            });
            module.rename_global(&base, &name);
            if let Some(global) = module.globals.iter_mut().find(|g| g.name == name) {
                global.linkage = Linkage::External;
            }
            renamed.push(Renamed { from: base, to: name });
        }
        renamed
    });

    for Renamed { from, to } in &renamed {
        debug!(module = %module.name, from = %from, to = %to, "Promoted internal symbol");
    }
    Ok(renamed)
}
