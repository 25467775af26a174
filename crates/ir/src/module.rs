//! Translation units.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::inst::Inst;
use crate::layout::DataLayout;

/// Symbol linkage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    /// Visible to other modules.
    #[default]
    External,
    /// Private to the defining module.
    Internal,
}

/// A function definition or declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub params: u32,
    /// `None` for a declaration of a function defined elsewhere.
    #[serde(default)]
    pub body: Option<Vec<Inst>>,
}

impl Function {
    /// A definition with the given body.
    pub fn define(name: impl Into<String>, params: u32, body: Vec<Inst>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            params,
            body: Some(body),
        }
    }

    /// A declaration of an external function.
    pub fn declare(name: impl Into<String>, params: u32) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            params,
            body: None,
        }
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn has_internal_linkage(&self) -> bool {
        self.linkage == Linkage::Internal
    }
}

/// A constant data symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    #[serde(default)]
    pub linkage: Linkage,
    pub value: i64,
}

/// One translation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Layout the module was produced for. `None` means "unset"; intake
    /// fills it in with the session layout.
    #[serde(default)]
    pub data_layout: Option<DataLayout>,
    #[serde(default)]
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_layout: None,
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn with_data_layout(mut self, layout: DataLayout) -> Self {
        self.data_layout = Some(layout);
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_global(mut self, global: Global) -> Self {
        self.globals.push(global);
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Functions that carry a body.
    pub fn defined_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| !f.is_declaration())
    }

    /// Names of every symbol this module defines (functions with bodies and
    /// globals), in declaration order.
    pub fn defined_symbols(&self) -> Vec<&str> {
        self.defined_functions()
            .map(|f| f.name.as_str())
            .chain(self.globals.iter().map(|g| g.name.as_str()))
            .collect()
    }

    /// Symbols referenced from function bodies but not defined here.
    pub fn undefined_references(&self) -> FxHashSet<String> {
        let defined: FxHashSet<&str> = self.defined_symbols().into_iter().collect();
        let mut undefined = FxHashSet::default();
        for body in self.functions.iter().filter_map(|f| f.body.as_ref()) {
            for inst in body {
                let referenced = match inst {
                    Inst::Call { callee, .. } => callee,
                    Inst::Global(name) => name,
                    _ => continue,
                };
                if !defined.contains(referenced.as_str()) {
                    undefined.insert(referenced.clone());
                }
            }
        }
        undefined
    }

    /// Rename a function and rewrite every call to it within this module.
    ///
    /// Returns `false` if no function named `from` exists.
    pub fn rename_function(&mut self, from: &str, to: &str) -> bool {
        let Some(function) = self.function_mut(from) else {
            return false;
        };
        function.name = to.to_owned();
        for body in self.functions.iter_mut().filter_map(|f| f.body.as_mut()) {
            for inst in body.iter_mut() {
                if let Inst::Call { callee, .. } = inst
                    && callee == from
                {
                    *callee = to.to_owned();
                }
            }
        }
        true
    }

    /// Rename a global and rewrite every load of it within this module.
    ///
    /// Returns `false` if no global named `from` exists.
    pub fn rename_global(&mut self, from: &str, to: &str) -> bool {
        let Some(global) = self.globals.iter_mut().find(|g| g.name == from) else {
            return false;
        };
        global.name = to.to_owned();
        for body in self.functions.iter_mut().filter_map(|f| f.body.as_mut()) {
            for inst in body.iter_mut() {
                if let Inst::Global(name) = inst
                    && name == from
                {
                    *name = to.to_owned();
                }
            }
        }
        true
    }

    /// Whether any function or global in this module is named `name`.
    pub fn contains_symbol(&self, name: &str) -> bool {
        self.function(name).is_some() || self.global(name).is_some()
    }

    /// Total number of instructions over all bodies.
    pub fn instruction_count(&self) -> usize {
        self.functions
            .iter()
            .filter_map(|f| f.body.as_ref())
            .map(Vec::len)
            .sum()
    }
}
