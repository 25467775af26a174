//! Intermediate representation consumed by the lazy JIT.
//!
//! A [`Module`] is one translation unit: a set of function and constant
//! global definitions plus the data layout it was produced for. Function
//! bodies are sequences of [`Inst`] for a small stack machine over `i64`.
//!
//! Modules are plain owned values. Handing a module to the JIT moves it, so
//! at most one pipeline stage can mutate it at a time.

pub mod inst;
pub mod layout;
pub mod module;

pub use inst::Inst;
pub use layout::{DataLayout, LayoutError};
pub use module::{Function, Global, Linkage, Module};
