//! Target data layout descriptors.
//!
//! The layout is kept in the textual form used by LLVM-style toolchains
//! (`e-m:e-i64:64-n32:64-S128`). Two layouts are compatible when their
//! normalized component lists are equal; component order is irrelevant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a layout string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("empty data layout component in `{0}`")]
    EmptyComponent(String),
    #[error("unknown endianness marker `{0}`")]
    UnknownEndianness(String),
}

/// A target-independent description of type sizes, alignment and endianness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataLayout {
    components: Vec<String>,
}

impl DataLayout {
    /// Layout of a little-endian 64-bit host.
    pub fn host() -> Self {
        // Components are already known-valid.
        Self::normalize("e-m:e-p:64:64-i64:64-i128:128-n32:64-S128")
    }

    fn normalize(repr: &str) -> Self {
        let mut components: Vec<String> = repr
            .split('-')
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
        components.sort();
        components.dedup();
        Self { components }
    }

    /// Whether the layout describes a little-endian target.
    pub fn is_little_endian(&self) -> bool {
        !self.components.iter().any(|c| c == "E")
    }

    /// The normalized string representation.
    pub fn as_string(&self) -> String {
        self.components.join("-")
    }
}

impl PartialEq for DataLayout {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for DataLayout {}

impl FromStr for DataLayout {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.split('-').any(str::is_empty) {
            return Err(LayoutError::EmptyComponent(s.to_owned()));
        }
        for component in s.split('-') {
            let first = component.chars().next();
            if component.len() == 1 && !matches!(first, Some('e' | 'E')) {
                return Err(LayoutError::UnknownEndianness(component.to_owned()));
            }
        }
        Ok(Self::normalize(s))
    }
}

impl TryFrom<String> for DataLayout {
    type Error = LayoutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataLayout> for String {
    fn from(value: DataLayout) -> Self {
        value.as_string()
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}
