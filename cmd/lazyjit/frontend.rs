//! Ahead-of-time front end: every module comes from a file given on the
//! command line, so there is nothing left to supply on demand.

use std::path::{Path, PathBuf};

use lazyjit_core::{AheadOfTimeProvider, CapturedModule, JitError, ModuleProvider};
use lazyjit_ir::Module;
use tracing::debug;

pub const MODULE_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum FrontEndError {
    #[error("no input files")]
    NoInputs,
    #[error("input file `{0}` does not exist")]
    Missing(PathBuf),
    #[error("input file `{0}` is not a `.{MODULE_EXTENSION}` module")]
    UnsupportedExtension(PathBuf),
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse module `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct AotFrontEnd {
    inputs: Vec<PathBuf>,
}

impl AotFrontEnd {
    /// Validate the input list. Nothing is read yet.
    pub fn new(inputs: Vec<PathBuf>) -> Result<Self, FrontEndError> {
        if inputs.is_empty() {
            return Err(FrontEndError::NoInputs);
        }
        for path in &inputs {
            if !path.exists() {
                return Err(FrontEndError::Missing(path.clone()));
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(MODULE_EXTENSION) {
                return Err(FrontEndError::UnsupportedExtension(path.clone()));
            }
        }
        Ok(Self { inputs })
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    /// Parse every input, in command-line order.
    pub fn load_modules(&self) -> Result<Vec<Module>, FrontEndError> {
        self.inputs.iter().map(|path| load_module(path)).collect()
    }
}

fn load_module(path: &Path) -> Result<Module, FrontEndError> {
    let contents = std::fs::read_to_string(path).map_err(|source| FrontEndError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let module: Module = serde_json::from_str(&contents).map_err(|source| FrontEndError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), module = %module.name, "Loaded module");
    Ok(module)
}

impl ModuleProvider for AotFrontEnd {
    fn request_module(&self, name: &str) -> Result<CapturedModule, JitError> {
        debug!(symbol = name, "Front end asked for a module after loading");
        AheadOfTimeProvider.request_module(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lazyjit_frontend_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn rejects_empty_and_missing_inputs() {
        assert!(matches!(AotFrontEnd::new(vec![]), Err(FrontEndError::NoInputs)));
        let missing = scratch_dir("missing").join("absent.json");
        assert!(matches!(
            AotFrontEnd::new(vec![missing]),
            Err(FrontEndError::Missing(_))
        ));
    }

    #[test]
    fn rejects_other_extensions() {
        let path = scratch_dir("extension").join("module.ll");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            AotFrontEnd::new(vec![path]),
            Err(FrontEndError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn loads_modules_in_order() {
        let dir = scratch_dir("order");
        let first = dir.join("a.json");
        let second = dir.join("b.json");
        std::fs::write(&first, r#"{"name":"a","functions":[{"name":"f","body":[{"const":1},"ret"]}]}"#)
            .unwrap();
        std::fs::write(&second, r#"{"name":"b"}"#).unwrap();

        let front_end = AotFrontEnd::new(vec![first, second]).unwrap();
        let names: Vec<String> = front_end
            .load_modules()
            .unwrap()
            .into_iter()
            .map(|module| module.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn malformed_module_is_a_parse_error() {
        let path = scratch_dir("malformed").join("bad.json");
        std::fs::write(&path, r#"{"functions": 3}"#).unwrap();
        let front_end = AotFrontEnd::new(vec![path]).unwrap();
        assert!(matches!(
            front_end.load_modules(),
            Err(FrontEndError::Parse { .. })
        ));
    }

    #[test]
    fn never_supplies_modules_on_demand() {
        let path = scratch_dir("provider").join("m.json");
        std::fs::write(&path, r#"{"name":"m"}"#).unwrap();
        let front_end = AotFrontEnd::new(vec![path]).unwrap();
        match front_end.request_module("anything") {
            Err(JitError::NothingToLoad { reason, .. }) => {
                assert_eq!(reason, "Everything should be loaded.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
