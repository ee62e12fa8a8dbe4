//! Pluggable conversion backends.
//!
//! A [`Backend`] knows how to turn `(input, output, preset)` into a
//! subprocess invocation. The worker never looks at backend names; it asks
//! the [`Backends`] registry for the implementation and runs whatever
//! [`Invocation`] it builds.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::{Error, Result};

/// A program and its arguments, ready to be spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn has_preset(&self, preset: &str) -> bool;

    /// Builds the command that converts `input` into `output` using `preset`.
    fn invocation(&self, input: &Path, output: &Path, preset: &str) -> Result<Invocation>;

    /// Extracts a progress fraction from one line of the backend's stdout.
    fn progress(&self, _line: &str) -> Option<f64> {
        None
    }
}

#[derive(Default, Clone)]
pub struct Backends {
    by_name: HashMap<String, Arc<dyn Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: Backend>(&mut self, backend: B) -> &mut Self {
        self.by_name
            .insert(backend.name().to_string(), Arc::new(backend));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.by_name.get(name).cloned()
    }

    /// Resolves `name` and checks that it knows `preset`.
    pub fn validate(&self, name: &str, preset: &str) -> Result<Arc<dyn Backend>> {
        let backend = self
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unsupported backend {name:?}")))?;
        if preset.is_empty() {
            return Err(Error::Validation("preset must not be empty".into()));
        }
        if !backend.has_preset(preset) {
            return Err(Error::Validation(format!(
                "backend {name:?} has no preset {preset:?}"
            )));
        }
        Ok(backend)
    }
}

/// Stage banners printed by slic3r, in order, with the fraction of work done
/// once each stage starts.
const SLIC3R_STAGES: &[(&str, f64)] = &[
    ("=> Processing triangulated mesh", 0.1),
    ("=> Generating perimeters", 0.3),
    ("=> Preparing infill", 0.45),
    ("=> Infilling layers", 0.6),
    ("=> Generating skirt", 0.75),
    ("=> Exporting G-code", 0.9),
];

/// The slic3r command line slicer. Presets are slic3r `.ini` config files,
/// addressed by file stem.
#[derive(Debug, Clone)]
pub struct Slic3r {
    bin: PathBuf,
    presets: HashMap<String, PathBuf>,
}

impl Slic3r {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Slic3r {
            bin: bin.into(),
            presets: HashMap::new(),
        }
    }

    pub fn with_preset(mut self, name: impl Into<String>, config: impl Into<PathBuf>) -> Self {
        self.presets.insert(name.into(), config.into());
        self
    }

    /// Registers every `*.ini` file in `dir` as a preset named after its stem.
    pub fn load_presets(mut self, dir: &Path) -> Result<Self> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ini") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                debug!(preset = name, config = %path.display(), "Loaded slic3r preset");
                self.presets.insert(name.to_string(), path.clone());
            }
        }
        Ok(self)
    }
}

impl Backend for Slic3r {
    fn name(&self) -> &str {
        "slic3r"
    }

    fn has_preset(&self, preset: &str) -> bool {
        self.presets.contains_key(preset)
    }

    fn invocation(&self, input: &Path, output: &Path, preset: &str) -> Result<Invocation> {
        let config = self
            .presets
            .get(preset)
            .ok_or_else(|| Error::Backend(format!("unknown slic3r preset {preset:?}")))?;
        Ok(Invocation {
            program: self.bin.clone(),
            args: vec![
                "--load".into(),
                config.into(),
                "-o".into(),
                output.into(),
                input.into(),
            ],
        })
    }

    fn progress(&self, line: &str) -> Option<f64> {
        let line = line.trim();
        SLIC3R_STAGES
            .iter()
            .find(|(banner, _)| line.starts_with(banner))
            .map(|(_, fraction)| *fraction)
    }
}
