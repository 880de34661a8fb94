// SPDX-License-Identifier: MIT

//! The derivation model and its canonical `.drv` encoding.
//!
//! A derivation is a build recipe: a builder program, its arguments and
//! environment, the store paths it consumes, and the outputs it promises
//! to produce. Derivations are persisted as a single line of textual
//! ATerm:
//!
//! ```plain
//! Derive([outputs],[inputDrvs],[inputSrcs],system,builder,[args],[env])
//! ```
//!
//! All collections are sorted in the encoding, so two derivations that
//! are structurally equal produce identical bytes regardless of how they
//! were assembled, and the store path of the `.drv` file (a text
//! content-address over those bytes) is stable.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::content_address::ContentAddress;
use crate::placeholder::Placeholder;
use crate::store_dir::StoreDirectory;
use crate::store_path::{self, StorePath, StorePathError, StoreReferences};
use crate::system::System;

mod output;
mod parse;
mod write;

pub use output::OutputSpec;
pub use parse::ParseError;

/// Name of the default output every derivation must declare.
pub const DEFAULT_OUTPUT: &str = "out";

/// Environment variable names starting with this prefix are reserved for
/// the store server (`__network`, `__buildSystemDeps`, …).
pub const RESERVED_ENV_PREFIX: &str = "__";

#[derive(Debug, Eq, PartialEq, Error)]
pub enum DerivationError {
    #[error("derivation has an empty name")]
    EmptyName,
    #[error("derivation {0:?}: invalid system triple: {1}")]
    BadSystem(String, crate::system::SystemError),
    #[error("derivation {0:?} has no builder")]
    EmptyBuilder(String),
    #[error("derivation {0:?} declares no outputs")]
    NoOutputs(String),
    #[error("derivation {0:?} does not declare the {DEFAULT_OUTPUT:?} output")]
    MissingDefaultOutput(String),
    #[error("derivation {0:?}: invalid output name {1:?}")]
    BadOutputName(String, String),
    #[error("derivation {0:?}: output {1:?} path does not match its content address")]
    FixedOutputPathMismatch(String, String),
    #[error("derivation {0:?}: input derivation {1} is not a .drv path")]
    InputNotDerivation(String, String),
    #[error("derivation {0:?}: {1}")]
    StorePath(String, StorePathError),
}

/// A build recipe. See the module docs for the canonical encoding.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Derivation {
    /// Human-readable name; the `.drv` store path is `<name>.drv`.
    pub name: String,
    /// Platform triple the builder runs on.
    pub system: String,
    /// Absolute path of the program to execute.
    pub builder: String,
    /// Arguments passed to the builder, in declared order.
    pub args: Vec<String>,
    /// Environment of the builder. Names are unique by construction.
    pub env: BTreeMap<String, String>,
    /// Store paths consumed as-is.
    pub input_sources: BTreeSet<StorePath>,
    /// For each input derivation, the set of its outputs we consume.
    pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
    /// Declared outputs by name. Non-empty, contains [DEFAULT_OUTPUT].
    pub outputs: BTreeMap<String, OutputSpec>,
}

impl Derivation {
    /// Serialize to canonical ATerm bytes.
    pub fn to_aterm(&self, dir: &StoreDirectory) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing to a Vec cannot fail.
        write::write_derivation(&mut buf, dir, self, None).unwrap();
        buf
    }

    /// Serialize for fingerprinting: input derivation paths are replaced
    /// by caller-provided strings (the producing derivations'
    /// fingerprints) and floating output path fields are filled with
    /// their own-output placeholders.
    pub fn to_fingerprint_aterm(
        &self,
        dir: &StoreDirectory,
        input_replacements: &BTreeMap<StorePath, String>,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        write::write_derivation(&mut buf, dir, self, Some(input_replacements)).unwrap();
        buf
    }

    /// Parse the canonical ATerm encoding. `name` is the store path name
    /// of the `.drv` file without its suffix.
    pub fn parse_aterm(
        dir: &StoreDirectory,
        name: &str,
        bytes: &[u8],
    ) -> Result<Self, ParseError> {
        let (mut drv, declared_fixed_paths) = parse::parse(dir, bytes)?;
        drv.name = name.to_string();
        drv.validate(dir).map_err(ParseError::Invalid)?;

        // Fixed output paths are a function of (name, ca); a declared
        // path that disagrees means the file was tampered with or the
        // name is wrong.
        for (output_name, declared) in &declared_fixed_paths {
            if let Some(OutputSpec::FixedCA(ca)) = drv.outputs.get(output_name) {
                let expected = output::fixed_output_path(dir, &drv.name, output_name, ca)
                    .map_err(|e| {
                        ParseError::Invalid(DerivationError::StorePath(drv.name.clone(), e))
                    })?;
                if *declared != dir.display_path(&expected) {
                    return Err(ParseError::Invalid(
                        DerivationError::FixedOutputPathMismatch(
                            drv.name.clone(),
                            output_name.clone(),
                        ),
                    ));
                }
            }
        }

        Ok(drv)
    }

    /// The store path of this derivation's `.drv` file: a text
    /// content-address over the canonical encoding, referencing the
    /// input sources and input derivation paths.
    pub fn store_path(&self, dir: &StoreDirectory) -> Result<StorePath, DerivationError> {
        let refs = StoreReferences {
            others: self
                .input_sources
                .iter()
                .chain(self.input_derivations.keys())
                .map(|p| dir.display_path(p))
                .collect(),
            self_ref: false,
        };
        store_path::text_path(dir, &format!("{}.drv", self.name), self.to_aterm(dir), &refs)
            .map_err(|e| DerivationError::StorePath(self.name.clone(), e))
    }

    /// Check the structural invariants.
    pub fn validate(&self, dir: &StoreDirectory) -> Result<(), DerivationError> {
        if self.name.is_empty() {
            return Err(DerivationError::EmptyName);
        }
        self.system
            .parse::<System>()
            .map_err(|e| DerivationError::BadSystem(self.name.clone(), e))?;
        if self.builder.is_empty() {
            return Err(DerivationError::EmptyBuilder(self.name.clone()));
        }
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs(self.name.clone()));
        }
        if !self.outputs.contains_key(DEFAULT_OUTPUT) {
            return Err(DerivationError::MissingDefaultOutput(self.name.clone()));
        }
        for (output_name, spec) in &self.outputs {
            if output_name.is_empty() {
                return Err(DerivationError::BadOutputName(
                    self.name.clone(),
                    output_name.clone(),
                ));
            }
            if let OutputSpec::FixedCA(ca) = spec {
                // Minting the path surfaces bad names early.
                output::fixed_output_path(dir, &self.name, output_name, ca)
                    .map_err(|e| DerivationError::StorePath(self.name.clone(), e))?;
            }
        }
        for input in self.input_derivations.keys() {
            if !input.is_derivation() {
                return Err(DerivationError::InputNotDerivation(
                    self.name.clone(),
                    input.to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The store path name of an output: the derivation name, with
    /// `-<outputName>` appended for non-default outputs.
    pub fn output_path_name(&self, output_name: &str) -> String {
        output_path_name(&self.name, output_name)
    }

    /// Resolved store path of an output, if it is knowable before the
    /// build: input-addressed outputs carry it, fixed outputs derive it
    /// from their content address, floating outputs return `None`.
    pub fn output_store_path(
        &self,
        dir: &StoreDirectory,
        output_name: &str,
    ) -> Result<Option<StorePath>, StorePathError> {
        match self.outputs.get(output_name) {
            None => Ok(None),
            Some(OutputSpec::InputAddressed(p)) => Ok(Some(p.clone())),
            Some(OutputSpec::FixedCA(ca)) => {
                output::fixed_output_path(dir, &self.name, output_name, ca).map(Some)
            }
            Some(OutputSpec::FloatingCA { .. }) => Ok(None),
        }
    }

    /// Placeholders that may occur in this derivation's builder, args,
    /// or environment: one per own output, and one per consumed output
    /// of each input derivation.
    pub fn placeholders(&self) -> BTreeMap<String, (Option<StorePath>, String)> {
        let mut out = BTreeMap::new();
        for output_name in self.outputs.keys() {
            out.insert(
                Placeholder::own_output(output_name).to_string(),
                (None, output_name.clone()),
            );
        }
        for (drv_path, outputs) in &self.input_derivations {
            for output_name in outputs {
                out.insert(
                    Placeholder::upstream_output(drv_path, output_name).to_string(),
                    (Some(drv_path.clone()), output_name.clone()),
                );
            }
        }
        out
    }

    /// Rewrite every occurrence of the given placeholder strings inside
    /// `builder`, `args`, and `env` values with their resolved paths.
    pub fn resolve_placeholders(&mut self, substitutions: &BTreeMap<String, String>) {
        if substitutions.is_empty() {
            return;
        }
        self.builder = replace_all(&self.builder, substitutions);
        for arg in &mut self.args {
            *arg = replace_all(arg, substitutions);
        }
        for value in self.env.values_mut() {
            *value = replace_all(value, substitutions);
        }
    }

    /// True if the sole output is fixed; such derivations may reach the
    /// network because their result is verified against a known hash.
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && matches!(self.outputs.get(DEFAULT_OUTPUT), Some(OutputSpec::FixedCA(_)))
    }

    /// The fixed content address, if [Derivation::is_fixed_output].
    pub fn fixed_output_ca(&self) -> Option<&ContentAddress> {
        if self.outputs.len() != 1 {
            return None;
        }
        match self.outputs.get(DEFAULT_OUTPUT) {
            Some(OutputSpec::FixedCA(ca)) => Some(ca),
            _ => None,
        }
    }
}

/// See [Derivation::output_path_name].
pub fn output_path_name(drv_name: &str, output_name: &str) -> String {
    if output_name == DEFAULT_OUTPUT {
        drv_name.to_string()
    } else {
        format!("{drv_name}-{output_name}")
    }
}

fn replace_all(s: &str, substitutions: &BTreeMap<String, String>) -> String {
    let mut out = s.to_string();
    for (needle, replacement) in substitutions {
        if out.contains(needle) {
            out = out.replace(needle, replacement);
        }
    }
    out
}
