// SPDX-License-Identifier: MIT

//! Canonical ATerm serialization of derivations.
//!
//! One line, no whitespace, every collection sorted. The same writer
//! also produces the fingerprint variant used by the build scheduler,
//! where input derivation paths are replaced by their producing
//! fingerprints and floating outputs carry their own-output
//! placeholders in the path field.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::aterm;
use crate::placeholder::Placeholder;
use crate::store_dir::StoreDirectory;
use crate::store_path::StorePath;

use super::output::{OutputSpec, fixed_output_path};
use super::Derivation;

const PREFIX: &[u8] = b"Derive(";

fn quoted<W: Write>(w: &mut W, field: impl AsRef<[u8]>) -> io::Result<()> {
    w.write_all(b"\"")?;
    w.write_all(&aterm::escape(field.as_ref()))?;
    w.write_all(b"\"")
}

fn quoted_list<W: Write, S: AsRef<[u8]>>(w: &mut W, items: impl IntoIterator<Item = S>) -> io::Result<()> {
    w.write_all(b"[")?;
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        quoted(w, item)?;
    }
    w.write_all(b"]")
}

fn write_outputs<W: Write>(
    w: &mut W,
    dir: &StoreDirectory,
    drv: &Derivation,
    fingerprinting: bool,
) -> io::Result<()> {
    w.write_all(b"[")?;
    for (i, (output_name, spec)) in drv.outputs.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }

        let (path_field, hash_field) = match spec {
            OutputSpec::InputAddressed(p) => (dir.display_path(p), String::new()),
            OutputSpec::FixedCA(ca) => {
                let path = fixed_output_path(dir, &drv.name, output_name, ca)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                (dir.display_path(&path), ca.hash().to_hex())
            }
            OutputSpec::FloatingCA { .. } => {
                let path = if fingerprinting {
                    Placeholder::own_output(output_name).to_string()
                } else {
                    String::new()
                };
                (path, String::new())
            }
        };

        w.write_all(b"(")?;
        quoted(w, output_name)?;
        w.write_all(b",")?;
        quoted(w, &path_field)?;
        w.write_all(b",")?;
        quoted(w, spec.method_algo_string())?;
        w.write_all(b",")?;
        quoted(w, &hash_field)?;
        w.write_all(b")")?;
    }
    w.write_all(b"]")
}

fn write_input_derivations<W: Write>(
    w: &mut W,
    dir: &StoreDirectory,
    drv: &Derivation,
    replacements: Option<&BTreeMap<StorePath, String>>,
) -> io::Result<()> {
    // The encoding sorts entries by the rendered key, so the
    // fingerprint variant re-sorts by the replacement strings.
    let mut rendered: BTreeMap<String, &std::collections::BTreeSet<String>> = BTreeMap::new();
    for (drv_path, outputs) in &drv.input_derivations {
        let key = match replacements {
            Some(map) => map
                .get(drv_path)
                .cloned()
                .unwrap_or_else(|| dir.display_path(drv_path)),
            None => dir.display_path(drv_path),
        };
        rendered.insert(key, outputs);
    }

    w.write_all(b"[")?;
    for (i, (key, outputs)) in rendered.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"(")?;
        quoted(w, key)?;
        w.write_all(b",")?;
        quoted_list(w, outputs.iter())?;
        w.write_all(b")")?;
    }
    w.write_all(b"]")
}

pub(super) fn write_derivation<W: Write>(
    w: &mut W,
    dir: &StoreDirectory,
    drv: &Derivation,
    replacements: Option<&BTreeMap<StorePath, String>>,
) -> io::Result<()> {
    let fingerprinting = replacements.is_some();

    w.write_all(PREFIX)?;
    write_outputs(w, dir, drv, fingerprinting)?;
    w.write_all(b",")?;
    write_input_derivations(w, dir, drv, replacements)?;
    w.write_all(b",")?;
    quoted_list(w, drv.input_sources.iter().map(|p| dir.display_path(p)))?;
    w.write_all(b",")?;
    quoted(w, &drv.system)?;
    w.write_all(b",")?;
    quoted(w, &drv.builder)?;
    w.write_all(b",")?;
    quoted_list(w, drv.args.iter())?;
    w.write_all(b",")?;
    w.write_all(b"[")?;
    for (i, (k, v)) in drv.env.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"(")?;
        quoted(w, k)?;
        w.write_all(b",")?;
        quoted(w, v)?;
        w.write_all(b")")?;
    }
    w.write_all(b"]")?;
    w.write_all(b")")
}
