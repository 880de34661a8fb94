// SPDX-License-Identifier: MIT

//! Build fingerprints.
//!
//! A fingerprint identifies what a build *does*, modulo the renaming of
//! floating output paths: two derivation files with the same
//! fingerprint produce the same outputs, so the scheduler unifies them
//! (one builder run, one realisation cache entry).
//!
//! * A fixed-output derivation fingerprints as
//!   `sha256("fixed:out:<method-prefix><algo>:<hash-hex>:<outPath>")` —
//!   its result is fully determined by the declared content address,
//!   regardless of how it is fetched or built.
//! * Anything else fingerprints as the SHA-256 of its canonical ATerm
//!   with every floating output path replaced by its own-output
//!   placeholder and every input derivation path replaced by the hex of
//!   the producing derivation's fingerprint.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use data_encoding::HEXLOWER;

use zb_store_core::derivation::Derivation;
use zb_store_core::hash::sha256;
use zb_store_core::store_dir::StoreDirectory;
use zb_store_core::store_path::{StorePath, StorePathError, method_prefix};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute fingerprints for every derivation in a closure.
///
/// `closure` must be complete: every input derivation of every member
/// is itself a member. Store path references are acyclic, so the
/// recursion terminates.
pub fn fingerprint_closure(
    dir: &StoreDirectory,
    closure: &HashMap<StorePath, Derivation>,
) -> Result<HashMap<StorePath, Fingerprint>, StorePathError> {
    let mut memo: HashMap<StorePath, Fingerprint> = HashMap::new();
    for drv_path in closure.keys() {
        fingerprint_one(dir, closure, drv_path, &mut memo)?;
    }
    Ok(memo)
}

fn fingerprint_one(
    dir: &StoreDirectory,
    closure: &HashMap<StorePath, Derivation>,
    drv_path: &StorePath,
    memo: &mut HashMap<StorePath, Fingerprint>,
) -> Result<Fingerprint, StorePathError> {
    if let Some(found) = memo.get(drv_path) {
        return Ok(found.clone());
    }

    let drv = closure
        .get(drv_path)
        .unwrap_or_else(|| panic!("closure is missing {drv_path}"));

    let fingerprint = if let Some(ca) = drv.fixed_output_ca() {
        let out_path = drv
            .output_store_path(dir, zb_store_core::derivation::DEFAULT_OUTPUT)?
            .expect("fixed outputs always have a path");
        Fingerprint(sha256(format!(
            "fixed:out:{}{}:{}:{}",
            method_prefix(ca.method()),
            ca.hash().algorithm(),
            ca.hash().to_hex(),
            dir.display_path(&out_path),
        )))
    } else {
        let mut replacements = BTreeMap::new();
        for dep in drv.input_derivations.keys() {
            let dep_fp = fingerprint_one(dir, closure, dep, memo)?;
            replacements.insert(dep.clone(), dep_fp.to_hex());
        }
        Fingerprint(sha256(drv.to_fingerprint_aterm(dir, &replacements)))
    };

    memo.insert(drv_path.clone(), fingerprint.clone());
    Ok(fingerprint)
}
