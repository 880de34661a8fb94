// SPDX-License-Identifier: MIT

//! Placeholders for store paths that are not yet known.
//!
//! A floating-output derivation cannot embed its own output path before
//! the build, so the evaluator embeds a placeholder instead: `/` followed
//! by 32 base-32 characters, the same width as a store path digest. The
//! scheduler substitutes the real path right before handing the
//! derivation to the sandbox.
//!
//! The digest is the SHA-256 of a preimage naming the output, XOR-folded
//! to 20 bytes like a store path digest so the rendered form has the
//! fixed width the rest of the system relies on.

use std::fmt;

use crate::base32;
use crate::hash::sha256;
use crate::store_path::{StorePath, compress_hash, DIGEST_SIZE, ENCODED_DIGEST_SIZE};

/// A stand-in for a not-yet-known store path.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Placeholder {
    digest: [u8; DIGEST_SIZE],
}

impl Placeholder {
    fn from_preimage(preimage: &str) -> Self {
        Placeholder {
            digest: compress_hash(&sha256(preimage)),
        }
    }

    /// Placeholder for an output of the derivation currently being
    /// evaluated or built. Preimage: `nix-output:<outputName>`.
    pub fn own_output(output_name: &str) -> Self {
        Self::from_preimage(&format!("nix-output:{output_name}"))
    }

    /// Placeholder for an output of an input derivation. Preimage:
    /// `nix-upstream-output:<drvDigest>:<drvName>[-<outputName>]`, where
    /// the drv name has its `.drv` suffix removed and the output name is
    /// appended unless it is `out`.
    pub fn upstream_output(drv_path: &StorePath, output_name: &str) -> Self {
        let drv_name = drv_path.name().strip_suffix(".drv").unwrap_or(drv_path.name());
        let preimage = if output_name == "out" {
            format!("nix-upstream-output:{}:{}", drv_path.digest_string(), drv_name)
        } else {
            format!(
                "nix-upstream-output:{}:{}-{}",
                drv_path.digest_string(),
                drv_name,
                output_name
            )
        };
        Self::from_preimage(&preimage)
    }

    /// True if `s` has the shape of a rendered placeholder.
    pub fn looks_like(s: &str) -> bool {
        s.len() == 1 + ENCODED_DIGEST_SIZE
            && s.starts_with('/')
            && base32::is_valid(&s.as_bytes()[1..])
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", base32::encode(&self.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::Placeholder;
    use crate::store_path::StorePath;

    #[test]
    fn shape() {
        let p = Placeholder::own_output("out").to_string();
        assert_eq!(p.len(), 33);
        assert!(Placeholder::looks_like(&p));
        assert!(!Placeholder::looks_like("/opt/zb/store"));
        assert!(!Placeholder::looks_like("x1rz4g4znpzjwh1xymhjpm42vipw92pr7"));
    }

    #[test]
    fn distinct_outputs_distinct_placeholders() {
        assert_ne!(Placeholder::own_output("out"), Placeholder::own_output("dev"));
    }

    #[test]
    fn upstream_depends_on_drv_and_output() {
        let a: StorePath = "g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo.drv".parse().unwrap();
        let b: StorePath = "00bgd045z0d4icpbc2yyz4gx48ak44la-foo.drv".parse().unwrap();
        let pa = Placeholder::upstream_output(&a, "out");
        assert_ne!(pa, Placeholder::upstream_output(&b, "out"));
        assert_ne!(pa, Placeholder::upstream_output(&a, "lib"));
        // The default output omits its name from the preimage, so it
        // differs from an explicit non-default name.
        assert_ne!(
            Placeholder::upstream_output(&a, "out"),
            Placeholder::upstream_output(&a, "out-"),
        );
    }
}
