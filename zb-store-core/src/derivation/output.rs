// SPDX-License-Identifier: MIT

use crate::content_address::{ContentAddress, ContentAddressMethod};
use crate::hash::HashAlgorithm;
use crate::store_dir::StoreDirectory;
use crate::store_path::{self, StorePath, StorePathError, StoreReferences};

use super::output_path_name;

/// How a single declared output gets its store path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputSpec {
    /// The path was pre-computed from the input closure by the
    /// evaluator and is fixed before the build starts.
    InputAddressed(StorePath),
    /// The output must content-address to exactly this value; the path
    /// is a function of the output name and the content address alone.
    FixedCA(ContentAddress),
    /// The path is unknown until the build completes and is derived
    /// from the realized content hash.
    FloatingCA {
        method: ContentAddressMethod,
        algorithm: HashAlgorithm,
    },
}

impl OutputSpec {
    /// The `"<method-prefix><algo>"` string that appears in the third
    /// field of an ATerm output tuple, or `""` for input-addressed
    /// outputs.
    pub fn method_algo_string(&self) -> String {
        match self {
            OutputSpec::InputAddressed(_) => String::new(),
            OutputSpec::FixedCA(ca) => format!(
                "{}{}",
                store_path::method_prefix(ca.method()),
                ca.hash().algorithm()
            ),
            OutputSpec::FloatingCA { method, algorithm } => {
                format!("{}{}", store_path::method_prefix(*method), algorithm)
            }
        }
    }
}

/// The deterministic path of a fixed-CA output.
pub fn fixed_output_path(
    dir: &StoreDirectory,
    drv_name: &str,
    output_name: &str,
    ca: &ContentAddress,
) -> Result<StorePath, StorePathError> {
    store_path::ca_path(
        dir,
        &output_path_name(drv_name, output_name),
        ca,
        &StoreReferences::default(),
    )
}

/// Split a `"<method-prefix><algo>"` string back into its parts.
pub fn parse_method_algo(s: &str) -> Option<(ContentAddressMethod, HashAlgorithm)> {
    let (method, algo) = if let Some(rest) = s.strip_prefix("text:") {
        (ContentAddressMethod::Text, rest)
    } else if let Some(rest) = s.strip_prefix("r:") {
        (ContentAddressMethod::Recursive, rest)
    } else {
        (ContentAddressMethod::Flat, s)
    };
    Some((method, algo.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::hash::Hash;

    #[rstest]
    #[case::flat("sha256", ContentAddressMethod::Flat, HashAlgorithm::Sha256)]
    #[case::recursive("r:sha256", ContentAddressMethod::Recursive, HashAlgorithm::Sha256)]
    #[case::text("text:sha256", ContentAddressMethod::Text, HashAlgorithm::Sha256)]
    #[case::sha1("r:sha1", ContentAddressMethod::Recursive, HashAlgorithm::Sha1)]
    fn method_algo_roundtrip(
        #[case] s: &str,
        #[case] method: ContentAddressMethod,
        #[case] algorithm: HashAlgorithm,
    ) {
        assert_eq!(parse_method_algo(s), Some((method, algorithm)));
        let spec = OutputSpec::FloatingCA { method, algorithm };
        assert_eq!(spec.method_algo_string(), s);
    }

    #[test]
    fn fixed_path_depends_on_output_name() {
        let dir = StoreDirectory::default();
        let ca = ContentAddress::Flat(Hash::digest(HashAlgorithm::Sha256, "data"));
        let out = fixed_output_path(&dir, "pkg", "out", &ca).unwrap();
        let dev = fixed_output_path(&dir, "pkg", "dev", &ca).unwrap();
        assert_eq!(out.name(), "pkg");
        assert_eq!(dev.name(), "pkg-dev");
        assert_ne!(out.digest(), dev.digest());
    }
}
