// SPDX-License-Identifier: MIT

//! System triples.
//!
//! A derivation's `system` field names the platform its builder runs on:
//! `arch[-vendor]-os[-env]`. The parser accepts 2-, 3-, and 4-component
//! forms plus the Cygwin/MinGW shorthands; components outside the known
//! constant sets are carried through lexically with vendor/env `unknown`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KNOWN_ARCHES: &[&str] = &[
    "i386", "i486", "i586", "i686", "x86_64", "arm", "aarch64", "riscv32", "riscv64",
];
const KNOWN_VENDORS: &[&str] = &["pc", "apple", "unknown"];
const KNOWN_OSES: &[&str] = &["linux", "macos", "darwin", "ios", "windows"];
const KNOWN_ENVS: &[&str] = &[
    "gnu", "musl", "msvc", "cygnus", "android", "androideabi", "unknown",
];

#[derive(Debug, Eq, PartialEq, Error)]
pub enum SystemError {
    #[error("empty system string")]
    Empty,
    #[error("system {0:?} has too many components")]
    TooManyComponents(String),
}

/// A parsed system triple. All four components are always populated;
/// absent vendor/env parse as `unknown`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct System {
    pub arch: String,
    pub vendor: String,
    pub os: String,
    pub env: String,
}

impl System {
    /// The triple of the machine this binary was compiled for, in the
    /// fixed form derivations use.
    pub fn current() -> System {
        let arch = std::env::consts::ARCH;
        let os = match std::env::consts::OS {
            "macos" => "macos",
            other => other,
        };
        format!("{arch}-{os}").parse().expect("host triple is well-formed")
    }

    fn known_env(s: &str) -> bool {
        KNOWN_ENVS.contains(&s)
    }

    fn known_vendor(s: &str) -> bool {
        KNOWN_VENDORS.contains(&s)
    }

    fn known_os(s: &str) -> bool {
        KNOWN_OSES.contains(&s)
    }

    fn known_arch(s: &str) -> bool {
        KNOWN_ARCHES.contains(&s)
    }

    /// Resolve the Cygwin/MinGW shorthands into `windows` plus an env.
    fn expand_os(os: &str) -> (String, Option<String>) {
        match os {
            "cygwin" => ("windows".into(), Some("cygnus".into())),
            "mingw32" | "mingw64" | "mingw" => ("windows".into(), Some("gnu".into())),
            other => (other.into(), None),
        }
    }
}

impl FromStr for System {
    type Err = SystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.iter().any(|p| p.is_empty()) || s.is_empty() {
            return Err(SystemError::Empty);
        }

        let (arch, vendor, os, env) = match parts.as_slice() {
            [arch, os] => (arch.to_string(), None, os.to_string(), None),
            [arch, second, third] => {
                // `arch-vendor-os` vs `arch-os-env`: prefer the reading
                // whose components are known constants.
                if Self::known_vendor(second) || (!Self::known_os(second) && Self::known_os(third))
                {
                    (arch.to_string(), Some(second.to_string()), third.to_string(), None)
                } else if Self::known_os(second) || Self::known_env(third) {
                    (arch.to_string(), None, second.to_string(), Some(third.to_string()))
                } else {
                    (arch.to_string(), Some(second.to_string()), third.to_string(), None)
                }
            }
            [arch, vendor, os, env] => (
                arch.to_string(),
                Some(vendor.to_string()),
                os.to_string(),
                Some(env.to_string()),
            ),
            [_] | [] => return Err(SystemError::Empty),
            _ => return Err(SystemError::TooManyComponents(s.to_string())),
        };

        let (os, implied_env) = Self::expand_os(&os);
        let env = env.or(implied_env).unwrap_or_else(|| "unknown".into());
        let vendor = vendor.unwrap_or_else(|| {
            if Self::known_arch(&arch) && os == "windows" {
                "pc".into()
            } else if os == "macos" || os == "darwin" || os == "ios" {
                "apple".into()
            } else {
                "unknown".into()
            }
        });

        Ok(System { arch, vendor, os, env })
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.arch, self.vendor, self.os, self.env)
    }
}

impl TryFrom<String> for System {
    type Error = SystemError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<System> for String {
    fn from(s: System) -> String {
        s.to_string()
    }
}
