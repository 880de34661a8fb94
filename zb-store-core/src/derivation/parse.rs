// SPDX-License-Identifier: MIT

//! Parser for the canonical ATerm encoding.
//!
//! Parsing runs in two phases: a `nom` grammar pass that recovers the
//! raw string fields, then a typing pass that parses store paths,
//! content addresses, and method strings and rejects duplicates. The
//! split keeps the grammar readable and the error messages concrete.

use std::collections::{BTreeMap, BTreeSet};

use nom::IResult;
use nom::bytes::complete::tag;
use nom::character::complete::char as chr;
use nom::combinator::all_consuming;
use nom::multi::separated_list0;
use nom::sequence::{delimited, preceded, terminated, tuple};
use thiserror::Error;

use crate::aterm;
use crate::content_address::ContentAddress;
use crate::hash::Hash;
use crate::store_dir::StoreDirectory;
use crate::store_path::StorePathError;

use super::output::{OutputSpec, parse_method_algo};
use super::{Derivation, DerivationError};

#[derive(Debug, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("derivation syntax error near byte {0}")]
    Syntax(usize),
    #[error("derivation is truncated")]
    Incomplete,
    #[error("duplicate output {0:?}")]
    DuplicateOutput(String),
    #[error("duplicate input derivation {0:?}")]
    DuplicateInputDerivation(String),
    #[error("duplicate output {1:?} of input derivation {0:?}")]
    DuplicateInputDerivationOutput(String, String),
    #[error("duplicate input source {0:?}")]
    DuplicateInputSource(String),
    #[error("duplicate environment variable {0:?}")]
    DuplicateEnv(String),
    #[error("output {0:?}: inconsistent content-address fields")]
    BadOutputFields(String),
    #[error("output {0:?}: {1}")]
    BadOutputHash(String, String),
    #[error("bad store path {0:?}: {1}")]
    BadStorePath(String, StorePathError),
    #[error(transparent)]
    Invalid(DerivationError),
}

struct RawDerivation {
    outputs: Vec<(String, String, String, String)>,
    input_derivations: Vec<(String, Vec<String>)>,
    input_sources: Vec<String>,
    system: String,
    builder: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

fn output_tuple(i: &[u8]) -> IResult<&[u8], (String, String, String, String)> {
    delimited(
        chr('('),
        tuple((
            terminated(aterm::string_field, chr(',')),
            terminated(aterm::string_field, chr(',')),
            terminated(aterm::string_field, chr(',')),
            aterm::string_field,
        )),
        chr(')'),
    )(i)
}

fn input_derivation_tuple(i: &[u8]) -> IResult<&[u8], (String, Vec<String>)> {
    delimited(
        chr('('),
        tuple((
            terminated(aterm::string_field, chr(',')),
            aterm::string_list,
        )),
        chr(')'),
    )(i)
}

fn env_tuple(i: &[u8]) -> IResult<&[u8], (String, String)> {
    delimited(
        chr('('),
        tuple((
            terminated(aterm::string_field, chr(',')),
            aterm::string_field,
        )),
        chr(')'),
    )(i)
}

fn raw_derivation(i: &[u8]) -> IResult<&[u8], RawDerivation> {
    let (i, (outputs, input_derivations, input_sources, system, builder, args, env)) = preceded(
        tag("Derive"),
        delimited(
            chr('('),
            tuple((
                terminated(
                    delimited(chr('['), separated_list0(chr(','), output_tuple), chr(']')),
                    chr(','),
                ),
                terminated(
                    delimited(
                        chr('['),
                        separated_list0(chr(','), input_derivation_tuple),
                        chr(']'),
                    ),
                    chr(','),
                ),
                terminated(aterm::string_list, chr(',')),
                terminated(aterm::string_field, chr(',')),
                terminated(aterm::string_field, chr(',')),
                terminated(aterm::string_list, chr(',')),
                delimited(chr('['), separated_list0(chr(','), env_tuple), chr(']')),
            )),
            chr(')'),
        ),
    )(i)?;

    Ok((
        i,
        RawDerivation {
            outputs,
            input_derivations,
            input_sources,
            system,
            builder,
            args,
            env,
        },
    ))
}

fn type_output(
    dir: &StoreDirectory,
    name: &str,
    path: &str,
    method_algo: &str,
    hash_hex: &str,
) -> Result<(OutputSpec, Option<String>), ParseError> {
    match (method_algo.is_empty(), hash_hex.is_empty()) {
        // Input-addressed: path present, no content-address fields.
        (true, true) => {
            let store_path = dir
                .parse(path)
                .map_err(|e| ParseError::BadStorePath(path.to_string(), e))?;
            Ok((OutputSpec::InputAddressed(store_path), None))
        }
        // Fixed: method+algo and digest, path must match them.
        (false, false) => {
            let (method, algorithm) = parse_method_algo(method_algo)
                .ok_or_else(|| ParseError::BadOutputFields(name.to_string()))?;
            let hash = Hash::parse_digest(algorithm, hash_hex)
                .map_err(|e| ParseError::BadOutputHash(name.to_string(), e.to_string()))?;
            let ca = ContentAddress::from_method(method, hash);
            Ok((OutputSpec::FixedCA(ca), Some(path.to_string())))
        }
        // Floating: method+algo only, path unknown until the build.
        (false, true) => {
            if !path.is_empty() {
                return Err(ParseError::BadOutputFields(name.to_string()));
            }
            let (method, algorithm) = parse_method_algo(method_algo)
                .ok_or_else(|| ParseError::BadOutputFields(name.to_string()))?;
            Ok((OutputSpec::FloatingCA { method, algorithm }, None))
        }
        (true, false) => Err(ParseError::BadOutputFields(name.to_string())),
    }
}

/// Parse canonical bytes into a [Derivation] with an empty name, plus
/// the declared paths of fixed outputs for later verification.
pub(super) fn parse(
    dir: &StoreDirectory,
    bytes: &[u8],
) -> Result<(Derivation, BTreeMap<String, String>), ParseError> {
    let raw = match all_consuming(raw_derivation)(bytes) {
        Ok((_, raw)) => raw,
        Err(nom::Err::Incomplete(_)) => return Err(ParseError::Incomplete),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            return Err(ParseError::Syntax(bytes.len() - e.input.len()));
        }
    };

    let mut outputs = BTreeMap::new();
    let mut declared_fixed_paths = BTreeMap::new();
    for (name, path, method_algo, hash_hex) in &raw.outputs {
        let (spec, declared_path) = type_output(dir, name, path, method_algo, hash_hex)?;
        if outputs.insert(name.clone(), spec).is_some() {
            return Err(ParseError::DuplicateOutput(name.clone()));
        }
        if let Some(p) = declared_path {
            declared_fixed_paths.insert(name.clone(), p);
        }
    }

    let mut input_derivations = BTreeMap::new();
    for (path, output_names) in &raw.input_derivations {
        let store_path = dir
            .parse(path)
            .map_err(|e| ParseError::BadStorePath(path.clone(), e))?;
        let mut names = BTreeSet::new();
        for output_name in output_names {
            if !names.insert(output_name.clone()) {
                return Err(ParseError::DuplicateInputDerivationOutput(
                    path.clone(),
                    output_name.clone(),
                ));
            }
        }
        if input_derivations.insert(store_path, names).is_some() {
            return Err(ParseError::DuplicateInputDerivation(path.clone()));
        }
    }

    let mut input_sources = BTreeSet::new();
    for path in &raw.input_sources {
        let store_path = dir
            .parse(path)
            .map_err(|e| ParseError::BadStorePath(path.clone(), e))?;
        if !input_sources.insert(store_path) {
            return Err(ParseError::DuplicateInputSource(path.clone()));
        }
    }

    let mut env = BTreeMap::new();
    for (key, value) in raw.env {
        if env.contains_key(&key) {
            return Err(ParseError::DuplicateEnv(key));
        }
        env.insert(key, value);
    }

    Ok((
        Derivation {
            name: String::new(),
            system: raw.system,
            builder: raw.builder,
            args: raw.args,
            env,
            input_sources,
            input_derivations,
            outputs,
        },
        declared_fixed_paths,
    ))
}
