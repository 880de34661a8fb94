// SPDX-License-Identifier: MIT

//! Typed parameter and result shapes of the `zb.*` method set.

use serde::{Deserialize, Serialize};

pub const NOP: &str = "zb.nop";
pub const EXISTS: &str = "zb.exists";
pub const INFO: &str = "zb.info";
pub const REALIZE: &str = "zb.realize";
pub const EXPAND: &str = "zb.expand";
pub const GET_BUILD: &str = "zb.getBuild";
pub const CANCEL_BUILD: &str = "zb.cancelBuild";
pub const READ_LOG: &str = "zb.readLog";
pub const EXPORT: &str = "zb.export";
pub const IMPORT: &str = "zb.import";

/// Whether previously built realisations may stand in for a fresh
/// build: everything, or only realisations validated by one of the
/// given public keys.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReusePolicy {
    All(AllTag),
    Keys(Vec<String>),
}

/// The literal string `"all"`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllTag {
    All,
}

impl Default for ReusePolicy {
    fn default() -> Self {
        ReusePolicy::All(AllTag::All)
    }
}

impl ReusePolicy {
    pub fn allows_any(&self) -> bool {
        matches!(self, ReusePolicy::All(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExistsParams {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoParams {
    pub path: String,
}

/// Metadata of one store object, as returned by `zb.info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub nar_hash: String,
    pub nar_size: u64,
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoResult {
    pub info: Option<ObjectInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizeParams {
    pub drv_paths: Vec<String>,
    #[serde(default)]
    pub keep_failed: bool,
    #[serde(default)]
    pub reuse: ReusePolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedBuild {
    #[serde(rename = "buildID")]
    pub build_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandParams {
    pub drv_path: String,
    pub temp_dir: String,
    #[serde(default)]
    pub reuse: ReusePolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBuildParams {
    #[serde(rename = "buildID")]
    pub build_id: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Unknown,
    Active,
    Success,
    Fail,
    Error,
}

/// Outcome of one output of one derivation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub drv_path: String,
    pub output_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub status: BuildStatus,
}

/// Result of placeholder expansion (`zb.expand`): the root builder's
/// invocation with every known path substituted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandResult {
    pub builder: String,
    pub args: Vec<String>,
    pub env: std::collections::BTreeMap<String, String>,
}

/// A scheduler job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(rename = "buildID")]
    pub build_id: i64,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub results: Vec<BuildResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_result: Option<ExpandResult>,
}

impl Build {
    /// The record reported for ids the server does not know.
    pub fn unknown(build_id: i64) -> Self {
        Build {
            build_id,
            status: BuildStatus::Unknown,
            started_at: None,
            ended_at: None,
            results: Vec::new(),
            expand_result: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBuildParams {
    #[serde(rename = "buildID")]
    pub build_id: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadLogParams {
    #[serde(rename = "buildID")]
    pub build_id: i64,
    #[serde(default)]
    pub offset: u64,
}

/// Log payloads are base64 in JSON; builder output is arbitrary bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadLogResult {
    pub bytes: String,
    pub next_offset: u64,
}

impl ReadLogResult {
    pub fn encode(payload: &[u8], next_offset: u64) -> Self {
        ReadLogResult {
            bytes: data_encoding::BASE64.encode(payload),
            next_offset,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, data_encoding::DecodeError> {
        data_encoding::BASE64.decode(self.bytes.as_bytes())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    pub paths: Vec<String>,
    #[serde(default)]
    pub exclude_references: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reuse_policy_forms() {
        let all: ReusePolicy = serde_json::from_str("\"all\"").unwrap();
        assert!(all.allows_any());
        assert_eq!(serde_json::to_string(&all).unwrap(), "\"all\"");

        let keys: ReusePolicy = serde_json::from_str(r#"["key1", "key2"]"#).unwrap();
        assert!(!keys.allows_any());
        assert_eq!(keys, ReusePolicy::Keys(vec!["key1".into(), "key2".into()]));
    }

    #[test]
    fn realize_params_defaults() {
        let params: RealizeParams =
            serde_json::from_value(json!({"drvPaths": ["/opt/zb/store/a-x.drv"]})).unwrap();
        assert!(!params.keep_failed);
        assert!(params.reuse.allows_any());
    }

    #[test]
    fn build_wire_shape() {
        let build = Build {
            build_id: 3,
            status: BuildStatus::Success,
            started_at: Some(100),
            ended_at: Some(200),
            results: vec![BuildResult {
                drv_path: "/opt/zb/store/a-x.drv".into(),
                output_name: "out".into(),
                output_path: Some("/opt/zb/store/b-x".into()),
                status: BuildStatus::Success,
            }],
            expand_result: None,
        };
        let value = serde_json::to_value(&build).unwrap();
        assert_eq!(value["buildID"], 3);
        assert_eq!(value["status"], "success");
        assert_eq!(value["results"][0]["outputPath"], "/opt/zb/store/b-x");
        assert!(value.get("expandResult").is_none());

        let unknown = Build::unknown(99);
        let value = serde_json::to_value(&unknown).unwrap();
        assert_eq!(value["status"], "unknown");
    }

    #[test]
    fn read_log_payload_roundtrip() {
        let result = ReadLogResult::encode(b"raw \xff bytes", 17);
        assert_eq!(result.next_offset, 17);
        assert_eq!(result.decode().unwrap(), b"raw \xff bytes");
    }
}
