//! `ExecReq` / `ExecResp`: the unit of RPC between client and server.
//!
//! The compiler-flag parsing and fingerprinting that *produce* an
//! `ExecReq` are out of scope (spec §1) — this module only defines the
//! shape the rest of the core consumes and returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::requester_info::RequesterInfo;

/// A single compile request, already assembled by the (out-of-scope)
/// compiler-flag parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReq {
    pub compiler_path: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub input_paths: Vec<String>,
    /// Stable fingerprint of the compiler binary, from the out-of-scope
    /// compiler-info lookup (spec §1 (b)).
    pub compiler_fingerprint: String,
    pub requester_info: RequesterInfo,
    pub trace_id: String,
}

/// Where an `ExecResp`'s content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheHit {
    None,
    LocalOutputCache,
    RemoteCache,
}

impl Default for CacheHit {
    fn default() -> Self {
        CacheHit::None
    }
}

/// A single output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub is_executable: bool,
}

/// The result of executing an `ExecReq`, whether served remotely, from the
/// local cache (spec §4.G), or via local fallback (spec §4.F).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResp {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub output: Vec<OutputFile>,
    pub cache_hit: CacheHit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_default_is_none() {
        assert_eq!(CacheHit::default(), CacheHit::None);
    }

    #[test]
    fn exec_resp_round_trips_through_json() {
        let resp = ExecResp {
            exit_status: 0,
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
            output: vec![OutputFile {
                filename: "a.o".into(),
                content: vec![1, 2, 3],
                is_executable: false,
            }],
            cache_hit: CacheHit::LocalOutputCache,
        };
        let json = serde_json::to_string(&resp).expect("serialize");
        let back: ExecResp = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.output.len(), 1);
        assert_eq!(back.cache_hit, CacheHit::LocalOutputCache);
    }
}
