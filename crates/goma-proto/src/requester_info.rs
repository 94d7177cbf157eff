//! `RequesterInfo`: environment propagated onto every outgoing `ExecReq`.
//!
//! Grounded in `gomacc_common.cc`'s `SetRequesterInfo()`: a fixed set of
//! environment variables is read once at process start and attached to
//! every request so the remote side can make scheduling/caching decisions
//! (cache silo, platform) without re-deriving them per request.

use serde::{Deserialize, Serialize};

/// Environment variables read by the core (spec §6).
const ENV_KEYS: &[&str] = &[
    "RBE_exec_root",
    "RBE_platform",
    "RBE_cache_silo",
    "AUTONINJA_BUILD_ID",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequesterInfo {
    pub pid: u32,
    pub exec_root: Option<String>,
    pub platform: Option<String>,
    pub cache_silo: Option<String>,
    pub build_id: Option<String>,
    /// `PATH` (and on Windows `PATHEXT`) at process start, propagated so the
    /// remote side can resolve the same compiler the local proxy would.
    pub path: Option<String>,
    pub pathext: Option<String>,
}

impl RequesterInfo {
    /// Build from the current process environment, matching the constant
    /// env-key list of spec §6 exactly (`ENV_KEYS` plus `PATH`/`PATHEXT`).
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key).ok())
    }

    /// Testable variant: takes a lookup function instead of the real
    /// environment so tests don't depend on process-global state.
    pub fn from_env_fn(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut info = RequesterInfo {
            pid: std::process::id(),
            exec_root: lookup(ENV_KEYS[0]),
            platform: lookup(ENV_KEYS[1]),
            cache_silo: lookup(ENV_KEYS[2]),
            build_id: lookup(ENV_KEYS[3]),
            path: lookup("PATH"),
            pathext: None,
        };
        if cfg!(windows) {
            info.pathext = lookup("PATHEXT");
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn from_env_fn_picks_up_known_keys_only() {
        let mut env = HashMap::new();
        env.insert("RBE_exec_root".to_string(), "/src".to_string());
        env.insert("RBE_platform".to_string(), "linux".to_string());
        env.insert("UNRELATED".to_string(), "ignored".to_string());

        let info = RequesterInfo::from_env_fn(|k| env.get(k).cloned());
        assert_eq!(info.exec_root.as_deref(), Some("/src"));
        assert_eq!(info.platform.as_deref(), Some("linux"));
        assert_eq!(info.cache_silo, None);
    }

    #[test]
    fn pathext_only_propagated_on_windows() {
        let info = RequesterInfo::from_env_fn(|k| {
            if k == "PATHEXT" {
                Some(".EXE".to_string())
            } else {
                None
            }
        });
        if cfg!(windows) {
            assert_eq!(info.pathext.as_deref(), Some(".EXE"));
        } else {
            assert_eq!(info.pathext, None);
        }
    }
}
