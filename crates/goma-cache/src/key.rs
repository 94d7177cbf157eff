//! Key derivation (spec §4.G): normalize the request so two clients in
//! different working directories produce the same key, serialize, hash.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use goma_proto::ExecReq;

/// Flags whose next argument is an absolute path that must be stripped
/// before hashing (spec §2 supplement, grounded on `gomacc_common.cc`'s
/// `RBE_exec_root`-style path substitution). Kept small and explicit
/// rather than guessing at every compiler's flag set.
const PATH_STRIPPED_FLAGS: &[&str] = &["-I", "-isystem", "-iquote", "-resource-dir"];

#[derive(Serialize)]
struct NormalizedReq<'a> {
    compiler_fingerprint: &'a str,
    args: Vec<String>,
    env: BTreeMap<&'a str, &'a str>,
    input_paths_count: usize,
}

/// Strips the absolute-path argument that follows any of
/// [`PATH_STRIPPED_FLAGS`], and leaves everything else untouched. No
/// debug-prefix-map rewriting is applied (spec §2 supplement: "no
/// debug-prefix-map").
fn normalize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if PATH_STRIPPED_FLAGS.contains(&arg.as_str()) {
            out.push(arg.clone());
            skip_next = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Env vars that legitimately vary across invocations without changing
/// the compiler's output and so must not perturb the key.
const ENV_KEYS_EXCLUDED_FROM_KEY: &[&str] = &["PWD", "TMPDIR", "HOME"];

pub fn derive_key(req: &ExecReq) -> String {
    let env: BTreeMap<&str, &str> = req
        .env
        .iter()
        .filter(|(k, _)| !ENV_KEYS_EXCLUDED_FROM_KEY.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let normalized = NormalizedReq {
        compiler_fingerprint: &req.compiler_fingerprint,
        args: normalize_args(&req.args),
        env,
        input_paths_count: req.input_paths.len(),
    };

    let bytes = bincode::serialize(&normalized).expect("NormalizedReq is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use goma_proto::RequesterInfo;

    fn req(cwd: &str) -> ExecReq {
        ExecReq {
            compiler_path: "/usr/bin/clang".into(),
            args: vec!["-c".into(), "-I".into(), format!("{cwd}/include"), "main.cc".into()],
            cwd: cwd.into(),
            env: BTreeMap::new(),
            input_paths: vec!["main.cc".into()],
            compiler_fingerprint: "clang-18.0".into(),
            requester_info: RequesterInfo::default(),
            trace_id: "t1".into(),
        }
    }

    #[test]
    fn same_fingerprint_and_args_different_cwd_produce_same_key() {
        let a = derive_key(&req("/home/alice/project"));
        let b = derive_key(&req("/home/bob/checkout"));
        assert_eq!(a, b, "only the -I path differs, and it's stripped");
    }

    #[test]
    fn key_is_64_hex_chars() {
        let key = derive_key(&req("/tmp/x"));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_fingerprint_changes_the_key() {
        let mut r1 = req("/tmp/x");
        let mut r2 = req("/tmp/x");
        r1.compiler_fingerprint = "clang-17.0".into();
        r2.compiler_fingerprint = "clang-18.0".into();
        assert_ne!(derive_key(&r1), derive_key(&r2));
    }
}
