//! On-disk record shape (spec §4.G `save`): `{stdout, stderr, [(filename,
//! bytes, exec-bit)]}`, bincode-encoded. Exit status rides along too since
//! `lookup` has to rebuild a complete `ExecResp`.

use serde::{Deserialize, Serialize};

use goma_proto::{CacheHit, ExecResp, OutputFile};

#[derive(Serialize, Deserialize)]
pub(crate) struct Record {
    pub(crate) exit_status: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) outputs: Vec<(String, Vec<u8>, bool)>,
}

impl Record {
    pub(crate) fn from_resp(resp: &ExecResp) -> Self {
        Record {
            exit_status: resp.exit_status,
            stdout: resp.stdout.clone(),
            stderr: resp.stderr.clone(),
            outputs: resp
                .output
                .iter()
                .map(|f| (f.filename.clone(), f.content.clone(), f.is_executable))
                .collect(),
        }
    }

    pub(crate) fn into_resp(self) -> ExecResp {
        ExecResp {
            exit_status: self.exit_status,
            stdout: self.stdout,
            stderr: self.stderr,
            output: self
                .outputs
                .into_iter()
                .map(|(filename, content, is_executable)| OutputFile { filename, content, is_executable })
                .collect(),
            cache_hit: CacheHit::LocalOutputCache,
        }
    }
}
