use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use outpost_domain::{DeploymentId, Digest};
use tracing::debug;

use crate::error::WfmError;

/// Verify that `bytes` hash to `expected`. Mismatch is an integrity error.
pub fn verify_digest(bytes: &[u8], expected: &Digest) -> Result<(), WfmError> {
    let actual = Digest::sha256(bytes);
    if &actual != expected {
        return Err(WfmError::Integrity(format!(
            "digest mismatch: expected {}, computed {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Extract a tar.gz bundle whose entries are `<deploymentId>.yaml`.
///
/// Entries that do not follow that naming are ignored: a bundle may carry
/// files unreferenced by the manifest's deployment list.
pub fn extract_bundle(bytes: &[u8]) -> Result<HashMap<DeploymentId, Vec<u8>>, WfmError> {
    let gz = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);
    let mut out = HashMap::new();

    let entries = archive
        .entries()
        .map_err(|e| WfmError::Integrity(format!("read bundle archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| WfmError::Integrity(format!("read bundle entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| WfmError::Integrity(format!("bundle entry path: {}", e)))?
            .into_owned();

        let Some(stem) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".yaml"))
        else {
            debug!(path = %path.display(), "ignoring non-deployment bundle entry");
            continue;
        };
        let Ok(id) = DeploymentId::parse(stem) else {
            debug!(path = %path.display(), "ignoring bundle entry with non-uuid name");
            continue;
        };

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| WfmError::Integrity(format!("read bundle entry {}: {}", path.display(), e)))?;
        out.insert(id, content);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use uuid::Uuid;

    fn build_bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let enc = GzEncoder::new(Vec::new(), Compression::fast());
        let mut tar = tar::Builder::new(enc);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, name, *content).unwrap();
        }
        tar.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_deployment_yamls_by_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let bundle = build_bundle(&[
            (&format!("{}.yaml", a), b"kind: AppDeployment # a"),
            (&format!("{}.yaml", b), b"kind: AppDeployment # b"),
            ("README.md", b"not a deployment"),
            ("notes.yaml", b"not a uuid"),
        ]);

        let extracted = extract_bundle(&bundle).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(
            extracted.get(&DeploymentId::new(a)).unwrap(),
            b"kind: AppDeployment # a"
        );
        assert_eq!(
            extracted.get(&DeploymentId::new(b)).unwrap(),
            b"kind: AppDeployment # b"
        );
    }

    #[test]
    fn digest_verification_accepts_and_rejects() {
        let bundle = build_bundle(&[("x.yaml", b"y")]);
        let good = Digest::sha256(&bundle);
        verify_digest(&bundle, &good).unwrap();

        let bad = Digest::sha256(b"something else");
        let err = verify_digest(&bundle, &bad).unwrap_err();
        assert!(matches!(err, WfmError::Integrity(_)));
    }

    #[test]
    fn truncated_bundle_is_an_integrity_error() {
        let bundle = build_bundle(&[("x.yaml", b"y")]);
        let truncated = &bundle[..bundle.len() / 2];
        assert!(extract_bundle(truncated).is_err());
    }
}
