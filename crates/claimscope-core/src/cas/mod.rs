//! Artifact persistence on top of a content-addressed store.

pub mod fs;

pub use fs::FsCasStore;

use claimscope_state::{ArtifactRecord, CasStore, RunId, StorageError, StorageResult};

use crate::harness::ArtifactPayload;

/// Write each payload to `cas` and describe it with an [`ArtifactRecord`].
pub async fn store_artifacts(
    cas: &dyn CasStore,
    run_id: &RunId,
    payloads: &[ArtifactPayload],
) -> StorageResult<Vec<ArtifactRecord>> {
    let mut records = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let digest = cas.put(&payload.data).await?;
        let record = ArtifactRecord::new(
            run_id.clone(),
            payload.name.clone(),
            payload.content_type.clone(),
            &payload.data,
        );
        if record.sha256 != digest {
            return Err(StorageError::InvalidDigest {
                digest: digest.to_string(),
            });
        }
        records.push(record);
    }
    Ok(records)
}

/// Re-hash the stored bytes and compare with the record.
pub async fn verify_artifact(cas: &dyn CasStore, record: &ArtifactRecord) -> StorageResult<bool> {
    let data = cas.get(&record.sha256).await?;
    Ok(record.matches(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claimscope_state::MemoryCasStore;

    #[tokio::test]
    async fn stored_artifacts_verify() {
        let cas = MemoryCasStore::new();
        let run_id = RunId::new();
        let payloads = vec![ArtifactPayload {
            name: "report.json".to_string(),
            content_type: "application/json".to_string(),
            data: br#"{"score":0.96}"#.to_vec(),
        }];

        let records = store_artifacts(&cas, &run_id, &payloads).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, format!("cas://{}", records[0].sha256));
        assert_eq!(records[0].bytes, 14);
        assert!(verify_artifact(&cas, &records[0]).await.unwrap());

        let mut tampered = records[0].clone();
        tampered.bytes = 3;
        assert!(!verify_artifact(&cas, &tampered).await.unwrap());
    }
}
