// src/discovery/persist.rs
//
// The on-disk bootstrap/persisted backend list: a YAML document that is a
// top-level sequence of host strings (unbracketed for IPv6), sorted and
// deduplicated.

use crate::backend::normalize;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Loads the bootstrap list from `path`. Fails if the file is missing,
/// unparseable, or yields an empty list — the system must have at least one
/// bootstrap endpoint.
pub async fn load(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading servers-config at {}", path.display()))?;

    let mut hosts: Vec<String> =
        serde_yaml::from_str(&contents).context("parsing servers-config YAML")?;

    normalize(&mut hosts);

    if hosts.is_empty() {
        bail!(
            "servers-config at {} is empty; at least one bootstrap endpoint is required",
            path.display()
        );
    }

    Ok(hosts)
}

/// Writes `hosts` (sorted, deduplicated by the caller) to `path` as a plain
/// YAML sequence. Not atomic: a crash mid-write may leave a partial file,
/// which is acceptable because the next successful refresh rewrites it.
pub async fn save(path: &Path, hosts: &[String]) -> Result<()> {
    let encoded = serde_yaml::to_string(hosts).context("encoding servers-config YAML")?;
    tokio::fs::write(path, encoded)
        .await
        .with_context(|| format!("writing servers-config at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hacox-persist-test-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn load_fails_on_missing_file() {
        let path = tmp_path("missing.yaml");
        let _ = tokio::fs::remove_file(&path).await;
        assert!(load(&path).await.is_err());
    }

    #[tokio::test]
    async fn load_fails_on_empty_list() {
        let path = tmp_path("empty.yaml");
        tokio::fs::write(&path, "[]\n").await.unwrap();
        assert!(load(&path).await.is_err());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn load_sorts_and_dedupes() {
        let path = tmp_path("dup.yaml");
        tokio::fs::write(&path, "- 10.0.0.2\n- 10.0.0.1\n- 10.0.0.1\n")
            .await
            .unwrap();
        let hosts = load(&path).await.unwrap();
        assert_eq!(hosts, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let path = tmp_path("roundtrip.yaml");
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        save(&path, &hosts).await.unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, hosts);
        tokio::fs::remove_file(&path).await.ok();
    }
}
