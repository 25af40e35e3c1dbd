//! Extension discovery.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::manifest::{MANIFEST_FILE, Manifest};

use super::types::ExtensionSource;

/// An extension found on disk with a valid manifest.
#[derive(Debug, Clone)]
pub struct DiscoveredExtension {
    /// Install directory.
    pub path: PathBuf,
    pub manifest: Manifest,
    pub source: ExtensionSource,
}

/// Scan a directory for extensions
///
/// Looks for `extension.json` manifest files in immediate subdirectories.
/// A missing directory yields nothing. Unreadable or invalid manifests are
/// logged and skipped.
///
/// # Example
/// ```text
/// extensions/
/// ├── git-tools/
/// │   ├── extension.json  <- Found
/// │   └── dist/
/// │       └── extension.js
/// └── notes/
///     └── README.md       <- Skipped, no manifest
/// ```
pub async fn scan_directory(dir: &Path, source: ExtensionSource) -> Vec<DiscoveredExtension> {
    let mut discovered = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Skipping extensions directory {}: {}", dir.display(), e);
            return discovered;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Error reading {}: {}", dir.display(), e);
                break;
            }
        };
        let path = entry.path();

        if !path.is_dir() {
            continue;
        }

        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            continue;
        }

        match load_manifest(&manifest_path).await {
            Ok(manifest) => {
                tracing::debug!("Discovered extension: {} at {}", manifest.id(), path.display());
                let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);
                discovered.push(DiscoveredExtension {
                    path,
                    manifest,
                    source,
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load extension manifest at {}: {}",
                    manifest_path.display(),
                    e
                );
            }
        }
    }

    // Directory iteration order is platform dependent.
    discovered.sort_by(|a, b| a.path.cmp(&b.path));
    discovered
}

async fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let content = tokio::fs::read_to_string(path).await?;
    let raw: Value = serde_json::from_str(&content)?;
    Ok(Manifest::parse(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_extension(root: &Path, dir: &str, manifest: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let found = scan_directory(&dir.path().join("nope"), ExtensionSource::User).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_bad_manifest_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        write_extension(
            dir.path(),
            "good",
            r#"{"name":"good","version":"1.0.0","main":"main.js","engines":{"breadcrumb":"*"}}"#,
        );
        write_extension(dir.path(), "broken", "{ not json");
        write_extension(
            dir.path(),
            "future",
            r#"{"name":"future","version":"1.0.0","main":"main.js","engines":{"breadcrumb":"^2.0.0"}}"#,
        );
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("stray.json"), "{}").unwrap();

        let found = scan_directory(dir.path(), ExtensionSource::Workspace).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.name, "good");
        assert_eq!(found[0].source, ExtensionSource::Workspace);
        assert!(found[0].path.is_absolute());
    }
}
