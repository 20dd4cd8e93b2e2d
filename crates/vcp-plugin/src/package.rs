//! Plugin package staging.
//!
//! Archives are unpacked into a temporary directory inside the plugin
//! directory and only renamed into place after the manifest and entry file
//! check out. Dropping a [`StagedPackage`] removes everything it extracted.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

use vcp_core::{Result, VcpError};

use crate::manifest::{MANIFEST_FILE, PluginManifest};

pub const MAX_ENTRIES: usize = 4096;
pub const MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;

fn rejected(reason: impl Into<String>) -> VcpError {
    VcpError::Package(reason.into())
}

/// An unpacked, validated package waiting to be committed.
#[derive(Debug)]
pub struct StagedPackage {
    pub manifest: PluginManifest,
    dir: TempDir,
}

impl StagedPackage {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Move the staged tree to `dest`. `dest` must not exist.
    pub fn commit(self, dest: &Path) -> Result<PathBuf> {
        if dest.exists() {
            return Err(rejected(format!("install target {} already exists", dest.display())));
        }
        std::fs::rename(self.dir.path(), dest)?;
        debug!(dest = ?dest, "package committed");
        Ok(dest.to_path_buf())
    }
}

fn staging_dir(plugin_dir: &Path) -> Result<TempDir> {
    std::fs::create_dir_all(plugin_dir)?;
    Ok(tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(plugin_dir)?)
}

/// Unpack a zip archive and validate its manifest.
pub fn extract(bytes: &[u8], plugin_dir: &Path) -> Result<StagedPackage> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| rejected(format!("not a zip archive: {e}")))?;
    if archive.len() > MAX_ENTRIES {
        return Err(rejected(format!(
            "archive has {} entries (limit {MAX_ENTRIES})",
            archive.len()
        )));
    }

    let staging = staging_dir(plugin_dir)?;
    let mut total: u64 = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| rejected(format!("corrupt entry #{i}: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(rejected(format!("entry '{}' escapes the package root", entry.name())));
        };
        let out = staging.path().join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let budget = MAX_UNPACKED_BYTES - total;
        let mut file = File::create(&out)?;
        let written = std::io::copy(&mut (&mut entry).take(budget + 1), &mut file)?;
        total += written;
        if total > MAX_UNPACKED_BYTES {
            return Err(rejected(format!(
                "archive unpacks to more than {MAX_UNPACKED_BYTES} bytes"
            )));
        }
    }

    let manifest = validate_staged(staging.path())?;
    info!(plugin = %manifest.name, version = %manifest.version, entries = archive.len(), bytes = total, "package extracted");
    Ok(StagedPackage {
        manifest,
        dir: staging,
    })
}

/// Copy an unpacked plugin directory into staging and validate it.
/// Symlinks are skipped.
pub fn stage_directory(src: &Path, plugin_dir: &Path) -> Result<StagedPackage> {
    let staging = staging_dir(plugin_dir)?;
    let mut count = 0usize;
    let mut total = 0u64;
    copy_tree(src, staging.path(), &mut count, &mut total)?;
    let manifest = validate_staged(staging.path())?;
    Ok(StagedPackage {
        manifest,
        dir: staging,
    })
}

fn copy_tree(src: &Path, dest: &Path, count: &mut usize, total: &mut u64) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        *count += 1;
        if *count > MAX_ENTRIES {
            return Err(rejected(format!("package has more than {MAX_ENTRIES} entries")));
        }
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target, count, total)?;
        } else if file_type.is_file() {
            *total += std::fs::copy(entry.path(), &target)?;
            if *total > MAX_UNPACKED_BYTES {
                return Err(rejected(format!(
                    "package is larger than {MAX_UNPACKED_BYTES} bytes"
                )));
            }
        }
    }
    Ok(())
}

fn validate_staged(root: &Path) -> Result<PluginManifest> {
    let manifest_path = root.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(rejected(format!("missing {MANIFEST_FILE} at the package root")));
    }
    let manifest = PluginManifest::from_path(&manifest_path)?;

    let main = root.join(&manifest.main);
    if !main.is_file() {
        return Err(rejected(format!("entry file '{}' not found", manifest.main)));
    }
    if manifest.checksum.is_some() && !manifest.verify_checksum(&std::fs::read(&main)?) {
        return Err(rejected(format!("checksum mismatch for '{}'", manifest.main)));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const MANIFEST: &[u8] =
        br#"{"manifestVersion":"1.0.0","name":"notes","version":"1.0.0","main":"dist/index.js"}"#;

    fn leftover(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_extracts_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[("manifest.json", MANIFEST), ("dist/index.js", b"main()")]);
        let staged = extract(&zip, dir.path()).unwrap();
        assert_eq!(staged.manifest.name, "notes");
        let dest = staged.commit(&dir.path().join("notes")).unwrap();
        assert!(dest.join("dist/index.js").is_file());
        assert_eq!(leftover(dir.path()), 1);
    }

    #[test]
    fn test_missing_entry_file_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[("manifest.json", MANIFEST)]);
        let err = extract(&zip, dir.path()).unwrap_err();
        assert!(matches!(err, VcpError::Package(_)));
        assert_eq!(leftover(dir.path()), 0);
    }

    #[test]
    fn test_invalid_manifest_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[
            ("manifest.json", br#"{"manifestVersion":"1.0.0","name":"Bad Name","version":"1.0.0","main":"a.js"}"#),
            ("a.js", b""),
        ]);
        assert!(matches!(
            extract(&zip, dir.path()).unwrap_err(),
            VcpError::ManifestValidation(_)
        ));
        assert_eq!(leftover(dir.path()), 0);
    }

    #[test]
    fn test_zip_slip_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        let zip = build_zip(&[
            ("manifest.json", MANIFEST),
            ("dist/index.js", b""),
            ("../../escaped.txt", b"gotcha"),
        ]);
        assert!(matches!(
            extract(&zip, &plugins).unwrap_err(),
            VcpError::Package(_)
        ));
        assert!(!dir.path().join("escaped.txt").exists());
        assert_eq!(leftover(&plugins), 0);
    }

    #[test]
    fn test_garbage_is_not_a_package() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract(b"definitely not a zip", dir.path()).unwrap_err(),
            VcpError::Package(_)
        ));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = format!(
            r#"{{"manifestVersion":"1.0.0","name":"notes","version":"1.0.0","main":"a.js","checksum":"{}"}}"#,
            blake3::hash(b"expected").to_hex()
        );
        let zip = build_zip(&[("manifest.json", manifest.as_bytes()), ("a.js", b"tampered")]);
        let err = extract(&zip, dir.path()).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_stages_directories() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("manifest.json"), MANIFEST).unwrap();
        std::fs::create_dir_all(src.path().join("dist")).unwrap();
        std::fs::write(src.path().join("dist/index.js"), b"main()").unwrap();

        let plugins = tempfile::tempdir().unwrap();
        let staged = stage_directory(src.path(), plugins.path()).unwrap();
        assert!(staged.path().join("dist/index.js").is_file());
    }
}
