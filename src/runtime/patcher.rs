//! Patch discovery, dry-run, application and post-application verification.
//!
//! The sequence the orchestrator drives is strict:
//! 1. every patch is validated and conflict-checked (see `validator`, `conflicts`)
//! 2. every patch is dry-run against the pristine tree
//! 3. only then is the first patch applied for real
//!
//! Application is never retried. A half-patched tree has to be reset.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::validator::{validate_patch_application, ValidatedPatch};
use crate::error::{BuildError, Result};

/// Applies patches and auxiliary files to a runtime source tree.
pub struct RuntimePatcher {
    src_dir: PathBuf,
    patch_tool: String,
}

/// Collect `*.patch` / `*.diff` files from each directory, in directory order,
/// each directory sorted by file name. Missing directories are skipped.
pub fn discover_patches(dirs: &[&Path]) -> Result<Vec<PathBuf>> {
    let mut all = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            log::debug!("[Patch] [DISCOVER] {} does not exist, skipping", dir.display());
            continue;
        }
        let entries = fs::read_dir(dir)
            .map_err(|e| BuildError::io(format!("listing patches in {}", dir.display()), e))?;
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .map_or(false, |ext| ext == "patch" || ext == "diff")
            })
            .collect();
        found.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        log::info!(
            "[Patch] [DISCOVER] {} patch(es) in {}",
            found.len(),
            dir.display()
        );
        all.extend(found);
    }
    Ok(all)
}

impl RuntimePatcher {
    pub fn new(src_dir: PathBuf, patch_tool: impl Into<String>) -> Self {
        RuntimePatcher {
            src_dir,
            patch_tool: patch_tool.into(),
        }
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    async fn run_patch(&self, patch_path: &Path, dry_run: bool) -> std::result::Result<(), String> {
        let mut cmd = Command::new(&self.patch_tool);
        cmd.arg("-p1");
        if dry_run {
            cmd.arg("--dry-run");
        }
        cmd.arg("--batch")
            .arg("--forward")
            .arg("-i")
            .arg(patch_path)
            .current_dir(&self.src_dir)
            // Ambiguous targets must fail, not wait for an answer
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run '{}': {}", self.patch_tool, e))?;

        if output.status.success() {
            return Ok(());
        }
        let mut detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(stderr.trim());
        }
        Err(format!(
            "{} exited with {}: {}",
            self.patch_tool,
            output.status.code().map_or("signal".to_string(), |c| c.to_string()),
            detail
        ))
    }

    /// `patch -p1 --dry-run --batch --forward -i <patch>`, no tree changes.
    pub async fn test_patch_application(&self, patch: &ValidatedPatch) -> Result<()> {
        self.run_patch(&patch.path, true)
            .await
            .map_err(|reason| BuildError::PatchApplication {
                patch: patch.name.clone(),
                reason: format!("dry run failed: {}", reason),
            })
    }

    /// Dry-run every patch; stops at the first one that would not apply.
    ///
    /// Each patch is tried against the pristine tree on its own, so a patch
    /// whose hunks only match after an earlier patch in the set has been
    /// applied fails here even though [`apply_all`](Self::apply_all) would
    /// succeed. Patches must be written against the release tag.
    pub async fn dry_run_all(&self, patches: &[ValidatedPatch]) -> Result<()> {
        for patch in patches {
            self.test_patch_application(patch).await?;
            log::info!("[Patch] [DRY-RUN] ✓ {}", patch.name);
        }
        Ok(())
    }

    /// Apply one patch for real.
    pub async fn apply_patch(&self, patch: &ValidatedPatch) -> Result<()> {
        self.run_patch(&patch.path, false)
            .await
            .map_err(|reason| BuildError::PatchApplication {
                patch: patch.name.clone(),
                reason,
            })?;
        log::info!("[Patch] [APPLY] ✓ {}", patch.name);
        Ok(())
    }

    pub async fn apply_all(&self, patches: &[ValidatedPatch]) -> Result<u32> {
        let mut applied = 0u32;
        for patch in patches {
            self.apply_patch(patch).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Copy every file under `additions_dir` into the source tree at the same
    /// relative path. Returns the relative paths copied.
    pub fn copy_additions(&self, additions_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::new();
        if !additions_dir.is_dir() {
            return Ok(copied);
        }
        for relative in list_files_recursive(additions_dir)? {
            let from = additions_dir.join(&relative);
            let to = self.src_dir.join(&relative);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
            }
            fs::copy(&from, &to)
                .map_err(|e| BuildError::io(format!("copying addition {}", relative.display()), e))?;
            copied.push(relative);
        }
        log::info!("[Patch] [ADDITIONS] Copied {} file(s) into the source tree", copied.len());
        Ok(copied)
    }

    /// Check that each patch's first added line is present in its target file
    /// and that every addition landed with the right size.
    pub fn verify_modifications(
        &self,
        patches: &[ValidatedPatch],
        additions_dir: &Path,
        additions: &[PathBuf],
    ) -> Result<()> {
        for patch in patches {
            for (file, line) in &patch.analysis.first_additions {
                validate_patch_application(&self.src_dir.join(file), line).map_err(|e| {
                    BuildError::PatchApplication {
                        patch: patch.name.clone(),
                        reason: format!("{} ({})", e, file),
                    }
                })?;
            }
        }

        for relative in additions {
            let expected = fs::metadata(additions_dir.join(relative))
                .map_err(|e| BuildError::io(format!("reading addition {}", relative.display()), e))?
                .len();
            let actual = fs::metadata(self.src_dir.join(relative)).map(|m| m.len()).ok();
            if actual != Some(expected) {
                return Err(BuildError::PatchApplication {
                    patch: relative.display().to_string(),
                    reason: "addition missing or truncated in the source tree".to_string(),
                });
            }
        }

        log::info!(
            "[Patch] [VERIFY] ✓ {} patch(es) and {} addition(s) present",
            patches.len(),
            additions.len()
        );
        Ok(())
    }
}

/// Relative paths of all regular files under `root`, sorted.
pub fn list_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries =
            fs::read_dir(dir).map_err(|e| BuildError::io(format!("listing {}", dir.display()), e))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if path.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    out.push(relative.to_path_buf());
                }
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::validator::validate_patch;
    use crate::runtime::version::Version;
    use tempfile::TempDir;

    fn patch_available() -> bool {
        std::process::Command::new("patch")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    const PATCH: &str = "\
# @node-versions: v24.0.0+
--- a/src/node.cc
+++ b/src/node.cc
@@ -1,2 +1,3 @@
 int main() {
+  smol_init();
 }
";

    fn setup() -> (TempDir, PathBuf, ValidatedPatch) {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src-tree");
        fs::create_dir_all(src.join("src")).unwrap();
        fs::write(src.join("src/node.cc"), "int main() {\n}\n").unwrap();
        let patch_path = temp.path().join("001-init.patch");
        fs::write(&patch_path, PATCH).unwrap();
        let patch = validate_patch(&patch_path, &Version::new(24, 10, 0)).unwrap();
        (temp, src, patch)
    }

    #[test]
    fn test_discover_orders_static_before_dynamic() {
        let temp = TempDir::new().unwrap();
        let static_dir = temp.path().join("patches");
        let dynamic_dir = temp.path().join("build/patches");
        fs::create_dir_all(&static_dir).unwrap();
        fs::create_dir_all(&dynamic_dir).unwrap();
        for name in ["002-b.patch", "001-a.patch", "README.md"] {
            fs::write(static_dir.join(name), "x").unwrap();
        }
        fs::write(dynamic_dir.join("000-gen.diff"), "x").unwrap();

        let missing = temp.path().join("none");
        let found = discover_patches(&[
            static_dir.as_path(),
            dynamic_dir.as_path(),
            missing.as_path(),
        ])
        .unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["001-a.patch", "002-b.patch", "000-gen.diff"]);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_tree_untouched_then_apply() {
        if !patch_available() {
            eprintln!("patch not installed, skipping");
            return;
        }
        let (_temp, src, patch) = setup();
        let patcher = RuntimePatcher::new(src.clone(), "patch");

        patcher.dry_run_all(std::slice::from_ref(&patch)).await.unwrap();
        assert_eq!(fs::read_to_string(src.join("src/node.cc")).unwrap(), "int main() {\n}\n");

        assert_eq!(patcher.apply_all(std::slice::from_ref(&patch)).await.unwrap(), 1);
        assert!(fs::read_to_string(src.join("src/node.cc")).unwrap().contains("smol_init();"));
        patcher
            .verify_modifications(std::slice::from_ref(&patch), Path::new("/nonexistent"), &[])
            .unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_failure_names_patch() {
        if !patch_available() {
            eprintln!("patch not installed, skipping");
            return;
        }
        let (_temp, src, patch) = setup();
        fs::write(src.join("src/node.cc"), "something else entirely\n").unwrap();
        let patcher = RuntimePatcher::new(src, "patch");

        let err = patcher.test_patch_application(&patch).await.unwrap_err();
        match err {
            BuildError::PatchApplication { patch, reason } => {
                assert_eq!(patch, "001-init.patch");
                assert!(reason.contains("dry run failed"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dry_run_checks_each_patch_against_pristine_tree() {
        if !patch_available() {
            eprintln!("patch not installed, skipping");
            return;
        }
        let (temp, src, first) = setup();
        let stacked_path = temp.path().join("002-fast.patch");
        fs::write(
            &stacked_path,
            "\
# @node-versions: v24.0.0+
# @requires: 001-init.patch
--- a/src/node.cc
+++ b/src/node.cc
@@ -1,3 +1,3 @@
 int main() {
-  smol_init();
+  smol_init(SMOL_FAST);
 }
",
        )
        .unwrap();
        let stacked = validate_patch(&stacked_path, &Version::new(24, 10, 0)).unwrap();
        let patches = vec![first, stacked];
        let patcher = RuntimePatcher::new(src.clone(), "patch");

        match patcher.dry_run_all(&patches).await.unwrap_err() {
            BuildError::PatchApplication { patch, .. } => assert_eq!(patch, "002-fast.patch"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fs::read_to_string(src.join("src/node.cc")).unwrap(), "int main() {\n}\n");

        assert_eq!(patcher.apply_all(&patches).await.unwrap(), 2);
        assert!(fs::read_to_string(src.join("src/node.cc")).unwrap().contains("smol_init(SMOL_FAST);"));
    }

    #[test]
    fn test_verify_detects_unapplied_patch() {
        let (_temp, src, patch) = setup();
        let patcher = RuntimePatcher::new(src, "patch");
        assert!(patcher
            .verify_modifications(&[patch], Path::new("/nonexistent"), &[])
            .is_err());
    }

    #[test]
    fn test_copy_additions_and_verify() {
        let (temp, src, _) = setup();
        let additions = temp.path().join("additions");
        fs::create_dir_all(additions.join("src/smol")).unwrap();
        fs::write(additions.join("src/smol/loader.cc"), "// loader\n").unwrap();
        fs::write(additions.join("smol.gypi"), "{}\n").unwrap();

        let patcher = RuntimePatcher::new(src.clone(), "patch");
        let copied = patcher.copy_additions(&additions).unwrap();
        assert_eq!(
            copied,
            vec![PathBuf::from("smol.gypi"), PathBuf::from("src/smol/loader.cc")]
        );
        assert!(src.join("src/smol/loader.cc").exists());
        patcher.verify_modifications(&[], &additions, &copied).unwrap();

        fs::write(src.join("smol.gypi"), "").unwrap();
        assert!(patcher.verify_modifications(&[], &additions, &copied).is_err());
    }
}
