//! Native git management using the `git2` crate.
//!
//! Source acquisition fetches exactly one tag, shallow when the transport
//! allows it, and checks it out detached. Reusing an existing checkout means a
//! hard reset plus removal of untracked and ignored files, so every build
//! starts from the pristine tag.

use git2::build::CheckoutBuilder;
use git2::{FetchOptions, Oid, RemoteCallbacks, Repository, ResetType, Status, StatusOptions};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during git operations
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Checkout error: {0}")]
    Checkout(String),

    #[error("Reference not found: {0}")]
    RefNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git2 error: {0}")]
    Git2(#[from] git2::Error),
}

pub type GitResult<T> = Result<T, GitError>;

/// List tag names on a remote without cloning it.
///
/// Peeled entries (`^{}`) are folded into their tag.
pub fn list_remote_tags(url: &str) -> GitResult<Vec<String>> {
    let temp_dir = tempfile::tempdir()?;
    let repo = Repository::init_bare(temp_dir.path()).map_err(|e| {
        GitError::Repository(format!("Failed to create temporary repository: {}", e))
    })?;
    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|e| GitError::Repository(format!("Failed to add remote {}: {}", url, e)))?;
    remote
        .connect(git2::Direction::Fetch)
        .map_err(|e| GitError::Fetch(format!("Failed to connect to {}: {}", url, e)))?;

    let refs = remote.list().map_err(|e| {
        GitError::Fetch(format!("Failed to list remote references for {}: {}", url, e))
    })?;

    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for reference in refs {
        if let Some(tag) = reference.name().strip_prefix("refs/tags/") {
            let tag = tag.strip_suffix("^{}").unwrap_or(tag);
            if seen.insert(tag.to_string()) {
                tags.push(tag.to_string());
            }
        }
    }
    log::debug!("[Git] [LS-REMOTE] {} tag(s) at {}", tags.len(), url);
    Ok(tags)
}

/// Whether `url` publishes `tag`.
pub fn remote_has_tag(url: &str, tag: &str) -> GitResult<bool> {
    Ok(list_remote_tags(url)?.iter().any(|t| t == tag))
}

/// A runtime source checkout.
pub struct GitManager {
    repo_path: PathBuf,
}

impl GitManager {
    /// Open an existing checkout.
    pub fn open(repo_path: impl AsRef<Path>) -> GitResult<Self> {
        let repo_path = repo_path.as_ref().to_path_buf();
        Repository::open(&repo_path).map_err(|e| {
            GitError::Repository(format!(
                "Failed to open repository at {}: {}",
                repo_path.display(),
                e
            ))
        })?;
        Ok(GitManager { repo_path })
    }

    /// Whether `path` holds a git repository.
    pub fn is_repository(path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    /// Fetch `tag` from `url` into a fresh repository at `target_path` and
    /// check it out.
    ///
    /// Tries a depth-1 fetch first; transports without shallow support
    /// (local paths, some mirrors) fall back to a full fetch of the tag.
    pub fn clone_tag(url: &str, tag: &str, target_path: impl AsRef<Path>) -> GitResult<Self> {
        let target_path = target_path.as_ref();
        std::fs::create_dir_all(target_path)?;
        let repo = Repository::init(target_path)?;
        repo.remote("origin", url)
            .map_err(|e| GitError::Repository(format!("Failed to add remote {}: {}", url, e)))?;

        log::info!("[Git] [CLONE] Fetching {} from {} (depth=1)", tag, url);
        if let Err(shallow_err) = fetch_tag(&repo, tag, Some(1)) {
            log::warn!(
                "[Git] [CLONE] Shallow fetch failed ({}), falling back to full fetch",
                shallow_err
            );
            fetch_tag(&repo, tag, None)?;
        }

        let manager = GitManager {
            repo_path: target_path.to_path_buf(),
        };
        manager.checkout(tag)?;
        log::info!("[Git] [CLONE] ✓ Checked out {} at {}", tag, target_path.display());
        Ok(manager)
    }

    fn repo(&self) -> GitResult<Repository> {
        Repository::open(&self.repo_path)
            .map_err(|e| GitError::Repository(format!("Failed to open repository: {}", e)))
    }

    fn resolve_commit(repo: &Repository, reference: &str) -> GitResult<Oid> {
        let candidates = [format!("refs/tags/{}", reference), reference.to_string()];
        for candidate in &candidates {
            if let Ok(obj) = repo.revparse_single(candidate) {
                let commit = obj
                    .peel_to_commit()
                    .map_err(|e| GitError::RefNotFound(format!("{} is not a commit: {}", reference, e)))?;
                return Ok(commit.id());
            }
        }
        Err(GitError::RefNotFound(format!(
            "Failed to resolve reference '{}'",
            reference
        )))
    }

    /// Force-checkout a tag, branch or commit and detach HEAD there.
    pub fn checkout(&self, reference: &str) -> GitResult<()> {
        let repo = self.repo()?;
        let oid = Self::resolve_commit(&repo, reference)?;
        let obj = repo.find_object(oid, None)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(&obj, Some(&mut checkout))
            .map_err(|e| GitError::Checkout(format!("Failed to check out {}: {}", reference, e)))?;
        repo.set_head_detached(oid)
            .map_err(|e| GitError::Checkout(format!("Failed to set HEAD: {}", e)))?;
        Ok(())
    }

    /// Full HEAD commit id.
    pub fn get_head_commit(&self) -> GitResult<String> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .map_err(|e| GitError::Repository(format!("Failed to read HEAD: {}", e)))?;
        let commit = head
            .peel_to_commit()
            .map_err(|e| GitError::Repository(format!("HEAD is not a commit: {}", e)))?;
        Ok(commit.id().to_string())
    }

    /// Whether HEAD sits on `tag`.
    pub fn head_matches(&self, tag: &str) -> bool {
        let Ok(repo) = self.repo() else {
            return false;
        };
        match (Self::resolve_commit(&repo, tag), self.get_head_commit()) {
            (Ok(oid), Ok(head)) => oid.to_string() == head,
            _ => false,
        }
    }

    /// Paths that differ from HEAD, including untracked and ignored files.
    pub fn dirty_paths(&self) -> GitResult<Vec<PathBuf>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(true)
            .recurse_ignored_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter(|s| s.status() != Status::CURRENT)
            .filter_map(|s| s.path().map(PathBuf::from))
            .collect())
    }

    /// Hard reset to `reference` and delete untracked and ignored files.
    ///
    /// Returns how many extra files were removed.
    pub fn reset_pristine(&self, reference: &str) -> GitResult<u32> {
        let repo = self.repo()?;
        let oid = Self::resolve_commit(&repo, reference)?;
        let obj = repo.find_object(oid, None)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(&obj, ResetType::Hard, Some(&mut checkout))
            .map_err(|e| GitError::Checkout(format!("Failed to reset to {}: {}", reference, e)))?;
        repo.set_head_detached(oid)?;

        // Untracked directories come back as one entry so they go in one call
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(false)
            .include_ignored(true)
            .recurse_ignored_dirs(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut removed = 0u32;
        for entry in statuses.iter() {
            let status = entry.status();
            if !(status.contains(Status::WT_NEW) || status.contains(Status::IGNORED)) {
                continue;
            }
            let Some(relative) = entry.path() else {
                continue;
            };
            let path = self.repo_path.join(relative);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(GitError::Io(e)),
            }
        }
        log::info!(
            "[Git] [RESET] Reset to {} and removed {} untracked/ignored path(s)",
            reference,
            removed
        );
        Ok(removed)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}

fn fetch_tag(repo: &Repository, tag: &str, depth: Option<i32>) -> GitResult<()> {
    let mut remote = repo.find_remote("origin")?;

    let mut callbacks = RemoteCallbacks::new();
    let mut last_percent = 0u32;
    callbacks.transfer_progress(move |progress| {
        let total = progress.total_objects();
        if total > 0 {
            let percent = (progress.received_objects() as f32 / total as f32 * 100.0) as u32;
            if percent >= last_percent + 10 {
                last_percent = percent;
                log::debug!(
                    "[Git] [FETCH] {}/{} objects ({}%)",
                    progress.received_objects(),
                    total,
                    percent
                );
            }
        }
        true
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        fetch_options.depth(depth);
    }

    let refspec = format!("+refs/tags/{tag}:refs/tags/{tag}", tag = tag);
    remote
        .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
        .map_err(|e| GitError::Fetch(format!("Failed to fetch {}: {}", tag, e)))?;
    Ok(())
}
