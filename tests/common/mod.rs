//! Shared fixtures for integration tests: a tagged local "upstream" repository
//! and a config whose configure/build commands are shell one-liners.

#![allow(dead_code)]

use git2::{Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};

use smol_builder::config::{BuildConfig, CliArgs, EnvSnapshot};

pub const VERSION: &str = "v24.10.0";

/// Shell script standing in for a runtime binary.
pub fn fake_node_script(version: &str) -> String {
    format!(
        "#!/bin/sh\ncase \"$1\" in\n  --version) echo {} ;;\n  -e) echo 2 ;;\n  *) echo \"args: $*\" ;;\nesac\n",
        version
    )
}

#[cfg(unix)]
pub fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, content).expect("Failed to write executable");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod");
}

/// Create a repository at `dir` with a `fake-node.sh` and a `configure`
/// placeholder, tagged `tag`.
pub fn upstream_repo(dir: &Path, tag: &str) -> PathBuf {
    let repo = Repository::init(dir).expect("Failed to init upstream repo");
    let files = [
        ("fake-node.sh", fake_node_script(VERSION)),
        ("configure", "#!/bin/sh\nexit 0\n".to_string()),
        ("lib/internal/bootstrap.js", "'use strict';\n".to_string()),
    ];
    {
        let mut index = repo.index().expect("Failed to get index");
        for (name, content) in &files {
            let path = dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).expect("Failed to write upstream file");
            index.add_path(Path::new(name)).expect("Failed to add file");
        }
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        let sig = Signature::now("Test User", "test@example.com").expect("Failed to create signature");
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "release", &tree, &[])
            .expect("Failed to commit");
        let obj = repo.find_object(oid, None).expect("Failed to find commit");
        repo.tag_lightweight(tag, &obj, false).expect("Failed to tag");
    }
    dir.to_path_buf()
}

/// Build command that produces `out/Release/node` from `fake-node.sh` and
/// appends a line to `counter` every time it runs.
pub fn fake_build_command(counter: &Path) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir -p out/Release && cp fake-node.sh out/Release/node && chmod 755 out/Release/node && echo built >> '{}'",
            counter.display()
        ),
        "build".to_string(),
    ]
}

/// Build command that always fails; proves compile was not reached.
pub fn failing_build_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo 'compile must not run' >&2; exit 3".to_string(),
    ]
}

pub fn count_builds(counter: &Path) -> usize {
    fs::read_to_string(counter)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Config rooted at `project`, cloning from `upstream`, with no host tools
/// beyond `sh` and no compression.
pub fn test_config(project: &Path, upstream: &Path, counter: &Path) -> BuildConfig {
    let args = CliArgs {
        project_root: Some(project.to_path_buf()),
        node_version: Some(VERSION.to_string()),
        skip_checks: true,
        yes: true,
        ..CliArgs::default()
    };
    let env = EnvSnapshot {
        smol_compress: Some("0".to_string()),
        ..EnvSnapshot::default()
    };
    let mut config = BuildConfig::resolve(&args, &env).expect("Failed to resolve config");
    config.repository_url = upstream.to_string_lossy().into_owned();
    config.pkg_cache_dir = project.join("pkg-cache");
    config.jobs = 2;
    config.tools.configure = vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo \"$@\" >> configure.log".to_string(),
        "configure".to_string(),
    ];
    config.tools.build = fake_build_command(counter);
    config.tools.strip = "true".to_string();
    config
}
