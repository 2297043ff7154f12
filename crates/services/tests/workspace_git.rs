//! Integration tests for the workspace manager against the real `git` binary.

use std::{path::Path, process::Command, time::Duration};

use db::models::git_credential::GitCredentialType;
use services::services::{
    config::GitProxyConfig,
    credentials::GitCredentialInfo,
    workspace::{WorkspaceError, WorkspaceManager},
};
use tempfile::TempDir;
use uuid::Uuid;

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@test.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@test.com")
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// A source repository with one commit on `main`.
fn init_origin(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "initial commit"]);
}

fn manager(base: &Path) -> WorkspaceManager {
    WorkspaceManager::new(base.to_str().unwrap(), Duration::from_secs(30))
}

fn no_proxy() -> GitProxyConfig {
    GitProxyConfig::default()
}

#[tokio::test]
async fn get_or_create_makes_and_reuses_workspaces() {
    let temp = TempDir::new().unwrap();
    let manager = manager(&temp.path().join("workspaces"));
    let task_id = Uuid::new_v4();

    let first = manager.get_or_create(task_id, None).await.unwrap();
    assert!(first.is_dir());
    let dir_name = first.file_name().unwrap().to_string_lossy().to_string();
    assert!(dir_name.starts_with(&format!("task-{task_id}-")));

    let reused = manager
        .get_or_create(task_id, first.to_str())
        .await
        .unwrap();
    assert_eq!(reused, first);

    // a recorded path that no longer exists gets replaced
    let missing = temp.path().join("gone");
    let fresh = manager
        .get_or_create(task_id, missing.to_str())
        .await
        .unwrap();
    assert_ne!(fresh, missing);
    assert!(fresh.is_dir());
}

#[cfg(unix)]
#[tokio::test]
async fn workspace_dirs_are_world_writable() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let base = temp.path().join("workspaces");
    let manager = manager(&base);
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();

    for dir in [&base, &workspace] {
        let mode = std::fs::metadata(dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777, "dir {} mode {mode:o}", dir.display());
    }
}

#[tokio::test]
async fn clone_without_credential_and_skip_on_existing_repo() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    init_origin(&origin);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    assert!(!manager.has_git_repo(&workspace));

    manager
        .clone_repository(
            &workspace,
            origin.to_str().unwrap(),
            "main",
            None,
            true,
            &no_proxy(),
        )
        .await
        .unwrap();
    assert!(manager.has_git_repo(&workspace));
    assert!(workspace.join("README.md").is_file());
}

#[tokio::test]
async fn clone_with_url_credential_requires_http_scheme() {
    let temp = TempDir::new().unwrap();
    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    let credential = GitCredentialInfo {
        cred_type: GitCredentialType::Token,
        username: String::new(),
        password: "tok".into(),
        private_key: String::new(),
        public_key: String::new(),
    };

    let err = manager
        .clone_repository(
            &workspace,
            "/local/path/repo",
            "main",
            Some(&credential),
            true,
            &no_proxy(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkspaceError::InvalidUrl(_) | WorkspaceError::InvalidUrlScheme(_)
    ));
}

#[tokio::test]
async fn commit_returns_hash_and_rejects_clean_tree() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    init_origin(&origin);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    manager
        .clone_repository(&workspace, origin.to_str().unwrap(), "main", None, true, &no_proxy())
        .await
        .unwrap();

    // clean tree: nothing to commit
    let err = manager.commit(&workspace, "empty").await.unwrap_err();
    assert!(matches!(err, WorkspaceError::NothingToCommit));

    std::fs::write(workspace.join("agent.txt"), "generated\n").unwrap();
    let hash = manager.commit(&workspace, "agent changes").await.unwrap();
    assert_eq!(hash.len(), 40);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    assert!(!manager.is_dirty(&workspace).await.unwrap());
}

#[tokio::test]
async fn reset_clean_drops_tracked_and_untracked_changes() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    init_origin(&origin);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    manager
        .clone_repository(&workspace, origin.to_str().unwrap(), "main", None, true, &no_proxy())
        .await
        .unwrap();

    std::fs::write(workspace.join("README.md"), "modified\n").unwrap();
    std::fs::write(workspace.join("untracked.txt"), "junk\n").unwrap();
    assert!(manager.is_dirty(&workspace).await.unwrap());

    manager.reset_clean(&workspace).await.unwrap();
    assert!(!manager.is_dirty(&workspace).await.unwrap());
    assert_eq!(std::fs::read_to_string(workspace.join("README.md")).unwrap(), "hello\n");
    assert!(!workspace.join("untracked.txt").exists());
}

#[tokio::test]
async fn reset_clean_recreates_non_repo_workspaces() {
    let temp = TempDir::new().unwrap();
    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    std::fs::write(workspace.join("leftover.txt"), "junk\n").unwrap();

    manager.reset_clean(&workspace).await.unwrap();
    assert!(workspace.is_dir());
    assert_eq!(std::fs::read_dir(&workspace).unwrap().count(), 0);
}

#[tokio::test]
async fn is_dirty_errors_on_non_repo() {
    let temp = TempDir::new().unwrap();
    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();

    assert!(matches!(
        manager.is_dirty(&workspace).await.unwrap_err(),
        WorkspaceError::NotAGitRepository(_)
    ));
    assert!(matches!(
        manager.is_dirty(&temp.path().join("missing")).await.unwrap_err(),
        WorkspaceError::MissingWorkspace(_)
    ));
}

#[tokio::test]
async fn ensure_branch_creates_then_reuses() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    init_origin(&origin);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    manager
        .clone_repository(&workspace, origin.to_str().unwrap(), "main", None, true, &no_proxy())
        .await
        .unwrap();

    assert!(!manager.branch_exists(&workspace, "feature-x").await.unwrap());
    manager
        .ensure_branch(&workspace, "feature-x", "main", &no_proxy())
        .await
        .unwrap();
    assert!(manager.branch_exists(&workspace, "feature-x").await.unwrap());

    // second call switches to the existing branch instead of failing
    manager
        .ensure_branch(&workspace, "feature-x", "main", &no_proxy())
        .await
        .unwrap();
}

#[tokio::test]
async fn push_to_local_bare_origin() {
    let temp = TempDir::new().unwrap();
    let bare = temp.path().join("origin.git");
    std::fs::create_dir_all(&bare).unwrap();
    git(&bare, &["init", "--bare", "-b", "main"]);

    // seed the bare origin with an initial commit
    let seed = temp.path().join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    init_origin(&seed);
    git(&seed, &["remote", "add", "origin", bare.to_str().unwrap()]);
    git(&seed, &["push", "origin", "main"]);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    manager
        .clone_repository(&workspace, bare.to_str().unwrap(), "main", None, true, &no_proxy())
        .await
        .unwrap();

    std::fs::write(workspace.join("change.txt"), "pushed\n").unwrap();
    manager.commit(&workspace, "change").await.unwrap();

    manager
        .push(
            &workspace,
            "main",
            bare.to_str().unwrap(),
            None,
            true,
            &no_proxy(),
            false,
        )
        .await
        .unwrap();

    // the bare origin now has the commit
    let log = Command::new("git")
        .args(["log", "--oneline", "main"])
        .current_dir(&bare)
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&log.stdout).contains("change"));
}

#[tokio::test]
async fn push_rejects_missing_branch() {
    let temp = TempDir::new().unwrap();
    let origin = temp.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    init_origin(&origin);

    let manager = manager(&temp.path().join("workspaces"));
    let workspace = manager.get_or_create(Uuid::new_v4(), None).await.unwrap();
    manager
        .clone_repository(&workspace, origin.to_str().unwrap(), "main", None, true, &no_proxy())
        .await
        .unwrap();

    let err = manager
        .push(
            &workspace,
            "does-not-exist",
            origin.to_str().unwrap(),
            None,
            true,
            &no_proxy(),
            false,
        )
        .await
        .unwrap_err();
    match err {
        WorkspaceError::PushFailed(msg) => assert!(msg.contains("does not exist")),
        other => panic!("unexpected error: {other}"),
    }
}
