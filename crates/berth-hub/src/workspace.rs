//! Working-directory bootstrap
//!
//! Sessions name an absolute working directory; the hub makes sure it
//! exists before spawning into it. Worktree sessions get a fresh git
//! worktree added from the enclosing repository instead of a plain
//! directory.

use std::path::{Path, PathBuf};

use berth_core::error::{HubError, SessionError};
use berth_ssh::SshTunnel;

/// Prepare a local working directory
pub async fn prepare_local(dir: &Path, worktree: bool) -> Result<(), HubError> {
    if dir.exists() {
        return Ok(());
    }

    if worktree {
        let parent = worktree_parent(dir)?;
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&parent)
            .arg("worktree")
            .arg("add")
            .arg(dir)
            .output()
            .await
            .map_err(|e| directory_error(dir, format!("git worktree add: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(directory_error(
                dir,
                format!("git worktree add failed: {}", stderr.trim()),
            ));
        }
        return Ok(());
    }

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| directory_error(dir, e.to_string()))
}

/// Prepare a remote working directory over the worker's tunnel.
///
/// Expands a leading `~` against the remote `$HOME` and returns the
/// resolved absolute path to spawn with.
pub async fn prepare_remote(
    tunnel: &SshTunnel,
    dir: &Path,
    worktree: bool,
) -> Result<PathBuf, HubError> {
    let dir = expand_remote_home(tunnel, dir).await?;
    let quoted = shell_quote(&dir.to_string_lossy());

    if worktree {
        let parent = worktree_parent(&dir)?;
        let parent_quoted = shell_quote(&parent.to_string_lossy());
        // Only add the worktree if the directory is not already there
        let command = format!(
            "test -d {} || git -C {} worktree add {}",
            quoted, parent_quoted, quoted
        );
        tunnel
            .exec(&command)
            .await
            .map_err(|e| directory_error(&dir, e.to_string()))?;
    } else {
        tunnel
            .exec(&format!("mkdir -p {}", quoted))
            .await
            .map_err(|e| directory_error(&dir, e.to_string()))?;
    }

    Ok(dir)
}

/// Resolve `~`-prefixed paths against the remote home directory
async fn expand_remote_home(tunnel: &SshTunnel, dir: &Path) -> Result<PathBuf, HubError> {
    let raw = dir.to_string_lossy();
    if !raw.starts_with('~') {
        return Ok(dir.to_path_buf());
    }

    let home = tunnel
        .exec("printf %s \"$HOME\"")
        .await
        .map_err(|e| directory_error(dir, format!("$HOME discovery: {}", e)))?;
    let home = home.trim();
    if home.is_empty() {
        return Err(directory_error(dir, "remote $HOME is empty".to_string()));
    }

    let rest = raw.trim_start_matches('~').trim_start_matches('/');
    Ok(PathBuf::from(home).join(rest))
}

fn worktree_parent(dir: &Path) -> Result<PathBuf, HubError> {
    dir.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| directory_error(dir, "worktree path has no parent".to_string()))
}

fn directory_error(dir: &Path, reason: String) -> HubError {
    HubError::Session(SessionError::DirectoryCreateFailed {
        path: dir.to_path_buf(),
        reason,
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_local_creates_directory() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("nested/workdir");

        prepare_local(&dir, false).await.unwrap();
        assert!(dir.is_dir());

        // Existing directory is a no-op
        prepare_local(&dir, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_local_worktree_without_repo_fails() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("wt");

        let err = prepare_local(&dir, true).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::Session(SessionError::DirectoryCreateFailed { .. })
        ));
    }
}
