//! In-pod repository cloner.
//!
//! Runs after a successful readiness wait when the project has a repository
//! configured. The clone happens inside the agent pod; authentication uses
//! the `GITHUB_TOKEN` already present in the pod environment, so the token
//! never appears on a command line.

use crate::cluster::{Cluster, ExecOutput};
use crate::error::{Error, Result};
use crate::render::names;
use tracing::{info, warn};

/// Directory inside the agent container where the repository lives
pub const WORKSPACE_DIR: &str = "/workspace";
/// Checkout directory under the workspace
pub const REPO_DIR: &str = "repo";

/// Credential helper that answers with the token from the environment
const GIT_CREDENTIALS: &str =
    "!f() { echo username=x-access-token; echo password=$GITHUB_TOKEN; }; f";

/// Build the shell command that clones or fast-forwards the repository.
///
/// Idempotent: when the checkout already tracks `repo_url` it is updated in
/// place; anything else is wiped and cloned fresh.
pub fn clone_argv(repo_url: &str) -> Vec<String> {
    let url = shell_quote(repo_url);
    let script = format!(
        "set -e\n\
         mkdir -p {dir}\n\
         cd {dir}\n\
         if [ -d {repo}/.git ] && [ \"$(git -C {repo} remote get-url origin)\" = {url} ]; then\n\
           git -C {repo} -c credential.helper='{helper}' pull --ff-only\n\
         else\n\
           rm -rf {repo}\n\
           git -c credential.helper='{helper}' clone {url} {repo}\n\
         fi",
        dir = WORKSPACE_DIR,
        repo = REPO_DIR,
        url = url,
        helper = GIT_CREDENTIALS,
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Execute the clone inside the project's pod.
///
/// A non-zero exit is reported as `CloneFailed`; the caller records it on
/// the project without leaving the active state.
pub async fn clone_into_pod(
    cluster: &dyn Cluster,
    namespace: &str,
    project_id: &str,
    repo_url: &str,
) -> Result<ExecOutput> {
    let selector = names::pod_selector(project_id);
    let argv = clone_argv(repo_url);

    info!(project_id, repo_url, "cloning repository into pod");
    let output = cluster.exec_in_pod(namespace, &selector, &argv).await?;

    if output.success() {
        info!(project_id, "repository clone finished");
        Ok(output)
    } else {
        warn!(
            project_id,
            exit_code = output.exit_code,
            stderr = %output.stderr.trim(),
            "repository clone failed"
        );
        Err(Error::CloneFailed(format!(
            "git exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

/// Quote a string for POSIX sh
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
