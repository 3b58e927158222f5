use crate::git;
use crate::install::{
    DependencyFiles, EnvironmentHandle, EnvironmentInstaller, InstallRequest, InterpreterVersion,
};
use crate::task::RepoIdentity;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// The three side-effecting steps of first-time setup.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn fetch_clone(&self, identity: &RepoIdentity, dest: &Path) -> anyhow::Result<()>;

    async fn checkout(&self, clone: &Path, commit: &str) -> anyhow::Result<()>;

    async fn install(
        &self,
        clone: &Path,
        env_dir: &Path,
        interpreter: InterpreterVersion,
    ) -> anyhow::Result<EnvironmentHandle>;
}

/// Clones from `<base_url>/<owner>/<name>.git` and installs with an
/// [`EnvironmentInstaller`].
pub struct GitProvisioner {
    base_url: String,
    clone_timeout: Duration,
    install_timeout: Duration,
    installer: EnvironmentInstaller,
}

impl GitProvisioner {
    pub fn new(
        base_url: impl Into<String>,
        clone_timeout: Duration,
        install_timeout: Duration,
        installer: EnvironmentInstaller,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            clone_timeout,
            install_timeout,
            installer,
        }
    }
}

#[async_trait]
impl Provisioner for GitProvisioner {
    async fn fetch_clone(&self, identity: &RepoIdentity, dest: &Path) -> anyhow::Result<()> {
        let url = identity.clone_url(&self.base_url);
        git::clone_repo(&url, dest, self.clone_timeout).await
    }

    async fn checkout(&self, clone: &Path, commit: &str) -> anyhow::Result<()> {
        git::checkout_detached(clone, commit).await?;
        git::reset_clean(clone).await
    }

    async fn install(
        &self,
        clone: &Path,
        env_dir: &Path,
        interpreter: InterpreterVersion,
    ) -> anyhow::Result<EnvironmentHandle> {
        let req = InstallRequest {
            source: clone.to_path_buf(),
            env_dir: env_dir.to_path_buf(),
            files: DependencyFiles::detect(clone),
            interpreter,
            timeout: self.install_timeout,
        };
        Ok(self.installer.install(&req).await?)
    }
}
