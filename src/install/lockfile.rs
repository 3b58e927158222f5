use super::{run_step, EnvironmentHandle, InstallRequest, InstallStrategy, InterpreterVersion, Step};
use anyhow::anyhow;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// `uv sync --frozen` against a committed `uv.lock`.
pub struct UvLockStrategy {
    min_version: InterpreterVersion,
}

impl UvLockStrategy {
    pub fn new(min_version: InterpreterVersion) -> Self {
        Self { min_version }
    }
}

#[async_trait]
impl InstallStrategy for UvLockStrategy {
    fn name(&self) -> &'static str {
        "uv-lock"
    }

    fn applies(&self, req: &InstallRequest) -> Result<(), String> {
        if req.files.lock_file.is_none() {
            return Err("no uv.lock in checkout".to_string());
        }
        if req.interpreter.cmp_minor(&self.min_version) == Ordering::Less {
            return Err(format!(
                "python {} is older than uv minimum {}",
                req.interpreter, self.min_version
            ));
        }
        Ok(())
    }

    async fn install(&self, req: &InstallRequest) -> anyhow::Result<EnvironmentHandle> {
        let deadline = tokio::time::Instant::now() + req.timeout;
        let mut env = BTreeMap::new();
        env.insert(
            "UV_PROJECT_ENVIRONMENT".to_string(),
            req.env_dir.to_string_lossy().to_string(),
        );
        run_step(
            Step {
                program: "uv",
                args: vec![
                    "sync".to_string(),
                    "--frozen".to_string(),
                    "--all-extras".to_string(),
                    "--python".to_string(),
                    req.interpreter.to_string(),
                ],
                cwd: &req.source,
                env: &env,
            },
            deadline,
        )
        .await?;

        let python = req.python_path();
        if !python.exists() {
            return Err(anyhow!(
                "uv sync finished but {} is missing",
                python.display()
            ));
        }
        Ok(EnvironmentHandle::new(req, self.name(), req.interpreter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::DependencyFiles;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(lock: bool, version: &str) -> InstallRequest {
        InstallRequest {
            source: PathBuf::from("/src"),
            env_dir: PathBuf::from("/env"),
            files: DependencyFiles {
                lock_file: lock.then(|| PathBuf::from("/src/uv.lock")),
                ..DependencyFiles::default()
            },
            interpreter: version.parse().unwrap(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn needs_lock_file_and_modern_python() {
        let strategy = UvLockStrategy::new("3.8".parse().unwrap());
        assert!(strategy.applies(&request(true, "3.11")).is_ok());
        assert!(strategy.applies(&request(true, "3.8.10")).is_ok());
        assert!(strategy.applies(&request(false, "3.11")).is_err());
        let reason = strategy.applies(&request(true, "3.6")).unwrap_err();
        assert!(reason.contains("older"));
    }
}
