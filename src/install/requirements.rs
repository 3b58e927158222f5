use super::{run_step, EnvironmentHandle, InstallRequest, InstallStrategy, InterpreterVersion, Step};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// `uv venv` followed by the plain pip recipe from the declared files.
pub struct RequirementsStrategy {
    min_version: InterpreterVersion,
}

impl RequirementsStrategy {
    pub fn new(min_version: InterpreterVersion) -> Self {
        Self { min_version }
    }
}

#[async_trait]
impl InstallStrategy for RequirementsStrategy {
    fn name(&self) -> &'static str {
        "uv-pip"
    }

    fn applies(&self, req: &InstallRequest) -> Result<(), String> {
        if req.interpreter.cmp_minor(&self.min_version) == Ordering::Less {
            return Err(format!(
                "uv cannot provision python {} (minimum {})",
                req.interpreter, self.min_version
            ));
        }
        Ok(())
    }

    async fn install(&self, req: &InstallRequest) -> anyhow::Result<EnvironmentHandle> {
        let deadline = tokio::time::Instant::now() + req.timeout;
        let env = BTreeMap::new();
        let env_dir = req.env_dir.to_string_lossy().to_string();
        run_step(
            Step {
                program: "uv",
                args: vec![
                    "venv".to_string(),
                    "--seed".to_string(),
                    "--python".to_string(),
                    req.interpreter.to_string(),
                    env_dir,
                ],
                cwd: &req.source,
                env: &env,
            },
            deadline,
        )
        .await?;

        let python = req.python_path().to_string_lossy().to_string();
        for step in req.files.recipe_steps() {
            let mut args = vec![
                "pip".to_string(),
                "install".to_string(),
                "--python".to_string(),
                python.clone(),
            ];
            args.extend(step);
            run_step(
                Step {
                    program: "uv",
                    args,
                    cwd: &req.source,
                    env: &env,
                },
                deadline,
            )
            .await?;
        }
        Ok(EnvironmentHandle::new(req, self.name(), req.interpreter))
    }
}
