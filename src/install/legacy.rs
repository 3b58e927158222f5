use super::{run_step, EnvironmentHandle, InstallRequest, InstallStrategy, InterpreterVersion, Step};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Builds the requested interpreter with pyenv, then a stdlib venv on top of it.
///
/// Last resort for interpreters uv cannot provision; also used when the uv
/// strategies fail for newer ones.
pub struct PyenvStrategy {
    build_env: BTreeMap<String, String>,
}

impl PyenvStrategy {
    pub fn new(build_env: BTreeMap<String, String>) -> Self {
        Self { build_env }
    }
}

/// Newest stable release in `pyenv install --list` output matching `want`.
///
/// An exact patch in `want` is honoured when listed.
pub fn pick_release(list_output: &str, want: &InterpreterVersion) -> Option<InterpreterVersion> {
    let Ok(re) = Regex::new(r"^\s*(\d+)\.(\d+)\.(\d+)\s*$") else {
        return None;
    };
    let mut releases = list_output.lines().filter_map(|line| {
        let caps = re.captures(line)?;
        Some(InterpreterVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: Some(caps[3].parse().ok()?),
        })
    });
    match want.patch {
        Some(_) => releases.find(|v| v == want),
        None => releases
            .filter(|v| v.major == want.major && v.minor == want.minor)
            .max_by_key(|v| v.patch),
    }
}

#[async_trait]
impl InstallStrategy for PyenvStrategy {
    fn name(&self) -> &'static str {
        "pyenv"
    }

    fn applies(&self, _req: &InstallRequest) -> Result<(), String> {
        Ok(())
    }

    async fn install(&self, req: &InstallRequest) -> anyhow::Result<EnvironmentHandle> {
        let deadline = tokio::time::Instant::now() + req.timeout;
        let no_env = BTreeMap::new();
        let pyenv = |args: &[&str]| Step {
            program: "pyenv",
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: &req.source,
            env: &no_env,
        };

        let root = run_step(pyenv(&["root"]), deadline)
            .await
            .context("pyenv is not available")?;
        let listing = run_step(pyenv(&["install", "--list"]), deadline).await?;
        let release = pick_release(&listing, &req.interpreter)
            .ok_or_else(|| anyhow!("pyenv has no release for python {}", req.interpreter))?;
        let release_str = release.to_string();

        tracing::info!(python = %release_str, "building interpreter with pyenv");
        run_step(
            Step {
                program: "pyenv",
                args: vec![
                    "install".to_string(),
                    "--skip-existing".to_string(),
                    "-v".to_string(),
                    release_str.clone(),
                ],
                cwd: &req.source,
                env: &self.build_env,
            },
            deadline,
        )
        .await?;
        run_step(pyenv(&["rehash"]), deadline).await?;

        let base_python: PathBuf = PathBuf::from(root.trim())
            .join("versions")
            .join(&release_str)
            .join("bin")
            .join("python");
        if !base_python.exists() {
            return Err(anyhow!(
                "pyenv reported success but {} is missing",
                base_python.display()
            ));
        }
        let base_python = base_python.to_string_lossy().to_string();
        run_step(
            Step {
                program: &base_python,
                args: vec![
                    "-m".to_string(),
                    "venv".to_string(),
                    req.env_dir.to_string_lossy().to_string(),
                ],
                cwd: &req.source,
                env: &no_env,
            },
            deadline,
        )
        .await?;

        let venv_python = req.python_path().to_string_lossy().to_string();
        for step in req.files.recipe_steps() {
            let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
            args.extend(step);
            run_step(
                Step {
                    program: &venv_python,
                    args,
                    cwd: &req.source,
                    env: &no_env,
                },
                deadline,
            )
            .await?;
        }
        Ok(EnvironmentHandle::new(req, self.name(), release))
    }
}
