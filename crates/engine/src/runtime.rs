//! Command execution inside running containers.

use std::sync::{Arc, Mutex, PoisonError};

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("exec failed: {0}")]
    ExecFailed(String),
}

/// Stdout of an exec. A non-zero exit shows up as a final `ExecFailed` item
/// after the last chunk.
pub struct ExecOutput {
    pub stdout: BoxStream<'static, Result<Vec<u8>, RuntimeError>>,
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run_in_container(
        &self,
        container_id: &str,
        command: &[String],
    ) -> Result<ExecOutput, RuntimeError>;
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("connect to docker daemon: {e}")))?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_in_container(
        &self,
        container_id: &str,
        command: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(command.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::ExecFailed(format!("create exec in {container_id}: {e}")))?;

        let output = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::ExecFailed(format!("start exec in {container_id}: {e}")))?
        {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(RuntimeError::ExecFailed("exec started detached".to_owned()))
            }
        };

        let stderr = Arc::new(Mutex::new(Vec::<u8>::new()));
        let captured = stderr.clone();
        let stdout = output.filter_map(move |item| {
            let captured = captured.clone();
            async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(message.to_vec())),
                    Ok(LogOutput::StdErr { message }) => {
                        captured
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&message);
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(RuntimeError::ExecFailed(format!("read exec output: {e}")))),
                }
            }
        });

        let docker = self.docker.clone();
        let exec_id = exec.id;
        let exit_check = stream::once(async move {
            match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => match inspect.exit_code {
                    None | Some(0) => None,
                    Some(code) => {
                        let stderr = String::from_utf8_lossy(
                            &stderr.lock().unwrap_or_else(PoisonError::into_inner),
                        )
                        .trim()
                        .to_owned();
                        Some(Err(RuntimeError::ExecFailed(format!(
                            "command exited with status {code}: {stderr}"
                        ))))
                    }
                },
                Err(e) => Some(Err(RuntimeError::ExecFailed(format!("inspect exec: {e}")))),
            }
        })
        .filter_map(future::ready);

        Ok(ExecOutput {
            stdout: stdout.chain(exit_check).boxed(),
        })
    }
}
