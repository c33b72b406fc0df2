//! Scheduler commands over a [`RemoteShell`].

use std::sync::Arc;

use multicri_core::error::{CriError, Result};

use super::job::{
    parse_accounting_status, parse_control_status, parse_submission, JobConfig, JobReference,
    JobStatus, STDERR_FILE, STDOUT_FILE,
};
use crate::log::{ContainerLogger, LogStream};
use crate::transport::{CommandOutput, RemoteShell};

const SCRIPT_MODE: i32 = 0o755;

/// Slurm operations for one container: every command's output goes to the
/// container log unless it is a status query.
pub struct SlurmClient {
    shell: Arc<dyn RemoteShell>,
    logger: ContainerLogger,
}

impl SlurmClient {
    pub fn new(shell: Arc<dyn RemoteShell>, logger: ContainerLogger) -> Self {
        Self { shell, logger }
    }

    pub fn shell(&self) -> &Arc<dyn RemoteShell> {
        &self.shell
    }

    /// Run a command; a non-zero exit is a transport error carrying the
    /// command and its stderr.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = self.shell.run(command).await?;
        self.logger.append(LogStream::Stdout, &output.stdout)?;
        self.logger.append(LogStream::Stderr, &output.stderr)?;
        if !output.success() {
            return Err(CriError::transport(command, output.stderr_str().trim()));
        }
        Ok(output)
    }

    /// Like [`exec`](Self::exec) but keeps the container log clean.
    pub async fn query(&self, command: &str) -> Result<CommandOutput> {
        let output = self.shell.run(command).await?;
        if !output.success() {
            return Err(CriError::transport(command, output.stderr_str().trim()));
        }
        Ok(output)
    }

    /// Upload `contents` as an executable script.
    pub async fn upload_script(&self, contents: String, destination: &str) -> Result<()> {
        tracing::debug!(destination = %destination, "Uploading script");
        self.shell
            .upload(contents.into_bytes(), destination, SCRIPT_MODE)
            .await
    }

    /// Upload the job scripts and submit the job.
    pub async fn submit(&self, job: &JobConfig) -> Result<JobReference> {
        self.upload_script(job.batch_script()?, &job.batch_script_path())
            .await?;
        if let Some(prerun) = job.prerun_script() {
            self.upload_script(prerun, &job.prerun_script_path()).await?;
        }
        self.upload_script(job.launcher_script(), &job.script).await?;

        let output = self.exec(&format!("bash {}", job.script)).await?;
        let reference = parse_submission(&output.stdout_str())?;
        tracing::info!(job_id = reference.0, path = %job.path, "Submitted batch job");
        Ok(reference)
    }

    pub async fn cancel(&self, job: JobReference) -> Result<()> {
        self.exec(&format!("scancel {}", job.0)).await?;
        Ok(())
    }

    /// Current job status: the live controller first, accounting when the
    /// controller has already forgotten the job.
    pub async fn status(&self, job: JobReference) -> Result<JobStatus> {
        let control = format!("scontrol show jobid -dd {}", job.0);
        let control_result = match self.query(&control).await {
            Ok(output) => parse_control_status(&output.stdout_str()),
            Err(e) => Err(e),
        };
        match control_result {
            Ok(status) => Ok(status),
            Err(e) => {
                tracing::debug!(job_id = job.0, error = %e, "Controller lookup failed, using accounting");
                let accounting = format!(
                    "sacct -p -n -j {} -o start,end,exitcode,state,comment",
                    job.0
                );
                let output = self.query(&accounting).await?;
                parse_accounting_status(&output.stdout_str())
            }
        }
    }

    /// Copy the job's captured stderr and stdout into the container log.
    pub async fn fetch_logs(&self, job_dir: &str) -> Result<()> {
        for (file, stream) in [(STDERR_FILE, LogStream::Stderr), (STDOUT_FILE, LogStream::Stdout)] {
            let command = format!("cat {}/{}", job_dir, file);
            let task = self
                .shell
                .run_async(
                    &command,
                    Box::new(self.logger.writer(stream)),
                    Box::new(self.logger.writer(LogStream::Stderr)),
                )
                .await?;
            let exit_status = task
                .await
                .map_err(|e| CriError::transport(command.as_str(), e))??;
            if exit_status != 0 {
                return Err(CriError::transport(
                    command,
                    format!("exit status {}", exit_status),
                ));
            }
        }
        Ok(())
    }

    /// Upload and run a helper script, returning its stdout.
    pub async fn run_script(&self, contents: String, destination: &str) -> Result<String> {
        self.upload_script(contents, destination).await?;
        let output = self.exec(&format!("bash {}", destination)).await?;
        Ok(output.stdout_str())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{OutputSink, RemoteTask};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::path::Path;

    /// Shell that records commands and answers from a script of responses.
    #[derive(Default)]
    pub struct RecordingShell {
        pub commands: Mutex<Vec<String>>,
        pub uploads: Mutex<Vec<(String, String)>>,
        pub responses: Mutex<Vec<(String, CommandOutput)>>,
    }

    impl RecordingShell {
        /// Answer commands starting with `prefix` with the given output.
        pub fn respond(&self, prefix: &str, stdout: &str, exit_status: i32) {
            self.responses.lock().push((
                prefix.to_string(),
                CommandOutput {
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: if exit_status == 0 {
                        vec![]
                    } else {
                        b"failed".to_vec()
                    },
                    exit_status,
                },
            ));
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }

        pub fn uploaded(&self, destination: &str) -> Option<String> {
            self.uploads
                .lock()
                .iter()
                .find(|(d, _)| d == destination)
                .map(|(_, c)| c.clone())
        }

        fn answer(&self, command: &str) -> CommandOutput {
            self.commands.lock().push(command.to_string());
            self.responses
                .lock()
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        async fn run(&self, command: &str) -> Result<CommandOutput> {
            Ok(self.answer(command))
        }

        async fn run_async(
            &self,
            command: &str,
            mut stdout: OutputSink,
            _stderr: OutputSink,
        ) -> Result<RemoteTask> {
            let output = self.answer(command);
            Ok(tokio::spawn(async move {
                stdout.write_all(&output.stdout)?;
                stdout.flush()?;
                Ok::<i32, CriError>(output.exit_status)
            }))
        }

        async fn upload(&self, contents: Vec<u8>, destination: &str, _mode: i32) -> Result<()> {
            self.uploads.lock().push((
                destination.to_string(),
                String::from_utf8_lossy(&contents).into_owned(),
            ));
            Ok(())
        }

        async fn copy_from(&self, source: &str, _destination: &Path) -> Result<()> {
            self.commands.lock().push(format!("copy_from {}", source));
            Ok(())
        }
    }

    fn client(shell: Arc<RecordingShell>, logger: ContainerLogger) -> SlurmClient {
        SlurmClient::new(shell, logger)
    }

    #[tokio::test]
    async fn test_exec_nonzero_is_transport_error() {
        let shell = Arc::new(RecordingShell::default());
        shell.respond("scancel", "", 1);
        let err = client(shell, ContainerLogger::discard())
            .cancel(JobReference(7))
            .await
            .unwrap_err();
        match err {
            CriError::Transport { command, message } => {
                assert_eq!(command, "scancel 7");
                assert_eq!(message, "failed");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_uploads_scripts_and_parses_id() {
        let shell = Arc::new(RecordingShell::default());
        shell.respond("bash multicri/sb/c/run.sh", "Submitted batch job 99\n", 0);
        let job = JobConfig {
            directives: vec![super::super::job::Directive::new("-J", "app")],
            command: "true".to_string(),
            path: "multicri/sb/c".to_string(),
            script: "multicri/sb/c/run.sh".to_string(),
            ..Default::default()
        };

        let reference = client(shell.clone(), ContainerLogger::discard())
            .submit(&job)
            .await
            .unwrap();
        assert_eq!(reference, JobReference(99));
        assert!(shell.uploaded("multicri/sb/c/batch.sh").is_some());
        assert!(shell.uploaded("multicri/sb/c/prerun.sh").is_none());
        assert!(shell
            .uploaded("multicri/sb/c/run.sh")
            .unwrap()
            .ends_with("sbatch batch.sh\n"));
    }

    #[tokio::test]
    async fn test_status_falls_back_to_accounting() {
        let shell = Arc::new(RecordingShell::default());
        shell.respond("scontrol", "", 1);
        shell.respond(
            "sacct",
            "2019-05-02T10:00:00|2019-05-02T10:05:00|0:0|COMPLETED||\n",
            0,
        );
        let status = client(shell.clone(), ContainerLogger::discard())
            .status(JobReference(5))
            .await
            .unwrap();
        assert_eq!(status.job_state, "COMPLETED");
        assert_eq!(
            shell.commands(),
            vec![
                "scontrol show jobid -dd 5",
                "sacct -p -n -j 5 -o start,end,exitcode,state,comment"
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_logs_appends_to_container_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("c1.log");
        let shell = Arc::new(RecordingShell::default());
        shell.respond("cat job/sterr.out", "warning\n", 0);
        shell.respond("cat job/stdout.out", "result 42\n", 0);

        client(shell, ContainerLogger::new(&log_path))
            .fetch_logs("job")
            .await
            .unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("stderr F warning"));
        assert!(lines[1].ends_with("stdout F result 42"));
    }
}
