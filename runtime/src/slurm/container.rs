//! Container lifecycle on Slurm: job directory setup, submission, polling.

use std::collections::{BTreeMap, HashMap};

use multicri_core::error::{CriError, Result};
use multicri_core::metadata::now_nanos;
use multicri_core::{ContainerMetadata, ContainerState};

use super::job::{
    escape_special_characters, Directive, JobConfig, JobOutcome, JobReference, JobStatus,
    RUN_SCRIPT, STDERR_FILE, STDOUT_FILE,
};
use super::{
    SlurmAdapter, ENV_CLUSTER_CONFIG, EXTRA_CLUSTER_VOLUME_PATH, EXTRA_IMAGE_PATH, EXTRA_JOB_DIR,
    EXTRA_LOCAL_PATH, EXTRA_VOLUME_PATH, VOLUME_CONTAINER_PATH,
};
use crate::log::ContainerLogger;

pub const ENV_JOB_QUEUE: &str = "JOB_QUEUE";
pub const ENV_JOB_GPU: &str = "JOB_GPU";
pub const ENV_JOB_NUM_NODES: &str = "JOB_NUM_NODES";
pub const ENV_JOB_NUM_CORES_NODE: &str = "JOB_NUM_CORES_NODE";
pub const ENV_JOB_NUM_CORES: &str = "JOB_NUM_CORES";
pub const ENV_JOB_NUM_TASKS_NODE: &str = "JOB_NUM_TASKS_NODE";
pub const ENV_JOB_CUSTOM_CONFIG: &str = "JOB_CUSTOM_CONFIG";
pub const ENV_MPI_VERSION: &str = "MPI_VERSION";
pub const ENV_MPI_FLAGS: &str = "MPI_FLAGS";

/// Environment prefixes that configure the shim and never reach the job.
const INTERNAL_ENV_PREFIXES: [&str; 3] = ["KUBERNETES_", "CLUSTER_", "JOB_"];

impl SlurmAdapter {
    pub(super) async fn create(&self, container: &mut ContainerMetadata) -> Result<()> {
        let mounts: HashMap<&str, &str> = container
            .config
            .mounts
            .iter()
            .map(|m| (m.container_path.as_str(), m.host_path.as_str()))
            .collect();

        let mut mount_point = self.config.mount_path.clone();
        if let Some(host_path) = mounts.get(VOLUME_CONTAINER_PATH).map(|p| p.to_string()) {
            let sandbox_id = container.sandbox_id().to_string();
            let volume_name = host_path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            container.extra.insert(
                EXTRA_LOCAL_PATH.to_string(),
                format!("{}/{}/{}", host_path, sandbox_id, container.id),
            );
            container
                .extra
                .insert(EXTRA_VOLUME_PATH.to_string(), host_path);
            mount_point = format!("{}/{}", mount_point, volume_name);

            ContainerLogger::new(&container.log_path).message(&format!(
                "---\nContainer mounted in \"{}\" Volume.\nResults stored in directory:  \"{}/{}\" \n---",
                volume_name, sandbox_id, container.id
            ));
        }

        let job_dir = format!("{}/{}/{}", mount_point, container.sandbox_id(), container.id);
        container
            .extra
            .insert(EXTRA_CLUSTER_VOLUME_PATH.to_string(), mount_point);
        container
            .extra
            .insert(EXTRA_JOB_DIR.to_string(), job_dir.clone());

        tracing::info!(container_id = %container.id, job_dir = %job_dir, "Creating job directory in cluster");
        let client = self.client(container)?;
        client.exec(&format!("mkdir -p {}", job_dir)).await?;

        self.builder.pull_image_in_cluster(&client, container).await?;
        tracing::info!(container_id = %container.id, "Created job directory in cluster");
        Ok(())
    }

    pub(super) async fn start(&self, container: &mut ContainerMetadata) -> Result<()> {
        let client = self.client(container)?;
        let job = self.job_config(container)?;
        let JobReference(pid) = client.submit(&job).await?;
        container.pid = pid;
        Ok(())
    }

    pub(super) async fn stop(&self, container: &mut ContainerMetadata) -> Result<()> {
        if container.pid == 0 {
            return Ok(());
        }
        let client = self.client(container)?;
        client.cancel(JobReference(container.pid)).await
    }

    pub(super) async fn status(&self, container: &mut ContainerMetadata) -> Result<()> {
        if container.pid == 0 {
            return Ok(());
        }
        let client = self.client(container)?;
        let status = client.status(JobReference(container.pid)).await?;
        apply_job_status(container, &status);

        if container.state == ContainerState::Exited {
            if let Err(e) = client.fetch_logs(container.extra(EXTRA_JOB_DIR)).await {
                tracing::warn!(container_id = %container.id, error = %e, "Failed to fetch job output");
            }
        }
        Ok(())
    }

    /// Job submission for the container.
    pub(super) fn job_config(&self, container: &ContainerMetadata) -> Result<JobConfig> {
        let job_dir = container.extra(EXTRA_JOB_DIR);
        if job_dir.is_empty() {
            return Err(CriError::Conflict(format!(
                "container {} has no job directory",
                container.id
            )));
        }

        Ok(JobConfig {
            directives: job_directives(container),
            custom: container
                .environment
                .get(ENV_JOB_CUSTOM_CONFIG)
                .cloned()
                .unwrap_or_default(),
            command: self.job_command(container),
            path: job_dir.to_string(),
            script: format!("{}/{}", job_dir, RUN_SCRIPT),
            prerun: container
                .environment
                .get(ENV_CLUSTER_CONFIG)
                .cloned()
                .unwrap_or_default(),
            environment: job_environment(&container.environment),
        })
    }

    /// `[mpirun [flags]] singularity exec <image> <command...> <args...>`
    fn job_command(&self, container: &ContainerMetadata) -> String {
        let mut tokens = Vec::new();
        if container.environment.contains_key(ENV_MPI_VERSION) {
            tokens.push("mpirun".to_string());
            if let Some(flags) = container.environment.get(ENV_MPI_FLAGS) {
                if !flags.trim().is_empty() {
                    tokens.push(flags.trim().to_string());
                }
            }
        }
        tokens.push("singularity exec".to_string());
        let image_path = container.extra(EXTRA_IMAGE_PATH);
        if image_path.is_empty() {
            tokens.push(self.builder.cluster_image_path(container));
        } else {
            tokens.push(image_path.to_string());
        }
        tokens.extend(
            container
                .command
                .iter()
                .chain(container.args.iter())
                .map(|token| escape_special_characters(token)),
        );
        tokens.join(" ")
    }
}

fn job_directives(container: &ContainerMetadata) -> Vec<Directive> {
    let env = &container.environment;
    let mut directives = vec![
        Directive::new("-J", container.name.clone()),
        Directive::new("-o", STDOUT_FILE),
        Directive::new("-e", STDERR_FILE),
    ];
    if let Some(queue) = env.get(ENV_JOB_QUEUE) {
        directives.push(Directive::new("-p", queue.clone()));
    }
    if let Some(gpu) = env.get(ENV_JOB_GPU) {
        directives.push(Directive::new(format!("--gres={}", gpu), ""));
    }
    if let Some(nodes) = env.get(ENV_JOB_NUM_NODES) {
        directives.push(Directive::new("-N", nodes.clone()));
    }
    if let Some(cores) = env.get(ENV_JOB_NUM_CORES_NODE) {
        directives.push(Directive::new("-c", cores.clone()));
    }
    if let Some(cores) = env.get(ENV_JOB_NUM_CORES) {
        directives.push(Directive::new("-n", cores.clone()));
    }
    if let Some(tasks) = env.get(ENV_JOB_NUM_TASKS_NODE) {
        directives.push(Directive::new(format!("--ntasks-per-node={}", tasks), ""));
    }
    directives
}

/// Variables the job should see: everything but the shim's own settings.
fn job_environment(environment: &HashMap<String, String>) -> BTreeMap<String, String> {
    environment
        .iter()
        .filter(|(key, _)| {
            let upper = key.to_ascii_uppercase();
            !INTERNAL_ENV_PREFIXES
                .iter()
                .any(|prefix| upper.starts_with(prefix))
                && upper != ENV_MPI_FLAGS
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Fold a scheduler status into the container record.
pub(super) fn apply_job_status(container: &mut ContainerMetadata, status: &JobStatus) {
    match status.outcome() {
        JobOutcome::Running => container.state = ContainerState::Running,
        JobOutcome::Pending => container.state = ContainerState::Created,
        JobOutcome::Exited { exit_code, reason } => {
            let finished_at = if status.end_time > 0 {
                status.end_time * 1_000_000_000
            } else if status.start_time > 0 {
                status.start_time * 1_000_000_000
            } else {
                now_nanos()
            };
            container.mark_exited(exit_code, reason, finished_at);
        }
    }
}
