//! Waiting on compute jobs.

use tracing::debug;

use crate::error::{ExternalKind, ModelError, ModelResult};
use crate::external::{ComputeApi, JobExecution};
use crate::model::Model;

impl Model {
    /// Poll a job until it settles. A failed job surfaces as `kind`; running
    /// out of polls surfaces as a timeout.
    pub(crate) async fn wait_for_job(
        &self,
        compute: &dyn ComputeApi,
        job_uuid: &str,
        kind: ExternalKind,
    ) -> ModelResult<()> {
        let attempts = self.config.job_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let job = compute
                .get_job(job_uuid)
                .await
                .map_err(|e| ModelError::external(kind, e))?;
            match job.execution {
                JobExecution::Succeeded => {
                    debug!(job = %job_uuid, attempt, "job succeeded");
                    return Ok(());
                }
                JobExecution::Failed => {
                    let detail = job
                        .error
                        .unwrap_or_else(|| format!("job {job_uuid} failed"));
                    return Err(ModelError::external(kind, detail));
                }
                JobExecution::Pending => {
                    if attempt < attempts {
                        tokio::time::sleep(self.config.job_poll_interval).await;
                    }
                }
            }
        }
        Err(ModelError::external(
            ExternalKind::Timeout,
            format!("job {job_uuid} still pending after {attempts} polls"),
        ))
    }
}
