//! HTTP client for the manager API.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ManagerConfig;
use crate::error::{Result, WorkerError};
use crate::status::{MirrorSchedules, MirrorStatus, WorkerStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_ATTEMPTS: u32 = 10;
const REGISTER_DELAY: Duration = Duration::from_secs(1);

/// Talks to every configured API base. Status reports are best effort:
/// a failure against one base is logged and the next base is tried.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    api_bases: Vec<String>,
    worker_id: String,
    register_attempts: u32,
    register_delay: Duration,
}

impl ManagerClient {
    pub fn new(cfg: &ManagerConfig, worker_id: impl Into<String>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(path) = &cfg.ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                WorkerError::Config(format!("cannot read CA cert {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            http: builder.build()?,
            api_bases: cfg.api_bases(),
            worker_id: worker_id.into(),
            register_attempts: REGISTER_ATTEMPTS,
            register_delay: REGISTER_DELAY,
        })
    }

    /// Override the registration retry policy.
    pub fn with_register_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.register_attempts = attempts.max(1);
        self.register_delay = delay;
        self
    }

    pub fn api_bases(&self) -> &[String] {
        &self.api_bases
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<()> {
        let resp = self.http.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WorkerError::ManagerStatus {
                url: url.to_string(),
                status,
            });
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(WorkerError::ManagerStatus {
                url: url.to_string(),
                status,
            });
        }
        Ok(resp.json().await?)
    }

    /// POST `body` to `path` under every API base. Succeeds when at least
    /// one base accepted it, or when no base is configured.
    async fn post_all<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let mut accepted = false;
        let mut last_err = None;
        for base in &self.api_bases {
            let url = format!("{base}{path}");
            match self.post(&url, body).await {
                Ok(()) => accepted = true,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Manager request failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !accepted => Err(e),
            _ => Ok(()),
        }
    }

    /// Announce this worker, retrying each base a few times.
    pub async fn register(&self, status: &WorkerStatus) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..self.register_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.register_delay).await;
            }
            match self.post_all("/workers", status).await {
                Ok(()) => {
                    tracing::info!(worker = %self.worker_id, "Registered with manager");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, attempt, error = %e, "Registration failed");
                    last_err = Some(e);
                }
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    pub async fn update_status(&self, status: &MirrorStatus) -> Result<()> {
        let path = format!("/workers/{}/jobs/{}", self.worker_id, status.name);
        self.post_all(&path, status).await
    }

    pub async fn update_schedules(&self, schedules: &MirrorSchedules) -> Result<()> {
        let path = format!("/workers/{}/schedules", self.worker_id);
        self.post_all(&path, schedules).await
    }

    /// Last statuses the manager knows for this worker, from the first base
    /// that answers.
    pub async fn fetch_jobs(&self) -> Result<Vec<MirrorStatus>> {
        let mut last_err = None;
        for base in &self.api_bases {
            let url = format!("{}/workers/{}/jobs", base, self.worker_id);
            match self.get(&url).await {
                Ok(jobs) => return Ok(jobs),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to fetch jobs from manager");
                    last_err = Some(e);
                }
            }
        }
        last_err.map_or(Ok(Vec::new()), Err)
    }
}
