//! Harvest job lifecycle and loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn, Instrument};

use super::client::{body_events, check_status};
use super::job::records_per_second;
use super::{next_datestamp, FeedClient, HarvestError, HarvestJobState, JobLease, JobLocks, JobStatus};
use crate::config::Config;
use crate::marc::{CodecError, MarcDecoder, MarcDocument};
use crate::matchkey::MatchKeyConfig;
use crate::oai::{OaiRecord, RecordParser};
use crate::storage::{IngestRecord, JobStore, Storage};

/// Why a loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No new resumption token
    Complete,
    /// Stop flag observed
    Stopped,
}

/// Starts, stops and reports harvest jobs
#[derive(Clone)]
pub struct HarvestService {
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn Storage>,
    client: FeedClient,
    locks: JobLocks,
}

/// Handle to a launched loop
#[derive(Debug)]
pub struct HarvestHandle {
    task: JoinHandle<HarvestJobState>,
}

impl HarvestHandle {
    /// Wait for the loop and return the final persisted state
    pub async fn wait(self) -> Result<HarvestJobState, HarvestError> {
        self.task
            .await
            .map_err(|e| HarvestError::Internal(format!("harvest task failed: {e}")))
    }
}

impl HarvestService {
    pub fn new(
        config: &Config,
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, HarvestError> {
        Ok(Self {
            jobs,
            storage,
            client: FeedClient::new(&config.harvest)?,
            locks: JobLocks::new(),
        })
    }

    /// Mark the job running and launch its loop in the background
    ///
    /// Fails without touching the job if it is unknown, already running,
    /// locked by another loop, or misconfigured. A loop that panics is
    /// recorded as an idle job with an error.
    pub async fn start(&self, id: &str) -> Result<HarvestHandle, HarvestError> {
        let mut state = self.load(id).await?;
        if state.status == JobStatus::Running {
            return Err(HarvestError::AlreadyRunning(id.to_string()));
        }
        let lease = self
            .locks
            .try_acquire(id)
            .ok_or_else(|| HarvestError::Locked(id.to_string()))?;
        state.config.validate()?;

        state.status = JobStatus::Running;
        state.error = None;
        state.last_started = Some(Utc::now());
        self.jobs.set_stop(id, false).await?;
        self.jobs.save_state(&state).await?;

        info!(job_id = %id, config = ?state.config, "harvest started");

        let initial = state.clone();
        let harvest = HarvestLoop {
            jobs: self.jobs.clone(),
            storage: self.storage.clone(),
            client: self.client.clone(),
            records_at_start: state.total_records,
            state,
            _lease: lease,
        };
        let span = tracing::info_span!("harvest", job_id = %id);
        let inner = tokio::spawn(harvest.run().instrument(span.clone()));

        let jobs = self.jobs.clone();
        let task = tokio::spawn(
            async move {
                match inner.await {
                    Ok(state) => state,
                    Err(e) => record_task_failure(jobs.as_ref(), initial, e).await,
                }
            }
            .instrument(span),
        );

        Ok(HarvestHandle { task })
    }

    /// Ask a running loop to stop after its current page
    pub async fn stop(&self, id: &str) -> Result<(), HarvestError> {
        let state = self.load(id).await?;
        if state.status == JobStatus::Idle {
            return Err(HarvestError::NotRunning(id.to_string()));
        }
        self.jobs.set_stop(id, true).await?;
        info!(job_id = %id, "harvest stop requested");
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<HarvestJobState, HarvestError> {
        self.load(id).await
    }

    async fn load(&self, id: &str) -> Result<HarvestJobState, HarvestError> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| HarvestError::NotFound(id.to_string()))
    }
}

struct HarvestLoop {
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn Storage>,
    client: FeedClient,
    state: HarvestJobState,
    records_at_start: u64,
    _lease: JobLease,
}

impl HarvestLoop {
    async fn run(mut self) -> HarvestJobState {
        match self.iterate().await {
            Ok(reason) => info!(
                ?reason,
                total_records = self.state.total_records,
                total_requests = self.state.total_requests,
                "harvest finished"
            ),
            Err(e) => {
                error!(error = %e, "harvest failed");
                self.state.error = Some(e.to_string());
            },
        }

        let now = Utc::now();
        let records = self.state.total_records.saturating_sub(self.records_at_start);
        self.state.last_recs_per_sec = self
            .state
            .last_started
            .map(|started| records_per_second(records, started, now));
        self.state.status = JobStatus::Idle;
        self.state.last_active = Some(now);
        if let Err(e) = self.jobs.save_state(&self.state).await {
            error!(error = %e, "failed to persist final harvest state");
        }

        self.state
    }

    async fn iterate(&mut self) -> Result<StopReason, HarvestError> {
        loop {
            if self.jobs.stop_requested(&self.state.id).await? {
                return Ok(StopReason::Stopped);
            }

            let match_keys: Arc<[MatchKeyConfig]> = self.storage.match_key_configs().await?.into();

            let response = self.client.fetch_page(&self.state.config).await?;
            self.state.total_requests += 1;
            let response = check_status(response).await?;

            let ingested = AtomicU64::new(0);
            let mut newest: Option<String> = None;
            let outcome = self
                .ingest_page(response, &match_keys, &ingested, &mut newest)
                .await;
            let records = ingested.into_inner();
            self.state.total_records += records;
            let resumption_token = outcome?;

            if let Some(newest) = &newest {
                match next_datestamp(newest) {
                    Some(from) if self.state.config.from.as_ref().is_none_or(|f| from > *f) => {
                        self.state.config.from = Some(from)
                    },
                    Some(_) => {},
                    None => warn!(datestamp = %newest, "cannot advance watermark past datestamp"),
                }
            }

            let previous = self.state.config.resumption_token.take();
            info!(
                records,
                total_records = self.state.total_records,
                has_token = resumption_token.is_some(),
                "page ingested"
            );

            match resumption_token {
                Some(token) if Some(&token) != previous.as_ref() => {
                    self.state.config.resumption_token = Some(token);
                    self.state.last_active = Some(Utc::now());
                    self.jobs.save_state(&self.state).await?;
                },
                _ => return Ok(StopReason::Complete),
            }
        }
    }

    /// Stream one page into storage, returning its resumption token
    ///
    /// `ingested` and `newest` are updated record by record so the caller
    /// keeps accurate counts when the page fails part way.
    async fn ingest_page(
        &self,
        response: reqwest::Response,
        match_keys: &Arc<[MatchKeyConfig]>,
        ingested: &AtomicU64,
        newest: &mut Option<String>,
    ) -> Result<Option<String>, HarvestError> {
        let mut events = body_events(response);
        let mut parser = RecordParser::new(MarcDecoder::new());
        let source_id = self.state.config.source_id.as_str();

        parser
            .parse(&mut events, |record: OaiRecord<MarcDocument>| {
                if newest.as_deref().is_none_or(|n| record.datestamp.as_str() > n)
                    && !record.datestamp.is_empty()
                {
                    *newest = Some(record.datestamp.clone());
                }
                let storage = self.storage.clone();
                let match_keys = match_keys.clone();
                async move {
                    let ingest = ingest_record(record)?;
                    storage.ingest(source_id, ingest, &match_keys).await?;
                    ingested.fetch_add(1, Ordering::Relaxed);
                    Ok::<(), HarvestError>(())
                }
            })
            .await?;

        Ok(parser.resumption_token().map(str::to_string))
    }
}

/// Persist a loop that died without saving as idle, keeping its progress
async fn record_task_failure(
    jobs: &dyn JobStore,
    initial: HarvestJobState,
    failure: JoinError,
) -> HarvestJobState {
    error!(error = %failure, "harvest task failed");
    let mut state = match jobs.get(&initial.id).await {
        Ok(Some(saved)) => saved,
        _ => initial,
    };
    state.status = JobStatus::Idle;
    state.error = Some(format!("harvest task failed: {failure}"));
    state.last_active = Some(Utc::now());
    if let Err(e) = jobs.save_state(&state).await {
        error!(error = %e, "failed to persist final harvest state");
    }
    state
}

fn ingest_record(record: OaiRecord<MarcDocument>) -> Result<IngestRecord, HarvestError> {
    if record.deleted {
        return Ok(IngestRecord::deleted(record.identifier));
    }
    match record.metadata {
        Some(marc) => Ok(IngestRecord::marc(record.identifier, marc.to_json())),
        None => Err(HarvestError::Codec(CodecError::NoRecord)),
    }
}
