//! Report Submission & Tracking Client
//!
//! Reports are records in the shared store created by the signed-in user.
//! Only the back office changes their status; the client creates, lists,
//! polls and deletes them.

use crate::cache::ReportStatusCache;
use crate::models::{NewReport, Report, ReportKind, ReportStatus};
use crate::remote::{fetch_all_pages, Predicate, Query, Record, RemoteError, RemoteStore, REPORT_RECORD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPORT_PAGE_SIZE: u32 = 100;

// ============================================================================
// Rate limiting
// ============================================================================

/// Client-side cooldown between two submissions
#[derive(Debug, Clone)]
pub struct SubmissionLimiter {
    cooldown: Duration,
    last_submission: Option<Instant>,
}

impl SubmissionLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_submission: None,
        }
    }

    /// Time left before the next submission is allowed
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_submission?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Reserve the submission slot at `now`.
    ///
    /// On success returns the previous stamp so a failed submission can hand
    /// the slot back with [`restore`](Self::restore). Inside the cooldown
    /// returns the remaining whole seconds, rounded up.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Option<Instant>, u64> {
        if let Some(remaining) = self.remaining(now) {
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(secs.max(1));
        }

        Ok(self.last_submission.replace(now))
    }

    pub fn restore(&mut self, previous: Option<Instant>) {
        self.last_submission = previous;
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportFields {
    kind: String,
    name: String,
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

fn report_from_record(record: &Record) -> Result<Report, RemoteError> {
    let fields: ReportFields = record.decode()?;
    let kind = ReportKind::from_str(&fields.kind).map_err(RemoteError::InvalidResponse)?;
    let status = if fields.status.is_empty() {
        ReportStatus::Pending
    } else {
        ReportStatus::from_str(&fields.status).map_err(RemoteError::InvalidResponse)?
    };

    Ok(Report {
        id: record.id.clone(),
        kind,
        name: fields.name,
        category: fields.category,
        description: fields.description,
        status,
        created_at: record.created_at.or(fields.created_at).unwrap_or_else(Utc::now),
    })
}

// ============================================================================
// Client
// ============================================================================

/// Result of a status poll
#[derive(Debug, Clone, Default)]
pub struct StatusPoll {
    pub statuses: HashMap<String, ReportStatus>,
    /// True when at least one status came from the network
    pub fetched_remote: bool,
}

#[derive(Clone)]
pub struct ReportClient {
    remote: Arc<dyn RemoteStore>,
    status_cache: ReportStatusCache,
}

impl ReportClient {
    pub fn new(remote: Arc<dyn RemoteStore>, status_cache: ReportStatusCache) -> Self {
        Self {
            remote,
            status_cache,
        }
    }

    /// Create a pending report
    pub async fn submit(&self, report: &NewReport) -> Result<Report, RemoteError> {
        let id = uuid::Uuid::new_v4().to_string();
        let fields = ReportFields {
            kind: report.kind.as_str().to_string(),
            name: report.name.clone(),
            category: report.category.clone(),
            description: report.description.clone(),
            status: ReportStatus::Pending.as_str().to_string(),
            created_at: Some(Utc::now()),
        };

        let saved = self
            .remote
            .save_record(&Record::new(REPORT_RECORD, id, &fields)?)
            .await?;
        let created = report_from_record(&saved)?;

        self.status_cache
            .insert(created.id.clone(), created.status)
            .await;
        log::info!("Report submitted: {} ({})", created.id, created.kind.as_str());
        Ok(created)
    }

    /// All reports created by the current user, newest first
    pub async fn list_mine(&self) -> Result<Vec<Report>, RemoteError> {
        let user_id = self.remote.current_user_id().await?;
        let query = Query::new(
            REPORT_RECORD,
            Predicate::CreatedBy { user_id },
            REPORT_PAGE_SIZE,
        );

        let records = fetch_all_pages(self.remote.as_ref(), &query).await?;
        let mut reports = records
            .iter()
            .map(report_from_record)
            .collect::<Result<Vec<_>, _>>()?;
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for report in &reports {
            self.status_cache.insert(report.id.clone(), report.status).await;
        }
        Ok(reports)
    }

    /// Delete a report. A record already gone counts as deleted.
    pub async fn delete_mine(&self, report: &Report) -> Result<(), RemoteError> {
        let result = self.remote.delete_record(REPORT_RECORD, &report.id).await;
        self.status_cache.remove(&report.id).await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::debug!("Report {} already deleted remotely", report.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current status of each report.
    ///
    /// Final statuses and fresh cache entries are answered locally; `force`
    /// skips the cache for pending reports.
    pub async fn poll_statuses(&self, reports: &[Report], force: bool) -> Result<StatusPoll, RemoteError> {
        let mut poll = StatusPoll::default();
        let mut misses = Vec::new();

        for report in reports {
            if report.status.is_final() {
                poll.statuses.insert(report.id.clone(), report.status);
                continue;
            }
            if !force {
                if let Some(status) = self.status_cache.get(&report.id).await {
                    poll.statuses.insert(report.id.clone(), status);
                    continue;
                }
            }
            misses.push(report.id.clone());
        }

        if misses.is_empty() {
            return Ok(poll);
        }

        let query = Query::new(
            REPORT_RECORD,
            Predicate::IdIn { ids: misses },
            REPORT_PAGE_SIZE,
        );
        let records = fetch_all_pages(self.remote.as_ref(), &query).await?;
        poll.fetched_remote = true;

        for record in &records {
            let report = report_from_record(record)?;
            self.status_cache.insert(report.id.clone(), report.status).await;
            poll.statuses.insert(report.id, report.status);
        }

        Ok(poll)
    }

    pub async fn clear_status_cache(&self) {
        self.status_cache.clear().await;
    }
}
