//! Webhook admission: payload validation and job extraction.
//!
//! The ripper's notifier posts one of two payload shapes. The generic shape
//! carries a human-readable body the source directory is extracted from; the
//! structured shape names the directory outright. Everything is
//! length-capped, the directory hint is screened by the path guard, and
//! non-completion events from broadcast notifiers drop as idempotent no-ops.

use crate::path_guard;
use crate::store::NewJob;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Largest accepted webhook body.
pub const MAX_WEBHOOK_BYTES: usize = 10 * 1024;

const MAX_TITLE_LEN: usize = 500;
const MAX_BODY_LEN: usize = 2000;
const MAX_PATH_LEN: usize = 1000;
const MAX_JOB_ID_LEN: usize = 50;

/// Status values that mark a notification as a successful completion.
const SUCCESS_STATUSES: &[&str] = &["success", "complete", "completed", "ok"];

/// Error type for rejected webhook payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {0} exceeds maximum length {1}")]
    FieldTooLong(&'static str, usize),

    #[error("invalid source path: {0}")]
    BadPath(String),
}

/// Raw webhook payload; both shapes deserialize into this.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// What admission decided about a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// A job should be created.
    Accepted(NewJob),
    /// Not a completion event; acknowledged without side effect.
    Ignored { reason: &'static str },
}

/// Webhook parser with the completion patterns compiled once.
pub struct Admission {
    rip_complete: Regex,
    processing_complete: Regex,
}

impl Default for Admission {
    fn default() -> Self {
        Self::new()
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {
            rip_complete: Regex::new(r"(?i)^(.+)\s+rip complete").expect("static regex"),
            processing_complete: Regex::new(r"(?i)^(.+)\s+processing complete")
                .expect("static regex"),
        }
    }

    /// Extracts the source directory name from a generic notification body.
    ///
    /// Matches `<name> rip complete` or `<name> processing complete`
    /// (case-insensitive, anchored at the start).
    pub fn extract_hint_from_body(&self, body: &str) -> Option<String> {
        self.rip_complete
            .captures(body)
            .or_else(|| self.processing_complete.captures(body))
            .map(|caps| caps[1].trim().to_string())
    }

    /// Decodes and validates a raw webhook body.
    pub fn parse(&self, raw: &[u8]) -> Result<AdmissionOutcome, AdmissionError> {
        let payload: WebhookPayload =
            serde_json::from_slice(raw).map_err(|e| AdmissionError::InvalidJson(e.to_string()))?;
        self.admit(&payload)
    }

    /// Validates a decoded payload and extracts the job to create.
    pub fn admit(&self, payload: &WebhookPayload) -> Result<AdmissionOutcome, AdmissionError> {
        check_len("title", payload.title.as_deref(), MAX_TITLE_LEN)?;
        check_len("body", payload.body.as_deref(), MAX_BODY_LEN)?;
        check_len("path", payload.path.as_deref(), MAX_PATH_LEN)?;
        check_len("job_id", payload.job_id.as_deref(), MAX_JOB_ID_LEN)?;

        let title = payload
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AdmissionError::MissingField("title"))?;

        let body_hint = payload
            .body
            .as_deref()
            .and_then(|b| self.extract_hint_from_body(b));

        // Broadcast notifiers fire on every event; anything that is neither a
        // success status nor a completion-shaped body is acknowledged and
        // dropped so the sender does not retry.
        if let Some(status) = payload.status.as_deref() {
            if !SUCCESS_STATUSES.contains(&status) && body_hint.is_none() {
                return Ok(AdmissionOutcome::Ignored {
                    reason: "not a completion event",
                });
            }
        }

        let hint = match (&payload.path, body_hint) {
            // Structured shape: the path field names the directory
            (Some(path), _) => {
                path_guard::screen_hint(path)
                    .map_err(|e| AdmissionError::BadPath(e.to_string()))?;
                path.clone()
            }
            // Generic shape: extracted from the body
            (None, Some(hint)) => {
                path_guard::screen_hint(&hint)
                    .map_err(|e| AdmissionError::BadPath(e.to_string()))?;
                hint
            }
            (None, None) => {
                return Ok(AdmissionOutcome::Ignored {
                    reason: "no source directory in payload",
                });
            }
        };

        Ok(AdmissionOutcome::Accepted(NewJob {
            title: title.to_string(),
            source_hint: hint,
            arm_job_id: payload.job_id.clone(),
        }))
    }
}

fn check_len(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<(), AdmissionError> {
    match value {
        Some(v) if v.len() > max => Err(AdmissionError::FieldTooLong(field, max)),
        _ => Ok(()),
    }
}
