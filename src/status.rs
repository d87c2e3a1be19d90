//! Status surface shared by the project and claim reconcilers: the
//! per-pass message log and the named conditions.

use std::fmt;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::crd::PaasStatus;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_HAS_ERRORS: &str = "HasErrors";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_ACTIVE: &str = "Active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Create,
    Update,
    Find,
    Delete,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

impl fmt::Display for StatusAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusAction::Create => write!(f, "create"),
            StatusAction::Update => write!(f, "update"),
            StatusAction::Find => write!(f, "find"),
            StatusAction::Delete => write!(f, "delete"),
        }
    }
}

/// Append-only log of what one reconcile pass did. A fresh log is started on
/// every pass, which is what truncates the messages kept in status.
#[derive(Debug, Default, Clone)]
pub struct StatusLog {
    messages: Vec<String>,
    errors: usize,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, level: Level, action: StatusAction, target: &str, detail: &str) {
        if level == Level::Error {
            self.errors += 1;
        }
        self.messages
            .push(format!("{level}: {action} {target}: {detail}"));
    }

    pub fn info(&mut self, action: StatusAction, target: &str, detail: &str) {
        self.record(Level::Info, action, target, detail);
    }

    pub fn error(&mut self, action: StatusAction, target: &str, detail: &str) {
        self.record(Level::Error, action, target, detail);
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

/// Upserts a condition, keeping the previous transition time when the
/// status did not flip.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let status = if status { "True" } else { "False" }.to_string();
    let now = Time(Utc::now());

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
            observed_generation,
        }),
    }
}

/// Builds the status written at the end of a pass. `failure` is the error
/// that stopped the pass, if any.
pub fn summarize(
    previous: Option<&PaasStatus>,
    log: &StatusLog,
    generation: Option<i64>,
    failure: Option<&crate::Error>,
) -> PaasStatus {
    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let mut messages = log.messages().to_vec();

    match failure {
        None => {
            set_condition(
                &mut conditions,
                CONDITION_READY,
                true,
                "Reconciled",
                "all resources are in sync",
                generation,
            );
            set_condition(&mut conditions, CONDITION_DEGRADED, false, "Reconciled", "", generation);
        }
        Some(err) => {
            let reason = if err.is_terminal() {
                "InvalidSpec"
            } else {
                "ReconcileFailed"
            };
            messages.push(format!("{}: reconcile: {err}", Level::Error));
            set_condition(&mut conditions, CONDITION_READY, false, reason, &err.to_string(), generation);
            set_condition(&mut conditions, CONDITION_DEGRADED, true, reason, &err.to_string(), generation);
        }
    }

    let has_errors = log.has_errors() || failure.is_some();
    set_condition(
        &mut conditions,
        CONDITION_HAS_ERRORS,
        has_errors,
        if has_errors { "ErrorsLogged" } else { "NoErrors" },
        "",
        generation,
    );

    PaasStatus {
        messages,
        conditions,
        observed_generation: generation,
    }
}
