//! Run report
//!
//! One row per descriptor, in creation order. The report is the only
//! output of a run; it serializes to JSON and renders as a text table.

use super::run::{Outcome, SkipReason};
use crate::resource::{RealizedResource, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialFailure => "partial failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceReport {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub outcome: Outcome,
    /// Time from submission to terminal state; `None` if never submitted
    pub elapsed: Option<Duration>,
}

impl ResourceReport {
    pub fn elapsed_display(&self) -> String {
        match self.elapsed {
            Some(d) => format_duration(d),
            None => "-".to_string(),
        }
    }

    /// Provider id, error text, or skip reason
    pub fn detail(&self) -> String {
        match &self.outcome {
            Outcome::Pending => String::new(),
            Outcome::Succeeded(realized) => realized.provider_id.clone(),
            Outcome::Failed(e) => format!("[{}] {}", e.category(), e),
            Outcome::Skipped(reason) => reason.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ResourceRow<'a> {
    id: &'a str,
    kind: &'a str,
    name: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<&'a BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_ms: Option<u64>,
}

impl Serialize for ResourceReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut row = ResourceRow {
            id: &self.id,
            kind: self.kind.as_str(),
            name: &self.name,
            status: self.outcome.label(),
            provider_id: None,
            attributes: None,
            error: None,
            category: None,
            diagnostics: None,
            skip_reason: None,
            elapsed_ms: self.elapsed.map(|d| d.as_millis() as u64),
        };

        match &self.outcome {
            Outcome::Pending => {}
            Outcome::Succeeded(realized) => {
                row.provider_id = Some(&realized.provider_id);
                row.attributes = Some(&realized.attributes);
            }
            Outcome::Failed(e) => {
                row.error = Some(e.to_string());
                row.category = Some(e.category());
                row.diagnostics = e.diagnostics();
            }
            Outcome::Skipped(reason) => row.skip_reason = Some(reason.to_string()),
        }

        row.serialize(serializer)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub resources: Vec<ResourceReport>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        provider: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        cancelled: bool,
        resources: Vec<ResourceReport>,
    ) -> Self {
        let status = if resources
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Succeeded(_)))
        {
            RunStatus::Success
        } else {
            RunStatus::PartialFailure
        };

        Self {
            run_id,
            provider,
            started_at,
            finished_at,
            status,
            cancelled,
            resources,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.resources.iter().find(|r| r.id == id).map(|r| &r.outcome)
    }

    pub fn realized(&self, id: &str) -> Option<&RealizedResource> {
        match self.outcome(id)? {
            Outcome::Succeeded(realized) => Some(realized),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Succeeded(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped(_)))
    }

    /// Ids skipped because of `ancestor`
    pub fn skipped_because_of<'a>(&'a self, ancestor: &'a str) -> impl Iterator<Item = &'a str> {
        self.resources.iter().filter_map(move |r| match &r.outcome {
            Outcome::Skipped(SkipReason::AncestorFailed(id)) if id == ancestor => Some(r.id.as_str()),
            _ => None,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Aligned table with one line per resource, followed by a summary
    pub fn render_text(&self) -> String {
        const HEADERS: [&str; 6] = ["ID", "KIND", "NAME", "OUTCOME", "TIME", "DETAIL"];

        let rows: Vec<[String; 6]> = self
            .resources
            .iter()
            .map(|r| {
                [
                    r.id.clone(),
                    r.kind.to_string(),
                    r.name.clone(),
                    r.outcome.label().to_string(),
                    r.elapsed_display(),
                    r.detail(),
                ]
            })
            .collect();

        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run {} ({}) {}{}",
            self.run_id,
            self.provider,
            self.status.as_str(),
            if self.cancelled { ", cancelled" } else { "" }
        );

        let line = |cells: [&str; 6]| {
            let mut text = String::new();
            for (i, cell) in cells.iter().enumerate() {
                if i == cells.len() - 1 {
                    text.push_str(cell);
                } else {
                    let _ = write!(text, "{:<width$}  ", cell, width = widths[i]);
                }
            }
            text.trim_end().to_string()
        };

        let _ = writeln!(out, "{}", line(HEADERS));
        for row in &rows {
            let cells = [
                row[0].as_str(),
                row[1].as_str(),
                row[2].as_str(),
                row[3].as_str(),
                row[4].as_str(),
                row[5].as_str(),
            ];
            let _ = writeln!(out, "{}", line(cells));
        }

        let _ = writeln!(
            out,
            "{} succeeded, {} failed, {} skipped in {}",
            self.succeeded().count(),
            self.failed().count(),
            self.skipped().count(),
            format_duration(
                (self.finished_at - self.started_at)
                    .to_std()
                    .unwrap_or_default()
            )
        );
        out
    }
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() < 1 {
        format!("{}ms", d.as_millis())
    } else if d.as_secs() < 60 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}m{}s", d.as_secs() / 60, d.as_secs() % 60)
    }
}
