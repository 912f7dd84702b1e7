//! Status reporting at graded verbosity, plus an HTML rendering
//!
//! Each verbosity level is a superset of the one below it:
//!   0 — nothing on stdout; the report lives in the exit signal
//!   1 — one line per task (fingerprint and status)
//!   2 — adds host, command and wall-clock times
//!   3 — adds declared files, backend handle and run id
//!   4 — adds the captured output tail
//!
//! The HTML rendering emits one table per record with a stable element
//! id (`table_<host>_<fingerprint>`) so external tooling can address
//! individual tasks.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::status::{TaskRecord, TaskStatus};

const COMMAND_PREVIEW_LEN: usize = 60;

/// Render records as text at the requested verbosity (clamped to 0..=4).
/// Level 0 renders nothing; callers report through [`exit_signal`].
pub fn render(records: &[TaskRecord], verbosity: u8) -> String {
    let verbosity = verbosity.min(4);
    let mut out = String::new();

    if verbosity == 0 {
        return out;
    }

    for record in records {
        render_record(&mut out, record, verbosity);
    }
    out.push_str(&summary_line(records));
    out.push('\n');
    out
}

/// Exit code summarizing a record set: non-zero when anything failed,
/// aborted or fell out of contact
pub fn exit_signal(records: &[TaskRecord]) -> i32 {
    let trouble = records.iter().any(|r| {
        matches!(
            r.status,
            TaskStatus::Failed | TaskStatus::Aborted | TaskStatus::Unknown
        )
    });
    if trouble {
        1
    } else {
        0
    }
}

fn render_record(out: &mut String, record: &TaskRecord, verbosity: u8) {
    let _ = write!(out, "{}\t{}", record.fingerprint, record.status);

    if verbosity >= 2 {
        let _ = write!(
            out,
            "\t{}\t{}",
            record.host,
            preview(&record.command, COMMAND_PREVIEW_LEN)
        );
        let _ = write!(
            out,
            "\t{}",
            format_span(record.created_at, record.started_at, record.ended_at)
        );
    }
    out.push('\n');

    if verbosity >= 3 {
        let _ = writeln!(out, "  run_id: {}", record.run_id);
        if let Some(handle) = &record.handle {
            let _ = writeln!(out, "  handle: {handle}");
        }
        if !record.inputs.is_empty() {
            let _ = writeln!(
                out,
                "  inputs: {}",
                record
                    .inputs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !record.outputs.is_empty() {
            let _ = writeln!(
                out,
                "  outputs: {}",
                record
                    .outputs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if !record.tags.is_empty() {
            let _ = writeln!(out, "  tags: {}", record.tags.join(", "));
        }
    }

    if verbosity >= 4 {
        if let Some(exit) = &record.exit {
            if let Some(code) = exit.exit_code {
                let _ = writeln!(out, "  exit_code: {code}");
            }
            if !exit.output_tail.is_empty() {
                let _ = writeln!(out, "  output:");
                for line in exit.output_tail.lines() {
                    let _ = writeln!(out, "    {line}");
                }
            }
        }
    }
}

/// Aggregate counts in a fixed status order
fn summary_line(records: &[TaskRecord]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.status.as_str()).or_insert(0) += 1;
    }
    let order = [
        TaskStatus::Completed,
        TaskStatus::Running,
        TaskStatus::Submitted,
        TaskStatus::Pending,
        TaskStatus::Failed,
        TaskStatus::Aborted,
        TaskStatus::Unknown,
        TaskStatus::New,
    ];
    let parts: Vec<String> = order
        .iter()
        .filter_map(|status| {
            counts
                .get(status.as_str())
                .map(|n| format!("{n} {}", status.as_str()))
        })
        .collect();
    if parts.is_empty() {
        format!("{} tasks", records.len())
    } else {
        format!("{} tasks: {}", records.len(), parts.join(", "))
    }
}

fn preview(command: &str, max: usize) -> String {
    let flat = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn format_span(
    created: DateTime<Utc>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
) -> String {
    match (started, ended) {
        (Some(start), Some(end)) => {
            let secs = (end - start).num_seconds().max(0);
            format!("ran {secs}s")
        }
        (Some(start), None) => {
            let secs = (Utc::now() - start).num_seconds().max(0);
            format!("running {secs}s")
        }
        _ => format!("created {}", created.format("%Y-%m-%d %H:%M:%S")),
    }
}

// ─────────────────────────────────────────────────────────────────
// HTML Rendering
// ─────────────────────────────────────────────────────────────────

/// Render records as a standalone HTML document. One table per record,
/// addressable as `table_<host>_<fingerprint>`.
pub fn render_html(records: &[TaskRecord]) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str("<title>taskmill status</title>\n");
    out.push_str(
        "<style>\n\
         table.task { border-collapse: collapse; margin-bottom: 1em; }\n\
         table.task th, table.task td { border: 1px solid #ccc; padding: 4px 8px; text-align: left; }\n\
         .status-completed { color: #2a7f2a; }\n\
         .status-failed, .status-aborted { color: #b02020; }\n\
         .status-running, .status-submitted, .status-pending { color: #1a5fb0; }\n\
         .status-unknown { color: #888; }\n\
         </style>\n</head>\n<body>\n",
    );
    let _ = writeln!(out, "<h1>{}</h1>", escape(&summary_line(records)));

    for record in records {
        let _ = writeln!(
            out,
            "<table class=\"task\" id=\"table_{}_{}\">",
            escape(&record.host),
            escape(&record.fingerprint)
        );
        html_row(&mut out, "task", &record.fingerprint);
        let _ = writeln!(
            out,
            "<tr><th>status</th><td class=\"status-{status}\">{status}</td></tr>",
            status = record.status
        );
        html_row(&mut out, "host", &record.host);
        html_row(&mut out, "command", &record.command);
        if let Some(handle) = &record.handle {
            html_row(&mut out, "handle", handle);
        }
        if let Some(started) = record.started_at {
            html_row(&mut out, "started", &started.to_rfc3339());
        }
        if let Some(ended) = record.ended_at {
            html_row(&mut out, "ended", &ended.to_rfc3339());
        }
        if let Some(exit) = &record.exit {
            if let Some(code) = exit.exit_code {
                html_row(&mut out, "exit code", &code.to_string());
            }
            if !exit.output_tail.is_empty() {
                let _ = writeln!(
                    out,
                    "<tr><th>output</th><td><pre>{}</pre></td></tr>",
                    escape(&exit.output_tail)
                );
            }
        }
        out.push_str("</table>\n");
    }

    out.push_str("</body>\n</html>\n");
    out
}

fn html_row(out: &mut String, label: &str, value: &str) {
    let _ = writeln!(
        out,
        "<tr><th>{}</th><td>{}</td></tr>",
        escape(label),
        escape(value)
    );
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
