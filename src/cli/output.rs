//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::Wave;
use crate::planner::{Action, ExecutionReport, ItemStatus, Plan, PropertyChange};
use crate::state::StackState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan item row for table display.
#[derive(Tabled)]
struct PlanItemRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Changes")]
    changes: String,
}

/// Item report row for table display.
#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - {} is up to date.\n",
                "✓".green(),
                plan.stack
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan for {}\n", plan.stack.bold());
        let _ = write!(
            output,
            "   Document hash: {}\n\n",
            short(&plan.document_hash)
        );

        let rows: Vec<PlanItemRow> = plan
            .waves
            .iter()
            .flat_map(|w| w.items.iter().map(move |i| (w.index, i)))
            .filter(|(_, i)| i.action != Action::Noop)
            .map(|(wave, i)| PlanItemRow {
                wave,
                action: Self::format_action(i.action),
                kind: i.kind.to_string(),
                resource: i.resource_id.clone(),
                changes: Self::truncate(&i.diff.keys().cloned().collect::<Vec<_>>().join(", "), 40),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for item in plan.items().filter(|i| i.action != Action::Noop) {
                let _ = write!(output, "\n{} {}\n", Self::format_action(item.action), item.resource_id);
                for (name, change) in &item.diff {
                    let _ = writeln!(output, "     {name}: {}", Self::format_change(change));
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.noop
        );

        output
    }

    /// Formats dependency waves.
    #[must_use]
    pub fn format_waves(&self, stack: &str, waves: &[Wave]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "stack": stack, "waves": waves })),
            OutputFormat::Text => {
                let mut output = format!("\nDependency waves for {}\n\n", stack.bold());
                if waves.is_empty() {
                    output.push_str("   No resources declared.\n");
                }
                for wave in waves {
                    let _ = writeln!(output, "   {} {}", format!("{}:", wave.index).cyan(), wave.resources.join(", "));
                }
                output
            }
        }
    }

    /// Formats an execution report.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ReportJson {
                summary: report.summary(),
                success: report.success(),
                report,
            }),
            OutputFormat::Text => {
                let status = if report.success() {
                    format!("{} Apply complete", "✓".green())
                } else if report.aborted {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };

                let rows: Vec<ReportRow> = report
                    .items
                    .iter()
                    .filter(|i| i.status != ItemStatus::Noop)
                    .map(|i| ReportRow {
                        resource: i.resource_id.clone(),
                        action: i.action.to_string(),
                        status: Self::format_status(i.status),
                        attempts: i.attempts,
                        detail: Self::truncate(i.error.as_deref().unwrap_or(""), 60),
                    })
                    .collect();

                let mut output = format!("\n{status}\n\n");
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                let _ = write!(output, "\n{}\n", report.summary());
                output
            }
        }
    }

    /// Formats stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.stack.bold());
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.records.len());

                if !state.records.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            resource: r.resource_id.clone(),
                            kind: r.kind.to_string(),
                            id: r.primary_id().unwrap_or("-").to_string(),
                            hash: short(&r.properties_hash).to_string(),
                            applied_at: r.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the list of stacks with state.
    #[must_use]
    pub fn format_stacks(&self, stacks: &[String]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&stacks),
            OutputFormat::Text => {
                if stacks.is_empty() {
                    return String::from("No stacks with recorded state.\n");
                }
                stacks.iter().fold(String::new(), |mut out, s| {
                    let _ = writeln!(out, "{s}");
                    out
                })
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        stack: &str,
        result: &ValidationResult,
        show_warnings: bool,
        waves: usize,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "stack": stack,
                "valid": result.is_valid(),
                "waves": waves,
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} {stack} is valid ({waves} waves)\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "ok", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "✓".green()),
        }
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::Noop => "noop".dimmed().to_string(),
        }
    }

    /// Formats an item status with color.
    fn format_status(status: ItemStatus) -> String {
        let text = format!("{status:?}").to_lowercase();
        match status {
            ItemStatus::Created | ItemStatus::Updated | ItemStatus::Deleted => text.green().to_string(),
            ItemStatus::Noop => text.dimmed().to_string(),
            ItemStatus::Failed => text.red().to_string(),
            ItemStatus::Skipped | ItemStatus::Cancelled => text.yellow().to_string(),
        }
    }

    /// Formats a property change.
    fn format_change(change: &PropertyChange) -> String {
        let show = |v: Option<&Value>| v.map_or_else(|| String::from("(none)"), |v| Self::truncate(&v.to_string(), 50));
        format!(
            "{} -> {}",
            show(change.old.as_ref()).red(),
            show(change.new.as_ref()).green()
        )
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// First eight characters of a hash.
fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[derive(Serialize)]
struct ReportJson<'a> {
    success: bool,
    summary: crate::planner::ExecutionSummary,
    #[serde(flatten)]
    report: &'a ExecutionReport,
}
