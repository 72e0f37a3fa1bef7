//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! plans, apply reports, drift and state in text or JSON.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{InfraConfig, ValidationResult};
use crate::executor::{ApplyReport, NodeState};
use crate::graph::ResourceGraph;
use crate::planner::{ChangeAction, Plan, PlanMode};
use crate::reconciler::{DriftReport, DriftStatus, ReconciliationResult};
use crate::state::StateDocument;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Details")]
    details: String,
}

/// Node outcome row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// State entry row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "External ID")]
    external_id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for machine-readable output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the document.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let title = match plan.mode {
            PlanMode::Apply => "Plan",
            PlanMode::Destroy => "Destroy plan",
        };
        let _ = write!(
            output,
            "\n{title} {} (state serial {})\n\n",
            plan.fingerprint.bold(),
            plan.state_serial
        );

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .filter(|c| c.is_change())
            .enumerate()
            .map(|(i, c)| {
                let details = if c.action == ChangeAction::Replace {
                    let reasons: Vec<&str> = c.replacement_reasons().collect();
                    let mut details = format!("forced by {}", reasons.join(", "));
                    if c.create_before_destroy {
                        details.push_str(", create before destroy");
                    }
                    details
                } else {
                    c.changes
                        .iter()
                        .map(|a| a.attribute.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                PlanChangeRow {
                    index: i + 1,
                    action: Self::format_action(c.action),
                    resource: c.id.to_string(),
                    details: truncate(&details, 50),
                }
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for change in plan.changes.iter().filter(|c| {
            matches!(c.action, ChangeAction::Update | ChangeAction::Replace)
        }) {
            let _ = writeln!(output, "\n  {} {}", change.action.symbol(), change.id);
            for attr in &change.changes {
                let before = attr
                    .before
                    .as_ref()
                    .map_or_else(|| String::from("(none)"), ToString::to_string);
                let marker = if attr.forces_replacement {
                    " # forces replacement".red().to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(output, "      {}: {before} -> {}{marker}", attr.attribute, attr.after);
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete.\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.delete.to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy cycle.
    #[must_use]
    pub fn format_result(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let mut output = String::new();
                if let Some(drift) = result.drift.as_ref().filter(|d| d.has_drift()) {
                    let _ = writeln!(output, "{} {}", "⚠".yellow(), drift.to_string().trim_end());
                    output.push('\n');
                }
                output.push_str(&Self::format_report_text(&result.report));
                output
            }
        }
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    /// Formats a report as text.
    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let rows: Vec<NodeRow> = report
            .nodes
            .iter()
            .map(|n| NodeRow {
                resource: n.id.to_string(),
                action: Self::format_action(n.action),
                state: Self::format_node_state(n.state),
                attempts: n.attempts,
                error: n.error.as_deref().map_or_else(String::new, |e| truncate(e, 60)),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push_str("\n\n");
        }

        let elapsed = (report.finished_at - report.started_at).num_milliseconds();
        if let Some(reason) = &report.aborted {
            let _ = writeln!(output, "{} Apply aborted: {reason}", "✗".red());
        } else if report.cancelled {
            let _ = writeln!(output, "{} Apply cancelled", "⚠".yellow());
        } else if report.is_success() {
            let _ = writeln!(output, "{} Apply complete", "✓".green());
        } else {
            let _ = writeln!(output, "{} Apply finished with errors", "✗".red());
        }
        let _ = writeln!(output, "   {report} ({elapsed} ms)");

        let failures: Vec<_> = report.failures().collect();
        if !failures.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for node in failures {
                let _ = writeln!(
                    output,
                    "   - {}: {}",
                    node.id,
                    node.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected ({} resources checked).\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} {}", "⚠".yellow(), report);
                let unreadable = report
                    .drifted
                    .iter()
                    .filter(|e| matches!(e.status, DriftStatus::Unreadable { .. }))
                    .count();
                if unreadable > 0 {
                    let _ = writeln!(output, "\n{unreadable} resource(s) could not be read.");
                }
                output
            }
        }
    }

    /// Formats a state summary.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Config hash: {}", short_hash(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let s = &entry.summary;
                        let _ = write!(
                            output,
                            "     {status} {} {:?} serial {}: {} created, {} updated, {} replaced, {} deleted",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.serial,
                            s.created,
                            s.updated,
                            s.replaced,
                            s.deleted
                        );
                        if let Some(error) = &entry.error {
                            let _ = write!(output, " ({error})");
                        }
                        output.push('\n');
                    }
                }

                output
            }
        }
    }

    /// Formats the list of tracked resources.
    #[must_use]
    pub fn format_state_list(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => {
                let entries: Vec<_> = state.resources.values().collect();
                to_json(&entries)
            }
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return String::from("No resources tracked.\n");
                }

                let rows: Vec<StateRow> = state
                    .resources
                    .values()
                    .map(|e| StateRow {
                        resource: e.id.to_string(),
                        external_id: e.external_id.clone(),
                        dependencies: e
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                        updated: e.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats output values.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text => {
                let mut output = String::new();
                for (name, value) in outputs {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let _ = writeln!(output, "{name} = {rendered}");
                }
                output
            }
        }
    }

    /// Formats a single output value (strings unquoted in text mode).
    #[must_use]
    pub fn format_value(&self, value: &Value) -> String {
        match (self.format, value) {
            (OutputFormat::Text, Value::String(s)) => format!("{s}\n"),
            _ => format!("{}\n", to_json(value)),
        }
    }

    /// Formats the outcome of `validate`.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &InfraConfig,
        result: &ValidationResult,
        graph: &ResourceGraph,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                project: &config.project.name,
                environment: &config.project.environment,
                resources: graph.topological_order().iter().map(ToString::to_string).collect(),
                outputs: config.outputs.keys().cloned().collect(),
                warnings: &result.warnings,
            }),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid.\n", "✓".green());

                if result.warning_count() > 0 {
                    if show_warnings {
                        output.push_str("\nWarnings:\n");
                        for warning in &result.warnings {
                            let _ = writeln!(output, "  {} {warning}", "⚠".yellow());
                        }
                    } else {
                        let _ = writeln!(
                            output,
                            "{} warning(s); use --warnings to show them.",
                            result.warning_count()
                        );
                    }
                }

                output.push_str("\nSummary:\n");
                let _ = writeln!(output, "  Project: {}", config.project.name);
                let _ = writeln!(output, "  Environment: {}", config.project.environment);
                let _ = writeln!(output, "  Resources: {} (of {} declared)", graph.len(), config.resources.len());
                let _ = writeln!(output, "  Outputs: {}", config.outputs.len());
                let _ = writeln!(
                    output,
                    "  Apply order: {}",
                    graph
                        .topological_order()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction) -> String {
        let label = format!("{}{action}", action.symbol().trim());
        match action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update | ChangeAction::Replace => label.yellow().to_string(),
            ChangeAction::Delete => label.red().to_string(),
            ChangeAction::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a node state with color.
    fn format_node_state(state: NodeState) -> String {
        match state {
            NodeState::Applied => "applied".green().to_string(),
            NodeState::Failed => "failed".red().to_string(),
            NodeState::Blocked => "blocked".yellow().to_string(),
            NodeState::Pending | NodeState::InProgress => state.to_string().dimmed().to_string(),
        }
    }
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    project: &'a str,
    environment: &'a str,
    resources: Vec<String>,
    outputs: Vec<String>,
    warnings: &'a [String],
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::executor::NodeReport;
    use crate::resource::ResourceId;

    fn report(state: NodeState) -> ApplyReport {
        ApplyReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            nodes: vec![NodeReport {
                id: ResourceId::parse("bucket.site").unwrap(),
                action: ChangeAction::Create,
                state,
                attempts: 2,
                error: (state == NodeState::Failed).then(|| String::from("access denied")),
            }],
            events: Vec::new(),
            cancelled: false,
            aborted: None,
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-value", 8), "a-ver...");
        assert_eq!(truncate("ééééé", 4), "é...");
    }

    #[test]
    fn test_report_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: Value = serde_json::from_str(&formatter.format_report(&report(NodeState::Failed))).unwrap();

        assert_eq!(json["nodes"][0]["id"], "bucket.site");
        assert_eq!(json["nodes"][0]["state"], "failed");
        assert_eq!(json["nodes"][0]["error"], "access denied");
    }

    #[test]
    fn test_report_text_lists_errors() {
        let formatter = OutputFormatter::new(OutputFormat::Text);

        let text = formatter.format_report(&report(NodeState::Failed));
        assert!(text.contains("Apply finished with errors"));
        assert!(text.contains("bucket.site: access denied"));

        let text = formatter.format_report(&report(NodeState::Applied));
        assert!(text.contains("Apply complete"));
    }

    #[test]
    fn test_report_text_lists_unchanged_nodes() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let mut converged = report(NodeState::Applied);
        converged.nodes.push(NodeReport {
            id: ResourceId::parse("access_policy.read").unwrap(),
            action: ChangeAction::NoOp,
            state: NodeState::Applied,
            attempts: 0,
            error: None,
        });

        let text = formatter.format_report(&converged);
        assert!(text.contains("bucket.site"));
        assert!(text.contains("access_policy.read"));
    }

    #[test]
    fn test_outputs_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let mut outputs = BTreeMap::new();
        outputs.insert(String::from("url"), Value::String(String::from("https://example.com")));
        outputs.insert(String::from("count"), Value::from(2));

        assert_eq!(formatter.format_outputs(&outputs), "count = 2\nurl = https://example.com\n");
        assert_eq!(formatter.format_value(&outputs["url"]), "https://example.com\n");
    }
}
