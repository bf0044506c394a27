//! CLI presentation: text and JSON rendering of command results.

use crate::conversation::{ConversationView, Role};
use crate::heartbeat::StatusSnapshot;
use crate::store::NodeRecord;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;

const PROMPT_EXCERPT_CHARS: usize = 60;

/// Format a section heading with bold/underline.
pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub fn format_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PROMPT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

fn format_score(score: Option<f64>) -> String {
    score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "-".to_string())
}

/// Node table, one row per node, in the order given.
pub fn format_graph_text(nodes: &[NodeRecord]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\n\n",
        format_section_heading(&format!("Graph ({} nodes)", nodes.len()))
    ));
    if nodes.is_empty() {
        out.push_str("  No nodes. Seed one with `canopy seed PROMPT`.\n");
        return out;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Node", "Parent", "Depth", "Score", "Position", "Prompt"]);
    for node in nodes {
        let position = node
            .position
            .map(|p| format!("({:.2}, {:.2})", p.x, p.y))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            node.id.short(),
            node.parent_id
                .map(|p| p.short())
                .unwrap_or_else(|| "-".to_string()),
            node.depth.to_string(),
            format_score(node.score),
            position,
            excerpt(&node.prompt),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out
}

pub fn format_conversation_text(
    view: &ConversationView,
    human_label: &str,
    agent_label: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\n",
        format_section_heading(&format!("Conversation {}", view.node_id))
    ));
    out.push_str(&format!(
        "  Depth: {}  Score: {}\n",
        view.depth,
        format_score(view.score)
    ));
    if let Some(ref analysis) = view.analysis {
        out.push_str(&format!("  Analysis: {}\n", analysis.dimmed()));
    }
    out.push('\n');
    for turn in &view.turns {
        let label = match turn.role {
            Role::Human => format!("{}", human_label.cyan().bold()),
            Role::Agent => format!("{}", agent_label.green().bold()),
        };
        out.push_str(&format!("{}: {}\n\n", label, turn.text));
    }
    out
}

pub fn format_status_text(status: &StatusSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Canopy Status")));

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Nodes".to_string(), status.node_count.to_string()]);
    table.add_row(vec!["Frontier".to_string(), status.frontier_size.to_string()]);
    table.add_row(vec!["Spent".to_string(), format!("${:.4}", status.spent_usd)]);
    table.add_row(vec!["Limit".to_string(), format!("${:.4}", status.limit_usd)]);
    table.add_row(vec!["Phase".to_string(), format!("{:?}", status.phase)]);
    out.push_str(&format!("{}\n", table));

    let remaining = format!("${:.4}", status.remaining_usd);
    if status.remaining_usd > 0.0 {
        out.push_str(&format!("\n  Remaining budget: {}\n", remaining.green()));
    } else {
        out.push_str(&format!("\n  Remaining budget: {} (exhausted)\n", remaining.red()));
    }
    out
}
