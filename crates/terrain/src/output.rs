use colored::Colorize;
use serde_json::json;

use terrain_core::{ComponentKind, DiscoveryOutcome};

/// Format a flat component listing for terminal output.
pub fn format_list(outcome: &DiscoveryOutcome, with_dependencies: bool) -> String {
    let mut out = String::new();
    if outcome.components.is_empty() {
        out.push_str("No components discovered\n");
        return out;
    }

    for component in &outcome.components {
        let kind = match component.kind() {
            ComponentKind::Unit => "unit ".cyan(),
            ComponentKind::Stack => "stack".magenta(),
        };
        out.push_str(&format!("{kind}  {}\n", component.path().display()));
        if with_dependencies {
            for dep in component.dependencies() {
                out.push_str(&format!("       {} {}\n", "->".dimmed(), dep.path().display()));
            }
        }
    }

    if !outcome.cycle_breaks.is_empty() {
        out.push_str(&format!("\n{}\n", "Cycles broken".yellow().bold()));
        for broken in &outcome.cycle_breaks {
            out.push_str(&format!(
                "  {} -> {}\n",
                broken.from.display(),
                broken.to.display()
            ));
        }
    }
    out
}

/// Format the components grouped into run levels: each level's
/// dependencies are satisfied by the levels above it.
pub fn format_levels(outcome: &DiscoveryOutcome) -> String {
    let mut out = String::new();
    if outcome.components.is_empty() {
        out.push_str("No components discovered\n");
        return out;
    }

    for (index, level) in terrain_core::run_levels(&outcome.components)
        .iter()
        .enumerate()
    {
        out.push_str(&format!("{}\n", format!("Level {index}").bold()));
        for component in level {
            out.push_str(&format!("  {}\n", component.path().display()));
            for dep in component.dependencies() {
                out.push_str(&format!("    {} {}\n", "->".dimmed(), dep.path().display()));
            }
        }
    }

    if !outcome.cycle_breaks.is_empty() {
        out.push_str(&format!("\n{}\n", "Cycles broken".yellow().bold()));
        for broken in &outcome.cycle_breaks {
            out.push_str(&format!(
                "  {} -> {}\n",
                broken.from.display(),
                broken.to.display()
            ));
        }
    }
    out
}

/// Format the outcome as JSON.
pub fn format_json(outcome: &DiscoveryOutcome, compact: bool) -> String {
    let value = json!({
        "components": outcome.records(),
        "cycle_breaks": outcome.cycle_breaks,
    });
    if compact {
        value.to_string()
    } else {
        serde_json::to_string_pretty(&value).expect("outcome should be serializable")
    }
}

/// Format the dependency graph as a GraphViz digraph.
pub fn format_dot(outcome: &DiscoveryOutcome) -> String {
    let mut out = String::new();
    out.push_str("digraph components {\n");
    out.push_str("  rankdir=TB;\n");
    out.push_str("  node [shape=box, style=filled, fillcolor=\"#e3f2fd\"];\n\n");

    for component in &outcome.components {
        let id = sanitize_dot_id(&component.path().to_string_lossy());
        out.push_str(&format!(
            "  {id} [label=\"{}\"];\n",
            component.name()
        ));
    }
    out.push('\n');
    for component in &outcome.components {
        let from = sanitize_dot_id(&component.path().to_string_lossy());
        for dep in component.dependencies() {
            let to = sanitize_dot_id(&dep.path().to_string_lossy());
            out.push_str(&format!("  {from} -> {to};\n"));
        }
    }
    out.push_str("}\n");
    out
}

fn sanitize_dot_id(raw: &str) -> String {
    let mut id: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if id.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}
