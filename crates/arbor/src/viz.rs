//! Terminal rendering of invocation trees.
//!
//! Renders a [`NodeView`] as an ANSI tree frame: one line per node with a
//! state glyph (animated spinner while Running), truncated inputs, and a
//! short result or fault suffix. The output is a full frame; callers
//! typically clear the screen between frames.

use arbor_contract::args::ArgMap;
use arbor_contract::view::{NodeState, NodeView};
use console::style;
use std::sync::Arc;
use std::time::Instant;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn shorten(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let head: String = s.chars().take(max_len.saturating_sub(1)).collect();
    format!("{head}…")
}

fn format_args(inputs: &ArgMap, max_len: usize) -> String {
    if inputs.is_empty() {
        return String::new();
    }
    let items: Vec<String> = inputs
        .iter()
        .map(|(k, v)| format!("{k}={}", shorten(&v.render(), 20)))
        .collect();
    shorten(&items.join(", "), max_len)
}

/// Stateful renderer with a time-based spinner. Re-rendering without a new
/// view animates the last one.
pub struct ConsoleRender {
    spinner_hz: f64,
    started: Instant,
    last_view: Option<Arc<NodeView>>,
}

impl Default for ConsoleRender {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleRender {
    pub fn new() -> Self {
        Self {
            spinner_hz: 10.0,
            started: Instant::now(),
            last_view: None,
        }
    }

    fn tick(&self) -> usize {
        let dt = self.started.elapsed().as_secs_f64();
        (dt * self.spinner_hz.max(1.0)) as usize
    }

    fn glyph(&self, state: NodeState) -> String {
        match state {
            NodeState::Waiting => style("…").yellow().bold().to_string(),
            NodeState::Running => {
                let frame = SPINNER_FRAMES[self.tick() % SPINNER_FRAMES.len()];
                style(frame).cyan().bold().to_string()
            }
            NodeState::Success => style("✔").green().bold().to_string(),
            NodeState::Error => style("✖").red().bold().to_string(),
        }
    }

    /// Render a frame. Passing `None` re-renders the most recent view.
    pub fn render(&mut self, view: Option<Arc<NodeView>>) -> String {
        if let Some(view) = view {
            self.last_view = Some(view);
        }
        let Some(view) = self.last_view.clone() else {
            return "(no data)".to_string();
        };

        let mut lines = Vec::new();
        self.render_node(&view, "", true, &mut lines);
        lines.join("\n")
    }

    fn render_node(
        &self,
        view: &NodeView,
        prefix: &str,
        is_last: bool,
        lines: &mut Vec<String>,
    ) {
        let mut header = format!(
            "{} {}",
            self.glyph(view.state),
            style(&view.func).bold()
        );
        let args = format_args(&view.inputs, 60);
        if !args.is_empty() {
            header.push_str(&format!("({})", style(args).dim()));
        }

        match view.state {
            NodeState::Success => {
                if let Some(outputs) = &view.outputs {
                    let rendered = match outputs.as_str() {
                        Some(s) => s.to_string(),
                        None => outputs.to_string(),
                    };
                    header.push_str(&format!(
                        " {} {}",
                        style("=>").dim(),
                        shorten(&rendered, 50)
                    ));
                }
            }
            NodeState::Error => {
                if let Some(exception) = &view.exception {
                    header.push_str(&format!(
                        " {} {}",
                        style("!!").red().bold(),
                        shorten(exception, 50)
                    ));
                }
            }
            _ => {}
        }

        if prefix.is_empty() {
            lines.push(header);
        } else {
            let branch = if is_last { "└─ " } else { "├─ " };
            lines.push(format!("{prefix}{branch}{header}"));
        }

        let child_prefix = format!("{prefix}{}", if is_last { "   " } else { "│  " });
        let count = view.children.len();
        for (idx, child) in view.children.iter().enumerate() {
            self.render_node(child, &child_prefix, idx == count - 1, lines);
        }
    }
}
