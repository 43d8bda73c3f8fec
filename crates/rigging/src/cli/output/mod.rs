//! Output formatting utilities

mod reporter;

pub use reporter::ConsoleReporter;

use console::{style, Style};
use rigging_tasks::{GraphResults, TaskStatus};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// `"1 task"` / `"3 tasks"`
pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else if noun.ends_with("ch") || noun.ends_with('s') {
        format!("{} {}es", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Short label for a task status
pub fn status_label(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::CacheHit => "cached",
        TaskStatus::Failed(_) => "failed",
        TaskStatus::Skipped(_) => "skipped",
    }
}

/// Machine-readable summary of a graph run
pub fn results_json(results: &GraphResults) -> serde_json::Value {
    let failed = results.failed().len();
    let skipped = results.skipped().len();
    serde_json::json!({
        "total": results.len(),
        "succeeded": results.len() - failed - skipped,
        "failed": failed,
        "skipped": skipped,
        "cached": results.cached(),
        "tasks": results.iter().map(|(key, r)| {
            serde_json::json!({
                "key": key.to_string(),
                "version": r.version,
                "status": status_label(&r.status),
                "error": r.error(),
                "started_at": r.started_at,
                "completed_at": r.completed_at,
                "duration_ms": r.duration.as_millis() as u64,
            })
        }).collect::<Vec<_>>(),
    })
}
