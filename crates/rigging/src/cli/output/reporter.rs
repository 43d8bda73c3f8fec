//! Console rendering of task events

use console::style;

use rigging_tasks::{SkipReason, TaskEvent, TaskReporter};

/// Console reporter with live output
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::GraphStarted { task_count } => {
                if self.verbose {
                    println!("  {} {} tasks", style("─").dim(), task_count);
                }
            }
            TaskEvent::Started { key, version } => {
                println!(
                    "  {} {} {}",
                    style("▸").dim(),
                    style(key).bold(),
                    if self.verbose {
                        style(format!("@ {}", version)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            TaskEvent::Output { key, line, is_stderr } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", key)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", key)).dim(), line);
                    }
                }
            }
            TaskEvent::Completed {
                key,
                duration,
                cached,
            } => {
                if *cached {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        style(key).green(),
                        style("(cached)").cyan(),
                    );
                } else {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        style(key).green(),
                        style(format!("{:.1}s", duration.as_secs_f64())).dim()
                    );
                }
            }
            TaskEvent::Failed {
                key,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(key).red(),
                    style(format!("{:.1}s", duration.as_secs_f64())).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Skipped { key, reason } => {
                // Cancellation is summarised once, not per task
                if *reason != SkipReason::Cancelled || self.verbose {
                    println!(
                        "  {} {} {}",
                        style("○").yellow(),
                        style(key).yellow(),
                        style(format!("({})", reason)).dim()
                    );
                }
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                failed,
                skipped,
                cached,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} skipped, {} cached ({:.1}s)",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cached,
                    duration.as_secs_f64()
                );
            }
            TaskEvent::BatchSubmitted {
                batch,
                task_count,
                trigger,
            } => {
                println!();
                println!(
                    "{} Batch {} ({} tasks) {}",
                    style("→").blue(),
                    batch,
                    task_count,
                    style(format!("after {}", trigger)).dim()
                );
            }
            TaskEvent::BatchCompleted {
                batch,
                total,
                failed,
                duration,
            } => {
                if *failed == 0 {
                    println!(
                        "{} Batch {} done: {} tasks ({:.1}s)",
                        style("✓").green().bold(),
                        batch,
                        total,
                        duration.as_secs_f64()
                    );
                } else {
                    println!(
                        "{} Batch {} done: {}/{} failed ({:.1}s), still watching",
                        style("✗").red().bold(),
                        batch,
                        failed,
                        total,
                        duration.as_secs_f64()
                    );
                }
            }
            TaskEvent::WatchError { message } => {
                eprintln!(
                    "{} {} {}",
                    style("!").yellow().bold(),
                    message,
                    style("(still watching)").dim()
                );
            }
        }
    }
}
