//! Shell-command task handlers

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use rigging_tasks::{HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskKind, TaskOutput};

/// Lines of stderr kept in a failure message
const ERROR_TAIL_LINES: usize = 20;

/// Executes the command configured for an entity with `sh -c` inside the
/// owning module's directory. Entities without a command succeed as no-ops.
#[derive(Debug, Clone)]
pub struct ShellHandler {
    kind: TaskKind,
    root: PathBuf,
}

impl ShellHandler {
    pub fn new(kind: TaskKind, root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
        }
    }

    /// Registry with a shell handler for every task kind
    pub fn registry(root: &Path) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in TaskKind::ALL {
            registry.register(ShellHandler::new(kind, root));
        }
        registry
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutput, TaskError> {
        let node = ctx.node()?;
        let command = match self.kind {
            TaskKind::Delete => node.delete_command.clone(),
            _ => node.command.clone(),
        };

        let Some(command) = command else {
            debug!(task = %ctx.task.key(), "no command configured, nothing to do");
            return Ok(TaskOutput::default());
        };

        let dir = self.root.join(&node.path);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .envs(&node.env)
            .env("RIGGING_TASK", ctx.task.key().to_string())
            .env("RIGGING_KIND", self.kind.as_str())
            .env("RIGGING_NAME", &ctx.task.name)
            .env("RIGGING_MODULE", &node.module)
            .env("RIGGING_VERSION", &ctx.task.version)
            .env("RIGGING_PROJECT_ROOT", &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task = %ctx.task.key(), dir = %dir.display(), %command, "spawning");
        let mut child = cmd
            .spawn()
            .map_err(|e| TaskError::failed(format!("Failed to spawn `{}`: {}", command, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout_lines, stderr_lines) =
            tokio::join!(read_lines(stdout, &ctx, false), read_lines(stderr, &ctx, true));

        let status = child
            .wait()
            .await
            .map_err(|e| TaskError::Internal(format!("Failed to wait: {}", e)))?;

        if status.success() {
            let mut log = stdout_lines;
            log.extend(stderr_lines);
            Ok(TaskOutput::new(log.join("\n")).with_data(serde_json::json!({
                "command": command,
                "exit_code": 0,
            })))
        } else {
            let tail = stderr_lines.len().saturating_sub(ERROR_TAIL_LINES);
            Err(TaskError::CommandFailed {
                code: status.code().unwrap_or(-1),
                message: stderr_lines[tail..].join("\n"),
            })
        }
    }
}

/// Forward each line as task output while collecting it
async fn read_lines<R>(reader: Option<R>, ctx: &TaskContext, is_stderr: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        ctx.output(line.clone(), is_stderr);
        collected.push(line);
    }
    collected
}
