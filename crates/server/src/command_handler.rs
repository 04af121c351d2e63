//! Task handler that delegates each item to a shell command.
//!
//! The item is written to the command's stdin as JSON. Exit status decides
//! the outcome:
//!
//! | exit | outcome |
//! |------|---------|
//! | 0    | item removed |
//! | 75 (`EX_TEMPFAIL`) | item requeued; stdout replaces it when it is valid JSON |
//! | other | task failure, handled by the fault policy |

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use sluice_queue::{Outcome, TaskError, TaskHandler};

const EX_TEMPFAIL: i32 = 75;

pub struct CommandHandler {
    command: Option<String>,
}

impl CommandHandler {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    type Item = Value;

    async fn process(&self, item: Value) -> Result<Outcome<Value>, TaskError> {
        let Some(command) = &self.command else {
            return Err(TaskError::Fatal("QUEUE_HANDLER_COMMAND is not set".into()));
        };
        let input = serde_json::to_vec(&item).map_err(|e| TaskError::Failed(format!("unencodable item: {e}")))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Fatal(format!("cannot spawn handler command: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin may exit before reading it.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "handler command did not read its input");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskError::Failed(format!("handler command did not finish: {e}")))?;

        match output.status.code() {
            Some(0) => Ok(Outcome::Remove),
            Some(EX_TEMPFAIL) => {
                let next = serde_json::from_slice(&output.stdout).unwrap_or(item);
                Ok(Outcome::Requeue(next))
            }
            code => Err(TaskError::Failed(format!(
                "handler command exited with {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(command: &str) -> CommandHandler {
        CommandHandler::new(Some(command.to_string()))
    }

    #[tokio::test]
    async fn zero_exit_removes_item() {
        let outcome = handler("cat > /dev/null").process(json!({"id": 1})).await.unwrap();
        assert_eq!(outcome, Outcome::Remove);
    }

    #[tokio::test]
    async fn tempfail_requeues_with_stdout_replacement() {
        let outcome = handler(r#"cat > /dev/null; echo '{"id": 1, "attempt": 2}'; exit 75"#)
            .process(json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Requeue(json!({"id": 1, "attempt": 2})));
    }

    #[tokio::test]
    async fn tempfail_without_output_keeps_item() {
        let outcome = handler("exit 75").process(json!({"id": 1})).await.unwrap();
        assert_eq!(outcome, Outcome::Requeue(json!({"id": 1})));
    }

    #[tokio::test]
    async fn item_is_passed_on_stdin() {
        let outcome = handler(r#"grep -q '"id":7' && exit 0 || exit 3"#)
            .process(json!({"id": 7}))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Remove);
    }

    #[tokio::test]
    async fn other_exit_is_a_task_failure() {
        let err = handler("echo nope >&2; exit 3").process(json!(null)).await.unwrap_err();
        assert_eq!(err, TaskError::Failed("handler command exited with 3: nope".into()));
    }

    #[tokio::test]
    async fn missing_command_is_fatal() {
        let err = CommandHandler::new(None).process(json!(1)).await.unwrap_err();
        assert!(matches!(err, TaskError::Fatal(_)));
    }
}
