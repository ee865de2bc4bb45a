use std::process::Stdio;

use crate::error::{OutlayError, ProcessError};
use crate::Result;

/// Runs profile commands once a configuration has been applied
pub trait CommandRunner {
    fn run(&mut self, command: &str);
}

/// Spawns each command through `/bin/sh -c` and forgets about it.
///
/// The child gets its own process group so signals aimed at the daemon don't
/// reach it, and its handle is dropped right away: tokio reaps it in the
/// background. Must be called from within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn spawn_detached(command: &str) -> Result<u32> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|e| {
            OutlayError::Process(ProcessError::Execution {
                command: command.to_string(),
                source: e,
            })
        })?;

        Ok(child.id().unwrap_or_default())
    }
}

impl CommandRunner for ProcessExecutor {
    fn run(&mut self, command: &str) {
        log::info!("Running command '{}'", command);
        match Self::spawn_detached(command) {
            Ok(pid) => log::debug!("Command '{}' started as pid {}", command, pid),
            Err(e) => log::error!("Executing command '{}' failed: {}", command, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_spawn_detached_runs_shell() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ran");
        let command = format!("echo docked > '{}'", path.display());

        ProcessExecutor::spawn_detached(&command).unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if !text.is_empty() {
                    contents = text;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents.trim(), "docked");
    }

    #[tokio::test]
    async fn test_run_does_not_wait() {
        let mut executor = ProcessExecutor::new();
        let start = std::time::Instant::now();
        executor.run("sleep 5");
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
