//! One-time environment preparation.
//!
//! Each worker slot gets its own test database (`TEST_ENV_NUMBER=n`), so the
//! preparation steps run once per slot, all slots in parallel, before any
//! worker starts. Output of every step is collected and relayed upstream.

use futures::future::join_all;
use tracing::debug;

use super::{RunnerError, RunnerResult};
use crate::config::PrepareConfig;
use crate::process::Command;

/// One preparation step, run for every slot.
#[derive(Debug, Clone)]
pub struct PrepareStep {
    /// Shown as the `process` of the relayed output.
    pub name: String,
    pub command: Command,
}

/// Builds the enabled steps, in execution order.
pub fn steps(config: &PrepareConfig) -> Vec<PrepareStep> {
    let mut steps = Vec::new();

    if config.load_schema {
        steps.push(PrepareStep {
            name: "db:schema:load".to_string(),
            command: Command::new("bundle").args(["exec", "rake", "db:drop", "db:create", "db:schema:load"]),
        });
    }

    if config.migrate {
        steps.push(PrepareStep {
            name: "db:migrate".to_string(),
            command: Command::new("bundle").args(["exec", "rake", "db:migrate"]),
        });
    }

    for line in &config.commands {
        steps.push(PrepareStep {
            name: line.clone(),
            command: Command::new("sh").arg("-c").arg(line),
        });
    }

    steps
}

/// Runs `step` for slots `1..=process_count` in parallel.
///
/// Returns the combined output of all slots. Fails if any slot fails.
pub async fn run_step(step: &PrepareStep, process_count: usize, environment: &str) -> RunnerResult<String> {
    let runs = (1..=process_count).map(|number| {
        let command = step
            .command
            .clone()
            .env("TEST_ENV_NUMBER", number.to_string())
            .env("RAILS_ENV", environment);

        async move {
            debug!("{} for database {}: {}", step.name, number, command.to_shell_string());
            let output = command.to_tokio().output().await?;

            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok::<_, std::io::Error>((output.status.success(), text))
        }
    });

    let mut combined = String::new();
    let mut failed = false;
    for outcome in join_all(runs).await {
        let (success, text) = outcome?;
        failed |= !success;
        combined.push_str(&text);
    }

    if failed {
        return Err(RunnerError::Prepare {
            step: step.name.clone(),
            output: combined,
        });
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_follow_config() {
        assert!(steps(&PrepareConfig::default()).is_empty());

        let names: Vec<_> = steps(&PrepareConfig {
            load_schema: true,
            migrate: true,
            commands: vec!["bin/seed".to_string()],
        })
        .into_iter()
        .map(|s| s.name)
        .collect();
        assert_eq!(names, vec!["db:schema:load", "db:migrate", "bin/seed"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_once_per_slot() {
        let step = &steps(&PrepareConfig {
            commands: vec!["echo \"db$TEST_ENV_NUMBER-$RAILS_ENV\"".to_string()],
            ..Default::default()
        })[0];

        let output = run_step(step, 3, "test").await.unwrap();
        let mut lines: Vec<_> = output.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["db1-test", "db2-test", "db3-test"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_slot_fails_step() {
        let step = &steps(&PrepareConfig {
            commands: vec!["[ \"$TEST_ENV_NUMBER\" != 2 ]".to_string()],
            ..Default::default()
        })[0];

        assert!(matches!(
            run_step(step, 2, "test").await,
            Err(RunnerError::Prepare { .. })
        ));
    }
}
