//! Operator command surface.
//!
//! This module provides a deterministic command surface that a thin binary
//! wrapper can call: it parses `run` invocations into typed options and
//! maps outcomes to process exit codes. No terminal handling lives here.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::optimizer::RewardSpec;
use crate::orchestrator::OrchestratorConfig;

/// Parsed `run` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub rounds: u32,
    /// 1-based round to start from
    pub start_round: u32,
    pub delay_between_problems: Duration,
    pub delay_between_rounds: Duration,
    /// LLM model override; `None` keeps the environment default
    pub model: Option<String>,
    pub success_weight: f64,
    pub latency_weight: f64,
    pub attempts_weight: f64,
    /// A previous round's `prompts/` directory to resume from
    pub resume_from: Option<PathBuf>,
    /// Parent directory for run folders
    pub results_root: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rounds: 5,
            start_round: 1,
            delay_between_problems: Duration::from_secs(30),
            delay_between_rounds: Duration::from_secs(300),
            model: None,
            success_weight: 2.0,
            latency_weight: -0.3,
            attempts_weight: -0.2,
            resume_from: None,
            results_root: default_results_root(),
        }
    }
}

/// Storage root override from the environment, else `learning_results`.
fn default_results_root() -> PathBuf {
    std::env::var("SREMETA_STORAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("learning_results"))
}

impl RunOptions {
    /// Parse the arguments following the `run` command.
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(flag) = args.next() {
            let mut value_for = |flag: &str| {
                args.next()
                    .ok_or_else(|| Error::Config(format!("missing value for {}", flag)))
            };
            match flag.as_str() {
                "--rounds" => options.rounds = parse_number(&flag, &value_for(&flag)?)?,
                "--start-round" => options.start_round = parse_number(&flag, &value_for(&flag)?)?,
                "--delay-between-problems" => {
                    options.delay_between_problems =
                        Duration::from_secs(parse_number(&flag, &value_for(&flag)?)?)
                }
                "--delay-between-rounds" => {
                    options.delay_between_rounds =
                        Duration::from_secs(parse_number(&flag, &value_for(&flag)?)?)
                }
                "--model" => options.model = Some(value_for(&flag)?),
                "--success-weight" => options.success_weight = parse_number(&flag, &value_for(&flag)?)?,
                "--latency-weight" => options.latency_weight = parse_number(&flag, &value_for(&flag)?)?,
                "--attempts-weight" => options.attempts_weight = parse_number(&flag, &value_for(&flag)?)?,
                "--resume-from" => options.resume_from = Some(PathBuf::from(value_for(&flag)?)),
                "--results-root" => options.results_root = PathBuf::from(value_for(&flag)?),
                other => {
                    return Err(Error::Config(format!("unknown flag: {}", other)));
                }
            }
        }

        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.rounds == 0 {
            return Err(Error::Config("--rounds must be at least 1".to_string()));
        }
        if self.start_round == 0 || self.start_round > self.rounds {
            return Err(Error::Config(format!(
                "--start-round {} out of range 1..={}",
                self.start_round, self.rounds
            )));
        }
        if let Some(resume_from) = &self.resume_from {
            if !resume_from.is_dir() {
                return Err(Error::Config(format!(
                    "--resume-from '{}' is not a directory",
                    resume_from.display()
                )));
            }
            if resume_from.file_name().and_then(|n| n.to_str()) != Some("prompts") {
                return Err(Error::Config(format!(
                    "--resume-from must point to a previous round's prompts/ directory, got '{}'",
                    resume_from.display()
                )));
            }
        }
        Ok(())
    }

    pub fn reward_spec(&self) -> RewardSpec {
        RewardSpec::new(self.success_weight, self.latency_weight, self.attempts_weight)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            results_root: self.results_root.clone(),
            num_rounds: self.rounds,
            start_round: self.start_round,
            delay_between_problems: self.delay_between_problems,
            delay_between_rounds: self.delay_between_rounds,
            resume_from: self.resume_from.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

/// Commands the operator surface accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunOptions),
}

/// Parse a full argument list (without the program name).
pub fn parse_command<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    match args.next().as_deref() {
        Some("run") => Ok(Command::Run(RunOptions::parse(args)?)),
        Some(other) => Err(Error::Config(format!("unknown command: {}", other))),
        None => Err(Error::Config("no command given; expected 'run'".to_string())),
    }
}

/// Exit code for a finished invocation: 0 on success, 1 on unrecoverable
/// failure.
pub fn exit_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", value, flag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let options = RunOptions::parse(args(&[])).unwrap();
        assert_eq!(options.rounds, 5);
        assert_eq!(options.start_round, 1);
        assert_eq!(options.delay_between_problems, Duration::from_secs(30));
        assert_eq!(options.success_weight, 2.0);
        assert!(options.resume_from.is_none());
    }

    #[test]
    fn test_full_invocation() {
        let options = RunOptions::parse(args(&[
            "--rounds", "3",
            "--delay-between-problems", "10",
            "--delay-between-rounds", "60",
            "--model", "gemini-2.5-flash",
            "--success-weight", "1.0",
            "--latency-weight", "-0.5",
            "--attempts-weight", "-0.3",
        ]))
        .unwrap();

        assert_eq!(options.rounds, 3);
        assert_eq!(options.delay_between_rounds, Duration::from_secs(60));
        assert_eq!(options.model.as_deref(), Some("gemini-2.5-flash"));
        let spec = options.reward_spec();
        assert_eq!(spec.success_weight, 1.0);
        assert_eq!(spec.latency_weight, -0.5);
        assert_eq!(spec.attempts_weight, -0.3);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let err = RunOptions::parse(args(&["--frobnicate", "1"])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_value_rejected() {
        let err = RunOptions::parse(args(&["--rounds"])).unwrap_err();
        assert!(err.to_string().contains("missing value"));
    }

    #[test]
    fn test_malformed_number_rejected() {
        let err = RunOptions::parse(args(&["--rounds", "many"])).unwrap_err();
        assert!(err.to_string().contains("invalid value"));
    }

    #[test]
    fn test_start_round_range_checked() {
        let err = RunOptions::parse(args(&["--rounds", "2", "--start-round", "3"])).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_resume_from_must_be_prompts_dir() {
        let dir = tempdir().unwrap();
        let not_prompts = dir.path().join("points");
        std::fs::create_dir_all(&not_prompts).unwrap();

        let err = RunOptions::parse(args(&[
            "--start-round", "2",
            "--resume-from", not_prompts.to_str().unwrap(),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("prompts/"));

        let prompts = dir.path().join("prompts");
        std::fs::create_dir_all(&prompts).unwrap();
        let options = RunOptions::parse(args(&[
            "--start-round", "2",
            "--resume-from", prompts.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(options.resume_from.as_deref(), Some(prompts.as_path()));
    }

    #[test]
    fn test_parse_command() {
        let command = parse_command(args(&["run", "--rounds", "1"])).unwrap();
        assert!(matches!(command, Command::Run(options) if options.rounds == 1));

        assert!(parse_command(args(&["flurb"])).is_err());
        assert!(parse_command(args(&[])).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code::<()>(&Err(Error::Config("bad".into()))), 1);
    }
}
