//! Configuration: a YAML file merged with CLI overrides into one `Config`.
//!
//! `Read` is the untyped shape deserialized straight off a YAML document
//! (with `yaml-merge-keys` applied so `<<:` anchors work), and `Config` is
//! what comes out after CLI arguments have overridden it field-by-field and
//! every string has been parsed into the type the core actually wants.

use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use mergebot::embargo::{EmbargoError, IntervalUnion};
use mergebot::job::{strategy_allows_tested_by, MergeStrategy};
use mergebot::trailers::TrailerToggles;

use crate::time_interval;

/// The untyped configuration shape, as read from a YAML file or produced
/// from parsed CLI arguments. Every field is optional so the two sources
/// can be merged with CLI values taking priority.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Read {
    pub gitlab_url: Option<String>,
    pub project_regexp: Option<String>,
    pub branch_regexp: Option<String>,
    pub embargo: Option<String>,
    pub merge_strategy: Option<String>,
    pub add_tested: Option<bool>,
    pub add_part_of: Option<bool>,
    pub add_reviewers: Option<bool>,
    pub reapprove: Option<bool>,
    pub approval_timeout: Option<String>,
    pub ci_timeout: Option<String>,
    pub ci_timeout_skip: Option<bool>,
    pub require_ci_run_by_me: Option<bool>,
    pub git_timeout: Option<String>,
    pub batch: Option<bool>,
    pub priority_labels: Option<Vec<String>>,
    pub skip_pending: Option<bool>,
    pub poll_interval: Option<String>,
    pub workspace: Option<String>,
}

/// Errors reading or parsing the YAML configuration document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReadError {
    #[error("failed to parse YAML document: {}", source)]
    YamlParse {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("failed to perform YAML merge keys: {}", source)]
    YamlMergeKeys {
        #[from]
        source: yaml_merge_keys::MergeKeyError,
    },
}

type ReadResult<T> = Result<T, ReadError>;

impl Read {
    fn from_bytes_impl(data: &[u8]) -> ReadResult<Self> {
        serde_yaml::from_slice(data)
            .map_err(ReadError::from)
            .and_then(|doc| yaml_merge_keys::merge_keys_serde(doc).map_err(ReadError::from))
            .and_then(|doc| serde_yaml::from_value(doc).map_err(ReadError::from))
    }

    /// Parse a YAML configuration document.
    pub fn from_bytes<D>(data: D) -> ReadResult<Self>
    where
        D: AsRef<[u8]>,
    {
        Self::from_bytes_impl(data.as_ref())
    }

    /// Overlay `cli` on top of `self` (the file contents): any field `cli`
    /// set wins, file contents fill the rest.
    pub fn merged_with(self, cli: Read) -> Read {
        Read {
            gitlab_url: cli.gitlab_url.or(self.gitlab_url),
            project_regexp: cli.project_regexp.or(self.project_regexp),
            branch_regexp: cli.branch_regexp.or(self.branch_regexp),
            embargo: cli.embargo.or(self.embargo),
            merge_strategy: cli.merge_strategy.or(self.merge_strategy),
            add_tested: cli.add_tested.or(self.add_tested),
            add_part_of: cli.add_part_of.or(self.add_part_of),
            add_reviewers: cli.add_reviewers.or(self.add_reviewers),
            reapprove: cli.reapprove.or(self.reapprove),
            approval_timeout: cli.approval_timeout.or(self.approval_timeout),
            ci_timeout: cli.ci_timeout.or(self.ci_timeout),
            ci_timeout_skip: cli.ci_timeout_skip.or(self.ci_timeout_skip),
            require_ci_run_by_me: cli.require_ci_run_by_me.or(self.require_ci_run_by_me),
            git_timeout: cli.git_timeout.or(self.git_timeout),
            batch: cli.batch.or(self.batch),
            priority_labels: cli.priority_labels.or(self.priority_labels),
            skip_pending: cli.skip_pending.or(self.skip_pending),
            poll_interval: cli.poll_interval.or(self.poll_interval),
            workspace: cli.workspace.or(self.workspace),
        }
    }
}

/// Errors finalizing a merged `Read` into a `Config`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read the configuration: {}", source)]
    Read {
        #[from]
        source: ReadError,
    },
    #[error("missing required configuration value: --{}", name)]
    Missing { name: &'static str },
    #[error("invalid regular expression for --{}: {}", name, source)]
    Regexp {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid --embargo: {}", source)]
    Embargo {
        #[from]
        source: EmbargoError,
    },
    #[error("invalid --merge-strategy {:?}: expected rebase, merge, or rebase-then-merge", value)]
    MergeStrategy { value: String },
    #[error("invalid duration for --{}: {}", name, source)]
    Duration {
        name: &'static str,
        #[source]
        source: time_interval::ParseError,
    },
    #[error("--merge-strategy=merge is incompatible with --add-tested")]
    MergeConflictsWithTested,
    #[error("--merge-strategy=merge is incompatible with --batch")]
    MergeConflictsWithBatch,
    #[error("--batch is incompatible with --add-tested")]
    BatchConflictsWithTested,
}

type ConfigResult<T> = Result<T, ConfigError>;

/// Fully resolved settings handed to the scheduler and merge jobs.
pub struct Config {
    pub gitlab_url: String,
    pub project_regexp: Regex,
    pub branch_regexp: Regex,
    pub embargo: IntervalUnion,
    pub merge_strategy: MergeStrategy,
    pub trailers: TrailerToggles,
    pub reapprove: bool,
    pub approval_timeout: Duration,
    pub ci_timeout: Duration,
    pub ci_timeout_skip: bool,
    pub require_ci_run_by_me: bool,
    pub git_timeout: Duration,
    pub batch: bool,
    pub priority_labels: Vec<String>,
    pub skip_pending: bool,
    pub poll_interval: Duration,
    pub workspace: String,
}

fn parse_merge_strategy(value: &str) -> ConfigResult<MergeStrategy> {
    match value {
        "rebase" => Ok(MergeStrategy::Rebase),
        "merge" => Ok(MergeStrategy::Merge),
        "rebase-then-merge" | "rebase_then_merge" => Ok(MergeStrategy::RebaseThenMerge),
        other => Err(ConfigError::MergeStrategy {
            value: other.to_owned(),
        }),
    }
}

fn duration(name: &'static str, value: Option<&str>, default: &str) -> ConfigResult<Duration> {
    time_interval::parse(value.unwrap_or(default)).map_err(|source| ConfigError::Duration {
        name,
        source,
    })
}

fn regexp(name: &'static str, value: Option<&str>) -> ConfigResult<Regex> {
    Regex::new(value.unwrap_or(".*")).map_err(|source| ConfigError::Regexp {
        name,
        source,
    })
}

impl Config {
    /// Resolve a merged `Read` (CLI overrides already applied) into a
    /// `Config`, filling in defaults and rejecting mutually exclusive
    /// combinations (see `MergeJobOptions::is_valid` and the batch
    /// constraints in `batch.rs`).
    pub fn load(read: Read) -> ConfigResult<Self> {
        let gitlab_url = read.gitlab_url.ok_or(ConfigError::Missing {
            name: "gitlab-url",
        })?;

        let merge_strategy = read
            .merge_strategy
            .as_deref()
            .map(parse_merge_strategy)
            .transpose()?
            .unwrap_or(MergeStrategy::Rebase);

        let trailers = TrailerToggles {
            add_tested: read.add_tested.unwrap_or(false),
            add_part_of: read.add_part_of.unwrap_or(false),
            add_reviewers: read.add_reviewers.unwrap_or(false),
        };
        let batch = read.batch.unwrap_or(false);

        if !strategy_allows_tested_by(merge_strategy, trailers.add_tested) {
            return Err(ConfigError::MergeConflictsWithTested);
        }
        if merge_strategy == MergeStrategy::Merge && batch {
            return Err(ConfigError::MergeConflictsWithBatch);
        }
        if batch && trailers.add_tested {
            return Err(ConfigError::BatchConflictsWithTested);
        }

        Ok(Self {
            project_regexp: regexp("project-regexp", read.project_regexp.as_deref())?,
            branch_regexp: regexp("branch-regexp", read.branch_regexp.as_deref())?,
            embargo: read
                .embargo
                .as_deref()
                .map(IntervalUnion::parse)
                .transpose()?
                .unwrap_or_else(IntervalUnion::none),
            reapprove: read.reapprove.unwrap_or(false),
            approval_timeout: duration(
                "approval-timeout",
                read.approval_timeout.as_deref(),
                "0s",
            )?,
            ci_timeout: duration("ci-timeout", read.ci_timeout.as_deref(), "15min")?,
            ci_timeout_skip: read.ci_timeout_skip.unwrap_or(false),
            require_ci_run_by_me: read.require_ci_run_by_me.unwrap_or(false),
            git_timeout: duration("git-timeout", read.git_timeout.as_deref(), "120s")?,
            priority_labels: read.priority_labels.unwrap_or_default(),
            skip_pending: read.skip_pending.unwrap_or(false),
            poll_interval: duration("poll-interval", read.poll_interval.as_deref(), "30s")?,
            workspace: read.workspace.unwrap_or_else(|| "mergebot-workspace".into()),
            gitlab_url,
            merge_strategy,
            trailers,
            batch,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_with(gitlab_url: &str) -> Read {
        Read {
            gitlab_url: Some(gitlab_url.to_owned()),
            ..Read::default()
        }
    }

    #[test]
    fn test_load_requires_gitlab_url() {
        let err = Config::load(Read::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { name: "gitlab-url" }));
    }

    #[test]
    fn test_load_fills_in_defaults() {
        let config = Config::load(read_with("gitlab.example.com")).unwrap();
        assert_eq!(config.merge_strategy, MergeStrategy::Rebase);
        assert!(!config.batch);
        assert!(!config.trailers.add_tested);
    }

    #[test]
    fn test_merge_strategy_merge_rejects_add_tested() {
        let mut read = read_with("gitlab.example.com");
        read.merge_strategy = Some("merge".to_owned());
        read.add_tested = Some(true);

        let err = Config::load(read).unwrap_err();
        assert!(matches!(err, ConfigError::MergeConflictsWithTested));
    }

    #[test]
    fn test_merge_strategy_merge_rejects_batch() {
        let mut read = read_with("gitlab.example.com");
        read.merge_strategy = Some("merge".to_owned());
        read.batch = Some(true);

        let err = Config::load(read).unwrap_err();
        assert!(matches!(err, ConfigError::MergeConflictsWithBatch));
    }

    #[test]
    fn test_batch_rejects_add_tested() {
        let mut read = read_with("gitlab.example.com");
        read.merge_strategy = Some("rebase".to_owned());
        read.batch = Some(true);
        read.add_tested = Some(true);

        let err = Config::load(read).unwrap_err();
        assert!(matches!(err, ConfigError::BatchConflictsWithTested));
    }

    #[test]
    fn test_batch_with_rebase_and_no_tested_is_accepted() {
        let mut read = read_with("gitlab.example.com");
        read.merge_strategy = Some("rebase".to_owned());
        read.batch = Some(true);

        let config = Config::load(read).unwrap();
        assert!(config.batch);
    }
}
