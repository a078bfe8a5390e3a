//! mergebot-cli
//!
//! Polls a GitLab instance for merge requests assigned to the bot and
//! drives each one through the auto-merge state machine.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Arg;
use git_workarea::GitContext;
use log::{error, info, warn, LevelFilter};
use thiserror::Error;

mod exit_code;
use exit_code::ExitCode;

/// The signal `ctrlc::set_handler` installs a handler for on Unix.
const SIGINT: i32 = 2;

mod config;
use config::{Config, Read as ConfigRead};

mod time_interval;

use mergebot::forge::ForgeClient;
use mergebot::git::GitWorkingCopy;
use mergebot::job::{CancellableClock, JobOutcome, MergeJob, MergeJobOptions, MergeStrategy, SystemClock};
use mergebot::scheduler::Scheduler;
use mergebot_gitlab::gitlab as gitlab_crate;
use mergebot_gitlab::GitlabForge;

#[derive(Debug, Error)]
#[non_exhaustive]
enum SetupError {
    #[error("failed to read configuration file {}: {}", path, source)]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {}", source)]
    ConfigRead {
        #[from]
        source: config::ReadError,
    },
    #[error("invalid configuration: {}", source)]
    Config {
        #[from]
        source: config::ConfigError,
    },
    #[error("no authentication token given: pass --auth-token-file or set MERGEBOT_AUTH_TOKEN")]
    NoAuthToken,
    #[error("failed to read auth token file {}: {}", path, source)]
    AuthTokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no SSH private key given: pass --ssh-key-file or set MERGEBOT_SSH_KEY")]
    NoSshKey,
    #[error("failed to write the SSH private key to a temporary file: {}", source)]
    SshKeyTempFile {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {}: {}", url, source)]
    GitlabConnect {
        url: String,
        #[source]
        source: gitlab_crate::GitlabError,
    },
    #[error("failed to look up the bot's own user: {}", source)]
    Myself {
        #[from]
        source: mergebot::forge::ForgeError,
    },
    #[error("failed to install the termination signal handler: {}", source)]
    SignalHandler {
        #[from]
        source: ctrlc::Error,
    },
    #[error("failed to create workspace directory {}: {}", path, source)]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read an environment variable, treating an empty string the same as unset.
fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// Resolve the auth token: a file path takes priority over the environment.
fn read_auth_token(file: Option<&str>) -> Result<String, SetupError> {
    if let Some(path) = file {
        return fs::read_to_string(path)
            .map(|contents| contents.trim_end().to_owned())
            .map_err(|source| SetupError::AuthTokenFile {
                path: path.to_owned(),
                source,
            });
    }

    env_nonempty("MERGEBOT_AUTH_TOKEN").ok_or(SetupError::NoAuthToken)
}

/// Resolve the SSH private key. A file path is used as-is; an inline key
/// from the environment is written to a restricted-permission temporary
/// file, kept alive (and removed) for the lifetime of the returned guard.
fn resolve_ssh_key(
    file: Option<&str>,
) -> Result<(PathBuf, Option<tempfile::NamedTempFile>), SetupError> {
    if let Some(path) = file {
        return Ok((PathBuf::from(path), None));
    }

    let key = env_nonempty("MERGEBOT_SSH_KEY").ok_or(SetupError::NoSshKey)?;

    let mut temp = tempfile::NamedTempFile::new().map_err(|source| SetupError::SshKeyTempFile {
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|source| SetupError::SshKeyTempFile {
                source,
            })?;
    }
    {
        use std::io::Write;
        temp.write_all(key.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|source| SetupError::SshKeyTempFile {
                source,
            })?;
    }

    let path = temp.path().to_owned();
    Ok((path, Some(temp)))
}

fn cli_overrides(matches: &clap::ArgMatches) -> ConfigRead {
    let opt = |name: &str| matches.value_of(name).map(str::to_owned);
    let flag = |name: &str| matches.is_present(name).then(|| true);
    // `--embargo` may be repeated; join every occurrence into the same
    // comma-separated form `IntervalUnion::parse` accepts from a YAML file.
    let embargo = matches
        .values_of("EMBARGO")
        .map(|values| values.collect::<Vec<_>>().join(","));

    ConfigRead {
        gitlab_url: opt("GITLAB_URL"),
        project_regexp: opt("PROJECT_REGEXP"),
        branch_regexp: opt("BRANCH_REGEXP"),
        embargo,
        merge_strategy: opt("MERGE_STRATEGY"),
        add_tested: flag("ADD_TESTED"),
        add_part_of: flag("ADD_PART_OF"),
        add_reviewers: flag("ADD_REVIEWERS"),
        reapprove: flag("REAPPROVE"),
        approval_timeout: opt("APPROVAL_TIMEOUT"),
        ci_timeout: opt("CI_TIMEOUT"),
        ci_timeout_skip: flag("CI_TIMEOUT_SKIP"),
        require_ci_run_by_me: flag("REQUIRE_CI_RUN_BY_ME"),
        git_timeout: opt("GIT_TIMEOUT"),
        batch: flag("BATCH"),
        priority_labels: matches
            .values_of("PRIORITY_LABELS")
            .map(|values| values.map(str::to_owned).collect()),
        skip_pending: flag("SKIP_PENDING"),
        poll_interval: opt("POLL_INTERVAL"),
        workspace: opt("WORKSPACE"),
    }
}

fn options_from_config(config: &Config) -> MergeJobOptions {
    MergeJobOptions {
        trailers: config.trailers,
        reapprove: config.reapprove,
        approval_timeout: config.approval_timeout,
        embargo: config.embargo.clone(),
        ci_timeout: config.ci_timeout,
        ci_timeout_skip: config.ci_timeout_skip,
        merge_strategy: config.merge_strategy,
        require_ci_run_by_me: config.require_ci_run_by_me,
    }
}

/// Sleep `duration`, but return early once `cancel` is set partway through.
fn interruptible_sleep(duration: Duration, cancel: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(500);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let slice = remaining.min(STEP);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

fn try_main() -> Result<ExitCode, SetupError> {
    let matches = clap::Command::new("mergebot")
        .version(clap::crate_version!())
        .author("mergebot developers")
        .about("Auto-merge agent for GitLab merge requests")
        .arg(
            Arg::new("CONFIG")
                .help("Path to a YAML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::new("DEBUG")
                .short('d')
                .long("debug")
                .help("Increase verbosity")
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("GITLAB_URL")
                .long("gitlab-url")
                .help("Base URL of the GitLab instance")
                .takes_value(true),
        )
        .arg(
            Arg::new("AUTH_TOKEN_FILE")
                .long("auth-token-file")
                .help("Path to a file containing the auth token (else MERGEBOT_AUTH_TOKEN)")
                .takes_value(true),
        )
        .arg(
            Arg::new("SSH_KEY_FILE")
                .long("ssh-key-file")
                .help("Path to the SSH private key (else MERGEBOT_SSH_KEY)")
                .takes_value(true),
        )
        .arg(
            Arg::new("PROJECT_REGEXP")
                .long("project-regexp")
                .help("Only operate on projects whose SSH URL matches this pattern")
                .takes_value(true),
        )
        .arg(
            Arg::new("BRANCH_REGEXP")
                .long("branch-regexp")
                .help("Only operate on merge requests targeting a matching branch")
                .takes_value(true),
        )
        .arg(
            Arg::new("EMBARGO")
                .long("embargo")
                .help("Windows during which no merge may proceed, e.g. 'Friday 1pm - Monday 9am'")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("MERGE_STRATEGY")
                .long("merge-strategy")
                .help("How to bring target changes into the source branch")
                .possible_values(["rebase", "merge", "rebase-then-merge"])
                .takes_value(true),
        )
        .arg(Arg::new("ADD_TESTED").long("add-tested").help("Stamp a Tested-by trailer"))
        .arg(Arg::new("ADD_PART_OF").long("add-part-of").help("Stamp a Part-of trailer"))
        .arg(
            Arg::new("ADD_REVIEWERS")
                .long("add-reviewers")
                .help("Stamp a Reviewed-by trailer per approver"),
        )
        .arg(
            Arg::new("REAPPROVE")
                .long("reapprove")
                .alias("impersonate-approvers")
                .help("Re-approve on behalf of prior approvers after a force-push"),
        )
        .arg(
            Arg::new("APPROVAL_TIMEOUT")
                .long("approval-timeout")
                .help("How long to wait for approvals to settle, e.g. 30s")
                .takes_value(true),
        )
        .arg(
            Arg::new("CI_TIMEOUT")
                .long("ci-timeout")
                .help("How long to wait for CI to complete, e.g. 15min")
                .takes_value(true),
        )
        .arg(
            Arg::new("CI_TIMEOUT_SKIP")
                .long("ci-timeout-skip")
                .help("Skip (rather than fail) a merge request whose CI takes too long"),
        )
        .arg(
            Arg::new("REQUIRE_CI_RUN_BY_ME")
                .long("require-ci-run-by-me")
                .help("Start a pipeline under the bot's own identity if none exists yet"),
        )
        .arg(
            Arg::new("GIT_TIMEOUT")
                .long("git-timeout")
                .help("Per-subprocess Git timeout, e.g. 120s")
                .takes_value(true),
        )
        .arg(Arg::new("BATCH").long("batch").help(
            "Fuse eligible merge requests sharing a target branch onto one staging branch",
        ))
        .arg(
            Arg::new("PRIORITY_LABELS")
                .long("priority-label")
                .help("A label that, applied to every merge request carrying it, jumps the queue")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(Arg::new("SKIP_PENDING").long("skip-pending").help(
            "Advance past an ineligible merge request instead of blocking the queue on it",
        ))
        .arg(
            Arg::new("POLL_INTERVAL")
                .long("poll-interval")
                .help("How long to sleep between polling cycles, e.g. 30s")
                .takes_value(true),
        )
        .arg(
            Arg::new("WORKSPACE")
                .long("workspace")
                .help("Directory under which each project's working copy is kept")
                .takes_value(true),
        )
        .get_matches();

    let log_level = match matches.occurrences_of("DEBUG") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter(None, log_level).init();
    log::set_max_level(log_level);

    let file_config = match matches.value_of("CONFIG") {
        Some(path) => {
            let contents = fs::read(path).map_err(|source| SetupError::ConfigFile {
                path: path.to_owned(),
                source,
            })?;
            ConfigRead::from_bytes(contents)?
        },
        None => ConfigRead::default(),
    };
    let config = Config::load(file_config.merged_with(cli_overrides(&matches)))?;

    let auth_token = read_auth_token(matches.value_of("AUTH_TOKEN_FILE"))?;
    let (ssh_key_path, ssh_key_guard) = resolve_ssh_key(matches.value_of("SSH_KEY_FILE"))?;
    env::set_var(
        "GIT_SSH_COMMAND",
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            ssh_key_path.display()
        ),
    );

    let host = config
        .gitlab_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_owned();
    let gitlab =
        gitlab_crate::Gitlab::new(&host, auth_token).map_err(|source| SetupError::GitlabConnect {
            url: config.gitlab_url.clone(),
            source,
        })?;
    let forge: Arc<dyn ForgeClient> = Arc::new(GitlabForge::new(gitlab));

    let me = forge.myself()?;
    info!(target: "mergebot", "authenticated as {}", me.username);

    fs::create_dir_all(&config.workspace).map_err(|source| SetupError::Workspace {
        path: config.workspace.clone(),
        source,
    })?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            warn!(target: "mergebot", "termination requested, finishing the current step");
            cancel.store(true, Ordering::SeqCst);
        })?;
    }

    let options = options_from_config(&config);

    let scheduler = Scheduler::new(Arc::clone(&forge), me.id)
        .with_priority_labels(config.priority_labels.clone())
        .with_branch_regexp(config.branch_regexp.clone())
        .with_skip_pending(config.skip_pending)
        .with_cancellation(Arc::clone(&cancel));

    while !cancel.load(Ordering::SeqCst) {
        let projects = match scheduler.matching_projects(&config.project_regexp) {
            Ok(projects) => projects,
            Err(err) => {
                warn!(target: "mergebot", "failed to list projects: {}", err);
                interruptible_sleep(config.poll_interval, &cancel);
                continue;
            },
        };

        for project in projects {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let workdir = PathBuf::from(&config.workspace).join(project.id.0.to_string());
            if let Err(err) = fs::create_dir_all(&workdir) {
                warn!(target: "mergebot", "failed to create working copy for {}: {}", project.id, err);
                continue;
            }

            let ctx = GitContext::new(&workdir);
            let git = GitWorkingCopy::new(ctx, config.git_timeout);
            let clock = Arc::new(CancellableClock::new(SystemClock, Arc::clone(&cancel)));
            let job = MergeJob::with_clock(
                Arc::clone(&forge),
                git,
                options.clone(),
                me.name.clone(),
                clock,
            );

            if config.batch && options.merge_strategy != MergeStrategy::Merge {
                let batch_clock = Arc::new(CancellableClock::new(SystemClock, Arc::clone(&cancel)));
                run_batch(
                    &scheduler,
                    &forge,
                    &project,
                    &options,
                    &workdir,
                    config.git_timeout,
                    &job,
                    batch_clock,
                );
            } else {
                scheduler.dispatch(&project, &job);
            }
        }

        if cancel.load(Ordering::SeqCst) {
            break;
        }
        interruptible_sleep(config.poll_interval, &cancel);
    }

    drop(ssh_key_guard);

    // `ctrlc` (without the `termination` feature) only ever installs a
    // SIGINT handler on Unix, so a cancelled run always died to SIGINT.
    if cancel.load(Ordering::SeqCst) {
        Ok(ExitCode::Signal(SIGINT))
    } else {
        Ok(ExitCode::Success)
    }
}

/// Group this project's eligible merge requests by target branch and hand
/// each group to a `BatchJob`; a partial failure demotes the rest of that
/// group to the ordinary per-merge-request scheduler path.
fn run_batch(
    scheduler: &Scheduler,
    forge: &Arc<dyn ForgeClient>,
    project: &mergebot::forge::Project,
    options: &MergeJobOptions,
    workdir: &std::path::Path,
    git_timeout: Duration,
    job: &MergeJob,
    clock: Arc<dyn mergebot::job::Clock>,
) {
    use itertools::Itertools;
    use mergebot::batch::{BatchJob, BatchOutcome};

    let mrs = match scheduler.eligible_merge_requests(project) {
        Ok(mrs) => mrs,
        Err(err) => {
            warn!(target: "mergebot", "failed to list merge requests for {}: {}", project.id, err);
            return;
        },
    };

    let grouped = mrs.into_iter().into_group_map_by(|mr| mr.target_branch.clone());

    for (target_branch, group) in grouped {
        if group.len() < 2 {
            for mr in &group {
                match job.run(project.id, mr.iid) {
                    Ok(JobOutcome::Success) => info!(target: "mergebot", "merged !{}", mr.iid),
                    Ok(JobOutcome::Skipped(reason)) => {
                        info!(target: "mergebot", "skipped !{}: {}", mr.iid, reason)
                    },
                    Err(err) => warn!(target: "mergebot", "!{} failed: {}", mr.iid, err),
                }
            }
            continue;
        }

        let ctx = GitContext::new(workdir);
        let git = GitWorkingCopy::new(ctx, git_timeout);
        let batch = BatchJob::with_clock(Arc::clone(forge), git, options.clone(), Arc::clone(&clock));

        match batch.run(project.id, &target_branch, &group) {
            Ok(BatchOutcome::Success(iids)) => {
                info!(target: "mergebot", "batch merged {:?} onto {}", iids, target_branch);
            },
            Ok(BatchOutcome::PartialFailure {
                merged,
                failed_iid,
                reason,
                deferred,
            }) => {
                warn!(
                    target: "mergebot",
                    "batch onto {} merged {:?}, then !{} failed: {}; deferring {:?}",
                    target_branch, merged, failed_iid, reason, deferred,
                );
                if let Err(err) = forge.post_comment(project.id, failed_iid, &reason) {
                    warn!(target: "mergebot", "failed to comment on !{}: {}", failed_iid, err);
                }
                for mr in group.iter().filter(|mr| deferred.contains(&mr.iid)) {
                    match job.run(project.id, mr.iid) {
                        Ok(JobOutcome::Success) => info!(target: "mergebot", "merged !{}", mr.iid),
                        Ok(JobOutcome::Skipped(reason)) => {
                            info!(target: "mergebot", "skipped !{}: {}", mr.iid, reason)
                        },
                        Err(err) => warn!(target: "mergebot", "!{} failed: {}", mr.iid, err),
                    }
                }
            },
            Err(err) => {
                warn!(target: "mergebot", "batch onto {} could not start: {}", target_branch, err);
            },
        }
    }
}

fn main() {
    match try_main() {
        Ok(code) => {
            code.exit();
        },
        Err(err) => {
            error!(target: "mergebot", "{}", err);
            ExitCode::Failure.exit();
        },
    }
}
