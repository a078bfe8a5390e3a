//! Trailer extraction and the policy that decides which trailers a merge job
//! should stamp onto the rewritten commits.

use std::fmt::{self, Display};

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

use crate::forge::{Approvals, ForgeClient, ForgeResult, MergeRequest, Project, User};

lazy_static! {
    static ref TRAILER_RE: Regex = Regex::new(
        "^\
         (?P<token>[[:alpha:]-]+)\
         :\\s+\
         (?P<value>.+?)\
         \\s*\
         $"
    )
    .unwrap();
}

/// A trailer from a commit message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerRef<'a> {
    /// The name of the trailer.
    pub token: &'a str,
    /// The value for the trailer.
    pub value: &'a str,
}

impl<'a> TrailerRef<'a> {
    /// Create a new trailer reference.
    fn new(token: &'a str, value: &'a str) -> Self {
        TrailerRef {
            token,
            value,
        }
    }

    /// Extract trailers from a commit message.
    pub fn extract(content: &'a str) -> Vec<Self> {
        let mut trailers = content
            .lines()
            .rev()
            .skip_while(|line| line.is_empty())
            .map(|line| TRAILER_RE.captures(line))
            .while_some()
            .map(|trailer| {
                Self::new(
                    trailer
                        .name("token")
                        .expect("the trailer regex should have a 'token' group")
                        .as_str(),
                    trailer
                        .name("value")
                        .expect("the trailer regex should have a 'value' group")
                        .as_str(),
                )
            })
            .collect::<Vec<_>>();

        trailers.reverse();

        trailers
    }
}

impl<'a> PartialEq<Trailer> for TrailerRef<'a> {
    fn eq(&self, other: &Trailer) -> bool {
        self.token == other.token && self.value == other.value
    }
}

impl<'a> Display for TrailerRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.token, self.value)
    }
}

/// A trailer from a commit message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Trailer {
    /// The name of the trailer.
    pub token: String,
    /// The value for the trailer.
    pub value: String,
}

impl Trailer {
    /// Create a new trailer.
    pub fn new<T, V>(token: T, value: V) -> Self
    where
        T: Into<String>,
        V: Into<String>,
    {
        Self {
            token: token.into(),
            value: value.into(),
        }
    }

    /// The trailer as a `TrailerRef`.
    pub fn as_ref(&self) -> TrailerRef {
        TrailerRef::new(&self.token, &self.value)
    }
}

impl<'a> From<TrailerRef<'a>> for Trailer {
    fn from(trailer_ref: TrailerRef<'a>) -> Self {
        Self::new(trailer_ref.token, trailer_ref.value)
    }
}

impl<'a> PartialEq<TrailerRef<'a>> for Trailer {
    fn eq(&self, other: &TrailerRef<'a>) -> bool {
        self.token == other.token && self.value == other.value
    }
}

impl Display for Trailer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.token, self.value)
    }
}

/// Which commit range a trailer needs rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteSpan {
    /// From the merge base with the target branch to the tip of the source.
    SinceTarget,
    /// Only the tip commit.
    TipOnly,
}

/// A trailer to stamp, and the span of commits it must be applied to.
#[derive(Debug, Clone)]
pub struct PlannedTrailer {
    /// The trailer itself.
    pub trailer: Trailer,
    /// The commits it needs to be applied across.
    pub span: RewriteSpan,
}

/// Toggles controlling which trailers a merge job stamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailerToggles {
    /// Stamp a `Reviewed-by` trailer per distinct approver.
    pub add_reviewers: bool,
    /// Stamp a `Tested-by` trailer naming the bot.
    pub add_tested: bool,
    /// Stamp a `Part-of` trailer linking back to the merge request.
    pub add_part_of: bool,
}

impl TrailerToggles {
    /// Whether any toggle requires rewriting commits at all.
    pub fn requests_commit_tagging(&self) -> bool {
        self.add_tested || self.add_part_of || self.add_reviewers
    }
}

/// Computes the trailers (and rewrite spans) for a merge request.
///
/// Applies trailers in a fixed order: `Reviewed-by` first, `Tested-by` next
/// (only when the project enforces CI and the strategy rebases in place),
/// `Part-of` last.
pub struct TrailerPolicy<'a> {
    toggles: TrailerToggles,
    bot_name: &'a str,
}

impl<'a> TrailerPolicy<'a> {
    /// Create a policy with the given toggles, for a bot known by `bot_name`.
    pub fn new(toggles: TrailerToggles, bot_name: &'a str) -> Self {
        Self {
            toggles,
            bot_name,
        }
    }

    /// Compute the trailers to apply, fetching approver identities through
    /// `forge` as needed.
    pub fn plan(
        &self,
        forge: &dyn ForgeClient,
        mr: &MergeRequest,
        project: &Project,
        approvals: &Approvals,
        strategy_rebases_in_place: bool,
    ) -> ForgeResult<Vec<PlannedTrailer>> {
        let mut planned = Vec::new();

        if self.toggles.add_reviewers {
            let mut seen = Vec::new();
            for &approver in &approvals.approver_ids {
                if seen.contains(&approver) {
                    continue;
                }
                seen.push(approver);

                let user: User = forge.user(approver)?;
                planned.push(PlannedTrailer {
                    trailer: Trailer::new("Reviewed-by", user_trailer_value(&user)),
                    span: RewriteSpan::SinceTarget,
                });
            }
        }

        if self.toggles.add_tested
            && project.only_allow_merge_if_pipeline_succeeds
            && strategy_rebases_in_place
        {
            planned.push(PlannedTrailer {
                trailer: Trailer::new("Tested-by", format!("{} <{}>", self.bot_name, mr.web_url)),
                span: RewriteSpan::TipOnly,
            });
        }

        if self.toggles.add_part_of {
            planned.push(PlannedTrailer {
                trailer: Trailer::new("Part-of", format!("<{}>", mr.web_url)),
                span: RewriteSpan::SinceTarget,
            });
        }

        Ok(planned)
    }
}

fn user_trailer_value(user: &User) -> String {
    match user.email {
        Some(ref email) => format!("{} <{}>", user.name, email),
        None => user.name.clone(),
    }
}
