//! The correction loop.
//!
//! Each iteration lists recently updated stories, scans every story's
//! comment thread, and posts at most one correction per story. Tracker
//! failures are logged and recorded in the [`IterationReport`]; they never
//! abort the iteration or the loop. There is no retry: a failed call is
//! attempted again on the next iteration.

use std::fmt;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::CommenterConfig;
use crate::correction::{scan_comments, CorrectionRule};
use crate::tracker::{Story, StoryTracker, TrackerError};

/// Tracker operation that failed during an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ListStories,
    ListComments,
    AddComment,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListStories => write!(f, "list_stories"),
            Self::ListComments => write!(f, "list_comments"),
            Self::AddComment => write!(f, "add_comment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    pub story_id: Option<u64>,
    pub message: String,
}

/// What one iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub stories_seen: usize,
    pub comments_scanned: usize,
    pub corrections_posted: usize,
    /// Corrections that were due but only logged because of dry-run.
    pub corrections_skipped: usize,
    pub failures: Vec<StepFailure>,
}

impl IterationReport {
    fn record_failure(&mut self, step: Step, story_id: Option<u64>, err: &TrackerError) {
        match story_id {
            Some(story_id) => error!(%step, story_id, error = %err, "Tracker call failed"),
            None => error!(%step, error = %err, "Tracker call failed"),
        }
        self.failures.push(StepFailure {
            step,
            story_id,
            message: err.to_string(),
        });
    }
}

/// How often to iterate, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Pause after each iteration.
    pub interval: Duration,
    /// Stop after this many iterations; `None` runs until the process is killed.
    pub max_iterations: Option<u64>,
}

impl PollSchedule {
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_iterations: None,
        }
    }

    pub fn bounded(interval: Duration, iterations: u64) -> Self {
        Self {
            interval,
            max_iterations: Some(iterations),
        }
    }

    fn is_done(&self, completed: u64) -> bool {
        self.max_iterations.is_some_and(|max| completed >= max)
    }
}

pub struct Commenter<'a, T: StoryTracker> {
    tracker: &'a T,
    config: &'a CommenterConfig,
    rule: CorrectionRule,
    filter: String,
}

impl<'a, T: StoryTracker> Commenter<'a, T> {
    pub fn new(tracker: &'a T, config: &'a CommenterConfig) -> Self {
        Self {
            tracker,
            config,
            rule: config.correction_rule(),
            filter: config.story_filter(),
        }
    }

    /// Iterate according to `schedule`, sleeping after every iteration.
    ///
    /// Returns the reports of all iterations run; with an unbounded
    /// schedule it never returns.
    pub async fn run(&self, schedule: PollSchedule) -> Vec<IterationReport> {
        let mut reports = Vec::new();
        let mut completed = 0u64;

        while !schedule.is_done(completed) {
            let report = self.run_once().await;
            completed += 1;

            info!(
                iteration = completed,
                stories = report.stories_seen,
                comments = report.comments_scanned,
                posted = report.corrections_posted,
                failures = report.failures.len(),
                next_in_secs = schedule.interval.as_secs(),
                "Iteration complete"
            );

            // Only bounded runs keep reports; an endless loop would grow forever.
            if schedule.max_iterations.is_some() {
                reports.push(report);
            }

            tokio::time::sleep(schedule.interval).await;
        }

        reports
    }

    /// One pass over the stories updated within the lookback window.
    pub async fn run_once(&self) -> IterationReport {
        let mut report = IterationReport::default();
        let project_id = self.config.project_id;

        let stories = match self
            .tracker
            .list_updated_stories(project_id, &self.filter)
            .await
        {
            Ok(stories) => stories,
            Err(e) => {
                report.record_failure(Step::ListStories, None, &e);
                return report;
            }
        };

        for story in &stories {
            self.process_story(story, &mut report).await;
        }

        report
    }

    /// Scan one story's comments and post a correction if it is due.
    pub async fn process_story(&self, story: &Story, report: &mut IterationReport) {
        let project_id = self.config.project_id;
        report.stories_seen += 1;
        info!(story_id = story.id, name = %story.name, "Found story");

        let comments = match self.tracker.list_comments(project_id, story.id).await {
            Ok(comments) => comments,
            Err(e) => {
                report.record_failure(Step::ListComments, Some(story.id), &e);
                return;
            }
        };

        for comment in &comments {
            info!(
                story_id = story.id,
                comment_id = comment.id,
                text = %comment.text,
                "Found comment"
            );
        }
        report.comments_scanned += comments.len();

        let outcome = scan_comments(&self.rule, &comments);
        if outcome.found_target && outcome.already_corrected {
            info!(story_id = story.id, "Story already has an auto-generated correction");
        }

        let Some(correction) = outcome.correction(&self.rule) else {
            return;
        };

        if self.config.dry_run {
            warn!(
                story_id = story.id,
                comment = %correction,
                "Dry run, correction not posted"
            );
            report.corrections_skipped += 1;
            return;
        }

        match self
            .tracker
            .add_comment(project_id, story.id, &correction)
            .await
        {
            Ok(posted) => {
                info!(
                    story_id = story.id,
                    comment_id = posted.id,
                    comment = %correction,
                    "Posted correction"
                );
                report.corrections_posted += 1;
            }
            Err(e) => report.record_failure(Step::AddComment, Some(story.id), &e),
        }
    }
}
