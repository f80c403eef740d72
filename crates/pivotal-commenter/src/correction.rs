//! Comment scanning and correction text.
//!
//! Pure string logic with no I/O. The commenter loop feeds each story's
//! comment thread through [`scan_comments`] and posts whatever
//! [`ScanOutcome::correction`] returns.
//!
//! The bot recognises its own earlier corrections by content alone: any
//! comment carrying [`AUTO_GENERATED_MARKER`] together with the replacement
//! phrase suppresses a new post, wherever it sits in the thread. A target
//! phrase repeated *after* a correction is therefore never re-corrected.

use crate::tracker::Comment;

/// Literal text the bot uses to recognise comments it posted earlier.
pub const AUTO_GENERATED_MARKER: &str = "Auto Generated";

/// What to look for, what to replace it with, and who to blame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionRule {
    pub target: String,
    pub replacement: String,
    pub display_name: String,
}

impl CorrectionRule {
    pub fn new(
        target: impl Into<String>,
        replacement: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            replacement: replacement.into(),
            display_name: display_name.into(),
        }
    }

    fn is_prior_correction(&self, text: &str) -> bool {
        text.contains(AUTO_GENERATED_MARKER) && text.contains(&self.replacement)
    }
}

/// Decision state for one story, recomputed from scratch every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// At least one comment contains the target phrase.
    pub found_target: bool,
    /// A previous auto-generated correction is present in the thread.
    pub already_corrected: bool,
    /// Text of the last comment containing the target phrase.
    pub candidate: Option<String>,
}

impl ScanOutcome {
    pub fn should_post(&self) -> bool {
        self.found_target && !self.already_corrected
    }

    /// The comment to post, if the thread warrants one.
    pub fn correction(&self, rule: &CorrectionRule) -> Option<String> {
        if !self.should_post() {
            return None;
        }
        self.candidate
            .as_deref()
            .map(|candidate| build_correction(rule, candidate))
    }
}

/// Scan a comment thread in list order.
///
/// A comment containing the target phrase takes precedence over the
/// prior-correction check for that same comment.
pub fn scan_comments(rule: &CorrectionRule, comments: &[Comment]) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for comment in comments {
        if comment.text.contains(&rule.target) {
            outcome.found_target = true;
            outcome.candidate = Some(comment.text.clone());
        } else if rule.is_prior_correction(&comment.text) {
            outcome.already_corrected = true;
        }
    }

    outcome
}

/// Build the correction for `candidate`. Only the first occurrence of the
/// target phrase is replaced.
pub fn build_correction(rule: &CorrectionRule, candidate: &str) -> String {
    let corrected = candidate.replacen(&rule.target, &rule.replacement, 1);
    format!(
        "{AUTO_GENERATED_MARKER} Comment:\n\nLooks like {} still doesn't know the correct link...\n\n{corrected}",
        rule.display_name
    )
}
