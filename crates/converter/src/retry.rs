use crate::config::{ConvertConfig, ValidationRetryPolicy};
use crate::error::AttemptError;

/// Whether a failed attempt is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Transient,
    Permanent,
}

/// Patterns from the allow-list also trusted for otherwise unexplained errors
const UNEXPECTED_PATTERN_COUNT: usize = 2;

/// Decides which attempt failures are retried, and how often.
///
/// Structured signals come first: a timeout or an encoder killed by a signal
/// is transient. Only then is ffmpeg's stderr matched against the configured
/// phrases. That match is best-effort; ffmpeg does not promise stable wording.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub validation: ValidationRetryPolicy,
    patterns: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, validation: ValidationRetryPolicy, patterns: Vec<String>) -> Self {
        Self {
            max_retries,
            validation,
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn from_config(cfg: &ConvertConfig) -> Self {
        Self::new(cfg.max_retries, cfg.validation_retry, cfg.transient_patterns.clone())
    }

    /// Total attempts an asset may get
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn verdict(&self, err: &AttemptError) -> Verdict {
        match err {
            AttemptError::Claim(_) => Verdict::Permanent,
            AttemptError::InputInvalid(_) => match self.validation {
                ValidationRetryPolicy::Always => Verdict::Transient,
                _ => Verdict::Permanent,
            },
            AttemptError::ZeroSizeOutput
            | AttemptError::MissingOutput
            | AttemptError::OutputInvalid(_) => match self.validation {
                ValidationRetryPolicy::Never => Verdict::Permanent,
                _ => Verdict::Transient,
            },
            AttemptError::TimedOut { .. } => Verdict::Transient,
            // No exit code means the encoder was killed from outside
            AttemptError::ExternalTool { exit_code: None, .. } => Verdict::Transient,
            AttemptError::ExternalTool { stderr, .. } => self.match_patterns(stderr, &self.patterns),
            AttemptError::Unexpected(msg) => {
                let narrow = &self.patterns[..self.patterns.len().min(UNEXPECTED_PATTERN_COUNT)];
                self.match_patterns(msg, narrow)
            }
        }
    }

    fn match_patterns(&self, text: &str, patterns: &[String]) -> Verdict {
        let text = text.to_lowercase();
        if patterns.iter().any(|p| text.contains(p.as_str())) {
            Verdict::Transient
        } else {
            Verdict::Permanent
        }
    }

    /// True when `attempt` (1-based) failed with `err` and another attempt is allowed
    pub fn should_retry(&self, attempt: u32, err: &AttemptError) -> bool {
        attempt <= self.max_retries && self.verdict(err) == Verdict::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TRANSIENT_PATTERNS;
    use proptest::prelude::*;

    fn policy(validation: ValidationRetryPolicy) -> RetryPolicy {
        RetryPolicy::new(
            2,
            validation,
            DEFAULT_TRANSIENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        )
    }

    fn tool_error(code: Option<i32>, stderr: &str) -> AttemptError {
        AttemptError::ExternalTool { exit_code: code, stderr: stderr.to_string() }
    }

    #[test]
    fn test_stderr_contention_is_transient() {
        let p = policy(ValidationRetryPolicy::PostEncodeOnly);
        assert_eq!(p.verdict(&tool_error(Some(1), "av_interleaved_write_frame(): Resource temporarily unavailable")), Verdict::Transient);
        assert_eq!(p.verdict(&tool_error(Some(1), "Invalid data found when processing input")), Verdict::Permanent);
    }

    #[test]
    fn test_signal_kill_is_transient() {
        let p = policy(ValidationRetryPolicy::Never);
        assert_eq!(p.verdict(&tool_error(None, "")), Verdict::Transient);
        assert_eq!(p.verdict(&AttemptError::TimedOut { secs: 300 }), Verdict::Transient);
    }

    #[test]
    fn test_unexpected_uses_narrow_list() {
        let p = policy(ValidationRetryPolicy::PostEncodeOnly);
        assert_eq!(p.verdict(&AttemptError::Unexpected("Device or resource busy (os error 16)".into())), Verdict::Transient);
        // In the full list, but not in the narrow one
        assert_eq!(p.verdict(&AttemptError::Unexpected("Too many open files".into())), Verdict::Permanent);
        assert_eq!(p.verdict(&tool_error(Some(1), "Too many open files")), Verdict::Transient);
    }

    #[test]
    fn test_validation_policies() {
        let input = AttemptError::InputInvalid("no video stream".into());
        let output = AttemptError::ZeroSizeOutput;

        let never = policy(ValidationRetryPolicy::Never);
        assert_eq!(never.verdict(&input), Verdict::Permanent);
        assert_eq!(never.verdict(&output), Verdict::Permanent);

        let post = policy(ValidationRetryPolicy::PostEncodeOnly);
        assert_eq!(post.verdict(&input), Verdict::Permanent);
        assert_eq!(post.verdict(&output), Verdict::Transient);
        assert_eq!(post.verdict(&AttemptError::OutputInvalid("x".into())), Verdict::Transient);

        let always = policy(ValidationRetryPolicy::Always);
        assert_eq!(always.verdict(&input), Verdict::Transient);
        assert_eq!(always.verdict(&output), Verdict::Transient);
    }

    #[test]
    fn test_claim_errors_never_retry() {
        let p = policy(ValidationRetryPolicy::Always);
        let err = AttemptError::Claim(crate::error::ClaimError::Missing("/x.mov".into()));
        assert!(!p.should_retry(1, &err));
    }

    proptest! {
        // A permanently transient failure gets exactly max_retries extra attempts
        #[test]
        fn test_retry_bound(max_retries in 0u32..6) {
            let p = RetryPolicy::new(max_retries, ValidationRetryPolicy::PostEncodeOnly, vec![]);
            let err = AttemptError::TimedOut { secs: 1 };
            let mut attempt = 1;
            while p.should_retry(attempt, &err) {
                attempt += 1;
            }
            prop_assert_eq!(attempt, max_retries + 1);
            prop_assert_eq!(attempt, p.max_attempts());
        }
    }
}
