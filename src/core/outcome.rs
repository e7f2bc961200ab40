/// Step outcome accounting
///
/// Pipeline steps report Success or a soft failure; fatal failures travel
/// as errors through `?`. Soft failures accumulate here and only influence
/// the final summary line, never the control flow of remaining steps.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Soft(String),
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    soft: Vec<String>,
}

impl PipelineReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step outcome; returns true when the step succeeded.
    pub fn record(&mut self, outcome: StepOutcome) -> bool {
        match outcome {
            StepOutcome::Success => true,
            StepOutcome::Soft(reason) => {
                self.soft(reason);
                false
            }
        }
    }

    pub fn soft(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("{}", reason);
        self.soft.push(reason);
    }

    pub fn is_clean(&self) -> bool {
        self.soft.is_empty()
    }

    pub fn soft_failures(&self) -> &[String] {
        &self.soft
    }

    /// Final summary line: "snapshot completed" vs "snapshot completed
    /// with N errors".
    pub fn summary(&self, what: &str) -> String {
        if self.is_clean() {
            format!("{} completed", what)
        } else {
            format!("{} completed with {} errors", what, self.soft.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_report() {
        let mut report = PipelineReport::new();
        assert!(report.record(StepOutcome::Success));
        assert!(report.is_clean());
        assert_eq!(report.summary("snapshot"), "snapshot completed");
    }

    #[test]
    fn test_soft_failures_accumulate_without_short_circuiting() {
        let mut report = PipelineReport::new();
        assert!(!report.record(StepOutcome::Soft("volume redis missing".into())));
        report.soft("dump of users truncated");

        assert!(!report.is_clean());
        assert_eq!(report.soft_failures().len(), 2);
        assert_eq!(
            report.summary("snapshot"),
            "snapshot completed with 2 errors"
        );
    }
}
