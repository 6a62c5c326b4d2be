use parking_lot::Mutex;

/// Optional hook into a host test harness. The walker wraps every method in
/// a step; `fail` marks the step failed, `fail_now` marks it fatally failed.
pub trait TestBridge: Send + Sync {
    fn begin_step(&self, name: &str);

    /// Close the step. Returning `false` stops the remaining sibling methods.
    fn end_step(&self, name: &str) -> bool;

    fn fail(&self, message: &str);

    fn fail_now(&self, message: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub failures: Vec<String>,
    pub fatal: Vec<String>,
}

impl StepRecord {
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.fatal.is_empty()
    }
}

/// Bridge that records steps and their failures for later inspection.
#[derive(Debug, Default)]
pub struct RecordingBridge {
    steps: Mutex<Vec<StepRecord>>,
    stop_on_fatal: bool,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the walker to stop sibling methods after a fatal failure.
    pub fn stop_on_fatal(mut self) -> Self {
        self.stop_on_fatal = true;
        self
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.steps.lock().clone()
    }

    pub fn failed_steps(&self) -> Vec<StepRecord> {
        self.steps
            .lock()
            .iter()
            .filter(|step| !step.passed())
            .cloned()
            .collect()
    }

    fn with_current(&self, apply: impl FnOnce(&mut StepRecord)) {
        let mut steps = self.steps.lock();
        if steps.is_empty() {
            steps.push(StepRecord::default());
        }
        if let Some(step) = steps.last_mut() {
            apply(step);
        }
    }
}

impl TestBridge for RecordingBridge {
    fn begin_step(&self, name: &str) {
        self.steps.lock().push(StepRecord {
            name: name.to_string(),
            ..StepRecord::default()
        });
    }

    fn end_step(&self, _name: &str) -> bool {
        let steps = self.steps.lock();
        let fatal = steps.last().is_some_and(|step| !step.fatal.is_empty());
        !(self.stop_on_fatal && fatal)
    }

    fn fail(&self, message: &str) {
        self.with_current(|step| step.failures.push(message.to_string()));
    }

    fn fail_now(&self, message: &str) {
        self.with_current(|step| step.fatal.push(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_failures_per_step() {
        let bridge = RecordingBridge::new();
        bridge.begin_step("GET /pets");
        bridge.fail("header mismatch");
        assert!(bridge.end_step("GET /pets"));
        bridge.begin_step("POST /pets");
        assert!(bridge.end_step("POST /pets"));

        let steps = bridge.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].failures, vec!["header mismatch".to_string()]);
        assert_eq!(bridge.failed_steps().len(), 1);
    }

    #[test]
    fn fatal_failures_stop_when_asked() {
        let lenient = RecordingBridge::new();
        lenient.begin_step("a");
        lenient.fail_now("boom");
        assert!(lenient.end_step("a"));

        let strict = RecordingBridge::new().stop_on_fatal();
        strict.begin_step("a");
        strict.fail_now("boom");
        assert!(!strict.end_step("a"));
    }
}
