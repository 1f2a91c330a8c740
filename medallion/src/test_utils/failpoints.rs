use fail::FailScenario;

/// Configures failpoints for the lifetime of the scenario and turns them off on drop.
pub struct FailpointScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> FailpointScenario<'a> {
    /// Sets up `failpoints` as `(name, action)` pairs, for example
    /// `("bronze_load.before_commit", "1*return(transient)")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> FailpointScenario<'a> {
        let scenario = FailScenario::setup();

        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).unwrap();
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints.iter().map(|(name, _)| name.to_string()).collect(),
        }
    }

    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for FailpointScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::remove(failpoint);
        }
    }
}
