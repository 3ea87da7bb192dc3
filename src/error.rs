use thiserror::Error;

#[derive(Error, Debug)]
pub enum PKError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid patient: {0}")]
    InvalidPatient(String),

    #[error("invalid dose event: {0}")]
    InvalidDoseEvent(String),

    #[error("invalid protocol settings: {0}")]
    InvalidProtocolSettings(String),

    #[error("parameter derivation failure: {0}")]
    ParameterDerivation(String),

    #[error("integrator diverged: {0}")]
    IntegratorDiverged(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("optimizer found no feasible rate: {0}")]
    OptimizerNoFeasibleRate(String),
}

pub type PKResult<T> = Result<T, PKError>;

/// Collects field-level validation failures so callers get back the full
/// ordered list of human-readable messages instead of only the first one.
#[derive(Debug, Default)]
pub struct Violations(Vec<String>);

impl Violations {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn check(&mut self, ok: bool, message: impl Into<String>) {
        if !ok {
            self.0.push(message.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_joined(self) -> String {
        self.0.join("; ")
    }
}