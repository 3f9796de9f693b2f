use thiserror::Error;

/// One failed strategy and what it saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: String,
    pub diagnostic: String,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Service endpoint not found after {} strategies: {}", .attempts.len(), summarize(.attempts))]
    Exhausted { attempts: Vec<Attempt> },

    #[error("No discovery strategies configured")]
    NoStrategies,
}

impl DiscoveryError {
    /// Diagnostics of every attempted strategy, in order
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            DiscoveryError::Exhausted { attempts } => attempts,
            DiscoveryError::NoStrategies => &[],
        }
    }
}

fn summarize(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.strategy, a.diagnostic))
        .collect::<Vec<_>>()
        .join("; ")
}
