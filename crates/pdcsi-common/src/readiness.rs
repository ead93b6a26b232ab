//! Readiness verdicts reported by each gate

/// Outcome of checking one collaborator.
///
/// There is no implicit success: a gate passes only on an explicit
/// [`Readiness::Ready`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The collaborator has everything the next gate needs
    Ready,
    /// Data is not available yet; a later trigger will bring it
    Waiting(String),
    /// Operator action is required
    Blocked(String),
}

impl Readiness {
    /// Whether the gate passed
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// The reason a gate did not pass
    pub fn reason(&self) -> Option<&str> {
        match self {
            Readiness::Ready => None,
            Readiness::Waiting(reason) | Readiness::Blocked(reason) => Some(reason),
        }
    }

    /// Verdict for a relation endpoint with no usable data.
    ///
    /// A relation that is absent (or is the one being torn down) requires
    /// operator action; one that exists but is incomplete only needs time.
    pub fn relation_unready(endpoint: &str, present: bool) -> Self {
        if present {
            Readiness::Waiting(format!("Waiting for {}", endpoint))
        } else {
            Readiness::Blocked(format!("Missing required {}", endpoint))
        }
    }
}
