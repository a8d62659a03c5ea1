use crate::crd::OwnedResourceRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Ready,
    Waiting,
    Failed,
}

/// Outcome of a single adapter run over one rendered manifest.
///
/// `Waiting` means the installation is in progress and the package should
/// stay in a pending state until a later pass observes readiness. `Failed`
/// means the installed resources report a terminal problem.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    kind: ResultKind,
    pub message: String,
    pub owned_resources: Vec<OwnedResourceRef>,
}

impl ReconcileResult {
    pub fn ready(message: impl Into<String>, owned_resources: Vec<OwnedResourceRef>) -> Self {
        Self {
            kind: ResultKind::Ready,
            message: message.into(),
            owned_resources,
        }
    }

    pub fn waiting(message: impl Into<String>, owned_resources: Vec<OwnedResourceRef>) -> Self {
        Self {
            kind: ResultKind::Waiting,
            message: message.into(),
            owned_resources,
        }
    }

    pub fn failed(message: impl Into<String>, owned_resources: Vec<OwnedResourceRef>) -> Self {
        Self {
            kind: ResultKind::Failed,
            message: message.into(),
            owned_resources,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.kind == ResultKind::Ready
    }

    pub fn is_waiting(&self) -> bool {
        self.kind == ResultKind::Waiting
    }

    pub fn is_failed(&self) -> bool {
        self.kind == ResultKind::Failed
    }
}
