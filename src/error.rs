use thiserror::Error;

use crate::quota::QuantityError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    Kube(#[source] kube::Error),

    #[error("conflict writing {kind} {name}: object changed since it was read")]
    Conflict { kind: String, name: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid object: {0}")]
    Validation(String),

    #[error("no active PaasConfig found")]
    NoActiveConfig,

    #[error("capability {0} is not configured in the active PaasConfig")]
    CapabilityNotConfigured(String),

    #[error("namespace claim cycle detected at namespace {0}")]
    NamespaceCycle(String),

    #[error("invalid quantity: {0}")]
    Quantity(#[from] QuantityError),

    #[error("decrypt error: {0}")]
    Decrypt(#[from] crate::decrypt::DecryptError),

    #[error("object has no {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Errors that cannot be fixed by retrying the same object. They are
    /// reported through status and never requeued on a tight loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NoActiveConfig
                | Error::CapabilityNotConfigured(_)
                | Error::NamespaceCycle(_)
                | Error::Quantity(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Conflict { .. } => "conflict",
            Error::Serialization(_) => "serialization",
            Error::Validation(_) => "validation",
            Error::NoActiveConfig => "no_active_config",
            Error::CapabilityNotConfigured(_) => "capability_not_configured",
            Error::NamespaceCycle(_) => "namespace_cycle",
            Error::Quantity(_) => "quantity",
            Error::Decrypt(_) => "decrypt",
            Error::MissingObjectKey(_) => "missing_object_key",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
