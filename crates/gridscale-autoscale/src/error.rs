//! Autoscaler error types.

use thiserror::Error;

use crate::registry::ComponentCategory;

/// Errors raised while evaluating a single target.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// Misconfiguration: the named component was never registered.
    #[error("unknown {category} {name:?}")]
    UnknownComponent {
        category: ComponentCategory,
        name: String,
    },

    /// Not enough data this pass; the target is skipped.
    #[error("{0}")]
    MetricsProviderNoData(String),

    /// Safety brake: refuse to scale a cluster resource.
    #[error("{0}")]
    ClusterAutoscaling(String),

    #[error("state store error: {0}")]
    State(#[from] gridscale_state::StateError),

    #[error("collaborator error: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
