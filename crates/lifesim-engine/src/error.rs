//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Each variant wraps one subsystem error so `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: lifesim_core::ConfigError,
    },

    /// Kernel assembly failed.
    #[error("kernel error: {source}")]
    Kernel {
        /// The underlying kernel error.
        #[from]
        source: lifesim_core::KernelError,
    },

    /// A controller operation failed.
    #[error("control error: {source}")]
    Control {
        /// The underlying controller error.
        #[from]
        source: lifesim_core::ControlError,
    },

    /// Waiting for the interrupt signal failed.
    #[error("signal error: {source}")]
    Signal {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The final status report could not be rendered.
    #[error("report error: {source}")]
    Report {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}
