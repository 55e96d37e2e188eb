/// The tracing target for machine-readable probe events.
pub const TARGET: &str = "bpx_probe";

/// The Kind of the Probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Relayer changes, like starting or shutting down.
    Lifecycle,
    /// Relayer sync state on a specific chain.
    Sync,
    /// Producing and publishing a signature share.
    Signing,
    /// Handling an inbound retry request.
    Retry,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Lifecycle => "lifecycle",
            Kind::Sync => "sync",
            Kind::Signing => "signing",
            Kind::Retry => "retry",
        };
        write!(f, "{s}")
    }
}
