//! Differential expression compute configuration.

/// Sizing of differential expression work, derived from the `diffexp` settings when the server
/// configuration is completed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiffexpComputeConfig {
    /// Number of worker threads.
    pub max_workers: usize,
    /// Number of rows handled by each unit of work.
    pub target_workunit: usize,
}
