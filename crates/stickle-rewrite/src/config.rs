//! Pipeline configuration.

/// Options controlling which passes run and how hard the greedy driver tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteConfig {
    /// Maximum number of full sweeps of the greedy driver before giving up
    /// on reaching a fixpoint.
    pub max_iterations: usize,

    /// Run the loop trip-count narrower.
    pub trip_count: bool,

    /// Canonicalize batch-major recurrent layers.
    pub rnn_layout: bool,

    /// Insert deallocations around concurrently executing regions.
    ///
    /// Off by default: the inserted input deallocations assume inputs are not
    /// mutated after launch.
    pub async_dealloc: bool,

    /// Verify the graph after every pass.
    pub verify_each_pass: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            trip_count: true,
            rnn_layout: true,
            async_dealloc: false,
            verify_each_pass: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RewriteConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert!(config.trip_count);
        assert!(!config.async_dealloc);
    }
}
