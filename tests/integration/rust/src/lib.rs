//! Integration test suite for the trace optimizer
//!
//! This crate runs optimized traces against the reference evaluator and
//! checks that optimization never changes observable behavior.

/// Re-export components for test convenience
pub mod components {
    pub use trace_ir;
    pub use trace_optimizer;
}

/// Install a log subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
