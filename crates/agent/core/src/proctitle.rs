//! Process-title reporting.

/// Replaces the process title shown in `ps` output.
///
/// Titles are process-global and last-writer-wins, so this is a port: the
/// embedder wires a real implementation, and tests record the sequence of
/// titles instead of touching the process.
pub trait ProcTitle: Send + Sync {
    fn replace(&self, title: &str);
}

/// Ignores title updates.
#[derive(Debug, Default)]
pub struct NullProcTitle;

impl ProcTitle for NullProcTitle {
    fn replace(&self, _title: &str) {}
}
