//! Engine configuration (§4.1, §4.5): the constants the reference
//! implementation compiles in, exposed here as plain data so an embedder
//! can tune them without recompiling — the same role the teacher's
//! `ExecutionEngineLimits` plays for its engine.

/// Tunable limits and thresholds for a single [`crate::vm::Vm`] instance.
#[derive(Debug, Clone, Copy)]
pub struct VmLimits {
    /// Number of call frames the frame stack holds (§4.1: recommended 64).
    pub max_frames: usize,
    /// Number of value-stack slots per frame (§4.1: recommended 256, for a
    /// total of `max_frames * frame_stack_slots`).
    pub frame_stack_slots: usize,
    /// `bytes_allocated` threshold that triggers the first collection
    /// (§4.5).
    pub initial_gc_threshold: usize,
    /// Multiplier applied to `bytes_allocated` after each collection to
    /// compute the next threshold (§4.5: factor >= 2).
    pub gc_growth_factor: usize,
}

impl VmLimits {
    pub fn value_stack_size(&self) -> usize {
        self.max_frames * self.frame_stack_slots
    }
}

impl Default for VmLimits {
    fn default() -> Self {
        VmLimits {
            max_frames: 64,
            frame_stack_slots: 256,
            initial_gc_threshold: 1024 * 1024,
            gc_growth_factor: 2,
        }
    }
}
