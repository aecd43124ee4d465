use proptest::prelude::*;

/// Task ids drawn from a small pool so tasks share the log
pub fn task_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("task-a"), Just("task-b"), Just("task-c")].prop_map(str::to_string)
}

/// A sequence of (task, progress) reports in emission order
pub fn emission_strategy(max_len: usize) -> impl Strategy<Value = Vec<(String, u8)>> {
    prop::collection::vec((task_id_strategy(), 0u8..=100), 1..max_len)
}
