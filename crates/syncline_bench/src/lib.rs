//! Benchmark utilities.

use syncline_protocol::{ChangeNotification, Delta, EntityType, FieldChange};

/// Entity type used by the benchmarks.
pub const BENCH_TYPE: EntityType = EntityType::new(1);

/// Generates `count` notifications with distinct IDs.
pub fn notifications(count: usize) -> Vec<ChangeNotification> {
    (0..count as u64)
        .map(|id| ChangeNotification::new(id, BENCH_TYPE))
        .collect()
}

/// Generates a delta that touches `fields` distinct fields `edits` times each.
pub fn edited_delta(fields: usize, edits: usize) -> Delta {
    let mut delta = Delta::new();
    for edit in 0..edits {
        for field in 0..fields {
            delta.push(FieldChange::set(
                format!("field_{field}"),
                vec![edit as u8; 16],
                (edit * fields + field) as u64,
            ));
        }
    }
    delta
}
