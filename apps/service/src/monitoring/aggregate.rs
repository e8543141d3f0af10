use super::types::{AggregatedMetric, Sample, TimingField, Timings};

/// Average a batch of attempts.
///
/// Failed attempts are `None`. Every field is divided by the batch length,
/// so a failed or unmeasured attempt contributes zero. A field that no
/// sample measured stays absent.
pub fn aggregate(batch: &[Option<Sample>]) -> AggregatedMetric {
    let attempts = batch.len();
    let mut timings = Timings::default();

    if attempts > 0 {
        for field in TimingField::ALL {
            let mut measured = false;
            let mut sum = 0.0;
            for value in batch.iter().flatten().filter_map(|sample| sample.timings.get(field)) {
                measured = true;
                sum += value;
            }
            if measured {
                timings.set(field, Some(sum / attempts as f64));
            }
        }
    }

    AggregatedMetric {
        timings,
        attempts,
        completed: batch.iter().flatten().count(),
        status_codes: batch
            .iter()
            .flatten()
            .filter_map(|sample| sample.status_code)
            .collect(),
    }
}
