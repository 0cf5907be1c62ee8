use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::feature::{FeatureField, FeatureRecord, QuantileMode, FEATURES};

/// Window parameters of the quantile transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantileSettings {
    pub buffer_size: usize,
    pub stride: usize,
}

impl QuantileSettings {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 2 {
            bail!("quantileBufferSize must be at least 2 (got {})", self.buffer_size);
        }
        if self.stride == 0 || self.stride >= self.buffer_size {
            bail!(
                "quantileStride must satisfy 0 < stride < bufferSize (stride = {}, bufferSize = {})",
                self.stride,
                self.buffer_size
            );
        }
        Ok(())
    }
}

/// Replaces every momentum feature with its rank quantile in `[0, 1]`.
/// Returns labels and absent values are left untouched.
pub fn quantile_transform(records: &mut [FeatureRecord], settings: QuantileSettings) -> Result<()> {
    settings.validate()?;
    if records.is_empty() {
        return Ok(());
    }
    let snapshot: &[FeatureRecord] = records;
    let transformed: Vec<(FeatureField, Vec<Option<f64>>)> = FEATURES
        .par_iter()
        .map(|feature| {
            let values: Vec<Option<f64>> = snapshot.iter().map(|record| feature.get(record)).collect();
            let output = match feature.mode {
                QuantileMode::Anchored => anchored_quantiles(&values, settings.buffer_size),
                QuantileMode::Rolling => rolling_quantiles(&values, settings),
            };
            (feature.field, output)
        })
        .collect();
    for (field, output) in transformed {
        for (record, value) in records.iter_mut().zip(output) {
            *record.feature_mut(field) = value;
        }
    }
    Ok(())
}

fn rank_quantile(rank: usize, len: usize) -> f64 {
    if len <= 1 {
        0.5
    } else {
        rank as f64 / (len - 1) as f64
    }
}

/// Scores each sample against all samples seen so far. The first
/// `buffer_size` non-null samples are ranked together.
pub fn anchored_quantiles(values: &[Option<f64>], buffer_size: usize) -> Vec<Option<f64>> {
    let mut output = vec![None; values.len()];
    let samples: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(index, value)| value.map(|value| (index, value)))
        .collect();
    if samples.is_empty() {
        return output;
    }
    let initial = buffer_size.min(samples.len());

    let mut seed: Vec<(usize, f64)> = samples[..initial].to_vec();
    seed.sort_by(|a, b| a.1.total_cmp(&b.1));
    for (rank, (index, _)) in seed.iter().enumerate() {
        output[*index] = Some(rank_quantile(rank, seed.len()));
    }

    let mut buffer: Vec<f64> = seed.into_iter().map(|(_, value)| value).collect();
    buffer.reserve(samples.len() - initial);
    for &(index, value) in &samples[initial..] {
        let rank = buffer.partition_point(|probe| probe.total_cmp(&value).is_lt());
        buffer.insert(rank, value);
        output[index] = Some(rank_quantile(rank, buffer.len()));
    }
    output
}

/// Ranks the non-null samples of one window and writes the scores of
/// indices in `update_from..` of that window.
fn score_window(
    values: &[Option<f64>],
    window: std::ops::Range<usize>,
    update_from: usize,
    output: &mut [Option<f64>],
) {
    let mut samples: Vec<(usize, f64)> = window
        .filter_map(|index| values[index].map(|value| (index, value)))
        .collect();
    samples.sort_by(|a, b| a.1.total_cmp(&b.1));
    let len = samples.len();
    for (rank, (index, _)) in samples.into_iter().enumerate() {
        if index >= update_from {
            output[index] = Some(rank_quantile(rank, len));
        }
    }
}

/// Sliding-window ranking. The first window scores its whole range, later
/// windows their trailing `stride` records, and a final window aligned to
/// the end of the series covers the remaining suffix. Overlapping writes
/// keep the later window's score.
pub fn rolling_quantiles(values: &[Option<f64>], settings: QuantileSettings) -> Vec<Option<f64>> {
    let len = values.len();
    let mut output = vec![None; len];
    let buffer_size = settings.buffer_size.min(len);
    if buffer_size == 0 {
        return output;
    }
    let stride = settings.stride;

    score_window(values, 0..buffer_size, 0, &mut output);
    if len <= buffer_size {
        return output;
    }
    let mut offset = stride;
    while offset + buffer_size < len {
        let end = offset + buffer_size;
        score_window(values, offset..end, end - stride, &mut output);
        offset += stride;
    }
    score_window(values, len - buffer_size..len, len - stride, &mut output);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn anchored_scores_seed_then_inserts() {
        let output = anchored_quantiles(&some(&[10.0, 30.0, 20.0, 40.0]), 3);
        assert_eq!(output, vec![Some(0.0), Some(1.0), Some(0.5), Some(1.0)]);
    }

    #[test]
    fn anchored_keeps_nulls_and_history() {
        let values = vec![Some(5.0), None, Some(1.0), Some(3.0), None, Some(0.0), Some(2.0)];
        let output = anchored_quantiles(&values, 2);
        assert_eq!(output[1], None);
        assert_eq!(output[4], None);
        // Seed [1, 5].
        assert_eq!(output[0], Some(1.0));
        assert_eq!(output[2], Some(0.0));
        // 3 lands between them: [1, 3, 5].
        assert_eq!(output[3], Some(0.5));
        // 0 is the new minimum: [0, 1, 3, 5].
        assert_eq!(output[5], Some(0.0));
        // 2 ranks third of five.
        assert_eq!(output[6], Some(0.5));
    }

    #[test]
    fn rolling_covers_every_index_within_bounds() {
        let values: Vec<Option<f64>> = (0..103)
            .map(|index| {
                if index % 7 == 3 {
                    None
                } else {
                    Some(((index * 37) % 101) as f64)
                }
            })
            .collect();
        let settings = QuantileSettings {
            buffer_size: 20,
            stride: 6,
        };
        let output = rolling_quantiles(&values, settings);
        for (value, score) in values.iter().zip(&output) {
            assert_eq!(value.is_some(), score.is_some());
            if let Some(score) = score {
                assert!((0.0..=1.0).contains(score));
            }
        }
    }

    #[test]
    fn rolling_trailing_ranks_follow_window_order() {
        let values = some(&[1.0, 2.0, 3.0, 4.0, 0.0, 5.0]);
        let settings = QuantileSettings {
            buffer_size: 4,
            stride: 2,
        };
        let output = rolling_quantiles(&values, settings);
        // First window [1, 2, 3, 4].
        assert_eq!(output[0], Some(0.0));
        assert_eq!(output[1], Some(1.0 / 3.0));
        // Final window [3, 4, 0, 5] rewrites nothing before index 4.
        assert_eq!(output[2], Some(2.0 / 3.0));
        assert_eq!(output[3], Some(1.0));
        assert_eq!(output[4], Some(0.0));
        assert_eq!(output[5], Some(1.0));
    }

    #[test]
    fn stride_must_be_smaller_than_buffer() {
        let mut records = vec![FeatureRecord::default()];
        let settings = QuantileSettings {
            buffer_size: 24,
            stride: 24,
        };
        assert!(quantile_transform(&mut records, settings).is_err());
    }

    #[test]
    fn transform_leaves_returns_untouched() -> Result<()> {
        let mut records: Vec<FeatureRecord> = (0..50)
            .map(|index| {
                let mut record = FeatureRecord::default();
                record.momentum_1h = Some(index as f64 * 0.01 - 0.2);
                record.momentum_5d = if index % 3 == 0 { None } else { Some(-(index as f64)) };
                record.returns_24h = Some(crate::feature::ReturnsRecord {
                    high: index,
                    low: -index,
                    close1: 100,
                    close2: 100 + index,
                });
                record
            })
            .collect();
        let labels: Vec<_> = records.iter().map(|record| record.returns_24h).collect();
        quantile_transform(
            &mut records,
            QuantileSettings {
                buffer_size: 10,
                stride: 3,
            },
        )?;
        for (record, label) in records.iter().zip(labels) {
            assert_eq!(record.returns_24h, label);
            for feature in &FEATURES {
                if let Some(value) = feature.get(record) {
                    assert!((0.0..=1.0).contains(&value), "{} out of range", feature.name);
                }
            }
            assert_eq!(record.momentum_2h, None);
        }
        assert_eq!(records[0].momentum_5d, None);
        Ok(())
    }
}
