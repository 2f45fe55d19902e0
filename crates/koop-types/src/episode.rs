//! Episodes and the combined-matrix representation.
//!
//! A combined matrix stacks episodes row-wise. When `episode_feature` is set,
//! column 0 holds the episode index and the remaining columns hold samples.

use std::collections::HashSet;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::errors::{DataError, KoopResult};
use crate::matrix::serde_matrix;

/// One contiguous experimental run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub index: usize,
    /// Samples in time order, one row per sample.
    #[serde(with = "serde_matrix")]
    pub data: DMatrix<f64>,
}

impl Episode {
    pub fn new(index: usize, data: DMatrix<f64>) -> Self {
        Self { index, data }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Keep only the first `n` columns.
    pub fn leading_columns(&self, n: usize) -> Episode {
        Episode::new(self.index, self.data.columns(0, n).into_owned())
    }

    /// Drop the first `n` samples.
    pub fn skip_samples(&self, n: usize) -> Episode {
        let n = n.min(self.len());
        Episode::new(self.index, self.data.rows(n, self.len() - n).into_owned())
    }
}

/// Stack episodes into one matrix, optionally prefixed with the episode index.
pub fn combine_episodes(episodes: &[Episode], episode_feature: bool) -> KoopResult<DMatrix<f64>> {
    let offset = usize::from(episode_feature);
    let width = match episodes.first() {
        Some(first) => first.width(),
        None => return Ok(DMatrix::zeros(0, offset)),
    };

    let mut seen = HashSet::new();
    for ep in episodes {
        if ep.width() != width {
            return Err(DataError::WidthMismatch {
                index: ep.index,
                expected: width,
                actual: ep.width(),
            }
            .into());
        }
        if ep.is_empty() {
            return Err(DataError::EmptyEpisode { index: ep.index }.into());
        }
        if !seen.insert(ep.index) {
            return Err(DataError::DuplicateEpisode { index: ep.index }.into());
        }
    }

    let total_rows: usize = episodes.iter().map(Episode::len).sum();
    let mut combined = DMatrix::zeros(total_rows, width + offset);
    let mut row = 0;
    for ep in episodes {
        if episode_feature {
            combined
                .view_mut((row, 0), (ep.len(), 1))
                .fill(ep.index as f64);
        }
        combined
            .view_mut((row, offset), (ep.len(), width))
            .copy_from(&ep.data);
        row += ep.len();
    }
    Ok(combined)
}

/// Recover episodes from a combined matrix.
///
/// Episodes are returned in order of first appearance. An index that
/// reappears after another episode started is rejected, since episodes must
/// be contiguous.
pub fn split_episodes(combined: &DMatrix<f64>, episode_feature: bool) -> KoopResult<Vec<Episode>> {
    if !episode_feature {
        if combined.nrows() == 0 {
            return Ok(Vec::new());
        }
        return Ok(vec![Episode::new(0, combined.clone())]);
    }
    if combined.ncols() == 0 {
        return Err(DataError::InvalidFormat {
            message: "combined matrix has no episode column".to_string(),
        }
        .into());
    }

    let width = combined.ncols() - 1;
    let mut episodes = Vec::new();
    let mut seen = HashSet::new();
    let mut start = 0;
    while start < combined.nrows() {
        let index = parse_marker(start, combined[(start, 0)])?;
        if !seen.insert(index) {
            return Err(DataError::DuplicateEpisode { index }.into());
        }
        let mut end = start + 1;
        while end < combined.nrows() && combined[(end, 0)] == combined[(start, 0)] {
            end += 1;
        }
        let data = combined.view((start, 1), (end - start, width)).into_owned();
        episodes.push(Episode::new(index, data));
        start = end;
    }
    Ok(episodes)
}

/// Group index of each episode in the slice, in slice order.
pub fn episode_indices(episodes: &[Episode]) -> Vec<usize> {
    episodes.iter().map(|ep| ep.index).collect()
}

fn parse_marker(row: usize, value: f64) -> KoopResult<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(DataError::InvalidMarker { row, value }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(index: usize, rows: usize, cols: usize) -> Episode {
        let data = DMatrix::from_fn(rows, cols, |i, j| (index * 100 + i * cols + j) as f64);
        Episode::new(index, data)
    }

    #[test]
    fn combine_then_split_round_trips() {
        let episodes = vec![ramp(4, 3, 2), ramp(0, 5, 2), ramp(7, 1, 2)];
        let combined = combine_episodes(&episodes, true).unwrap();
        assert_eq!(combined.nrows(), 9);
        assert_eq!(combined.ncols(), 3);
        assert_eq!(combined[(0, 0)], 4.0);
        assert_eq!(combined[(3, 0)], 0.0);

        let back = split_episodes(&combined, true).unwrap();
        assert_eq!(back, episodes);
    }

    #[test]
    fn round_trip_of_empty_list() {
        let combined = combine_episodes(&[], true).unwrap();
        assert_eq!(combined.nrows(), 0);
        assert!(split_episodes(&combined, true).unwrap().is_empty());
    }

    #[test]
    fn split_without_marker_yields_single_episode() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let episodes = split_episodes(&m, false).unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].index, 0);
        assert_eq!(episodes[0].data, m);
    }

    #[test]
    fn combine_rejects_duplicates_and_ragged_widths() {
        let dup = combine_episodes(&[ramp(1, 2, 2), ramp(1, 2, 2)], true);
        assert!(dup.is_err());

        let ragged = combine_episodes(&[ramp(1, 2, 2), ramp(2, 2, 3)], true);
        assert!(ragged.is_err());

        let empty = combine_episodes(&[ramp(1, 0, 2)], true);
        assert!(empty.is_err());
    }

    #[test]
    fn split_rejects_interleaved_and_fractional_markers() {
        let interleaved = DMatrix::from_row_slice(3, 2, &[0.0, 1.0, 1.0, 2.0, 0.0, 3.0]);
        assert!(split_episodes(&interleaved, true).is_err());

        let fractional = DMatrix::from_row_slice(1, 2, &[0.5, 1.0]);
        assert!(split_episodes(&fractional, true).is_err());
    }

    #[test]
    fn episode_helpers() {
        let ep = ramp(2, 4, 3);
        assert_eq!(ep.skip_samples(1).len(), 3);
        assert_eq!(ep.skip_samples(10).len(), 0);
        assert_eq!(ep.leading_columns(2).width(), 2);
        assert_eq!(ep.leading_columns(2).data[(1, 1)], ep.data[(1, 1)]);
    }
}
