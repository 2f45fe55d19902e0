//! Raw episode loading from CSV.

use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};
use koop_types::{DataError, KoopResult};

/// Channels recorded in one raw experiment file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEpisode {
    pub index: usize,
    pub t: Vec<f64>,
    pub r_theta: Vec<f64>,
    pub r_alpha: Vec<f64>,
    pub theta: Vec<f64>,
    pub alpha: Vec<f64>,
    /// Feedforward voltage.
    pub ff: Vec<f64>,
    /// Applied voltage after feedforward and saturation.
    pub vf: Vec<f64>,
}

impl RawEpisode {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Sampling period implied by the time column.
    pub fn sample_period(&self) -> Option<f64> {
        match self.t.as_slice() {
            [t0, t1, ..] => Some(t1 - t0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnMap {
    t: usize,
    r_theta: usize,
    r_alpha: usize,
    theta: usize,
    alpha: usize,
    ff: usize,
    vf: usize,
}

impl ColumnMap {
    /// Positional layout used by the rig logger:
    /// `t, target_theta, target_alpha, theta, alpha, v, ff, vf`.
    const POSITIONAL: ColumnMap = ColumnMap {
        t: 0,
        r_theta: 1,
        r_alpha: 2,
        theta: 3,
        alpha: 4,
        ff: 6,
        vf: 7,
    };

    fn max_index(&self) -> usize {
        [self.t, self.r_theta, self.r_alpha, self.theta, self.alpha, self.ff, self.vf]
            .into_iter()
            .max()
            .unwrap_or(0)
    }
}

/// Reads raw experiment CSV files (header row, numeric records).
#[derive(Debug, Clone, Default)]
pub struct RawEpisodeLoader;

impl RawEpisodeLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load_csv_file<P: AsRef<Path>>(&self, file_path: P, index: usize) -> KoopResult<RawEpisode> {
        let path = file_path.as_ref();
        tracing::info!("Loading episode {} from: {}", index, path.display());

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to open CSV file {}: {}", path.display(), e),
            })?;
        let headers = rdr
            .headers()
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read CSV headers: {}", e),
            })?
            .clone();
        tracing::debug!("CSV headers: {:?}", headers);
        let columns = self.detect_columns(&headers)?;

        let mut episode = RawEpisode {
            index,
            ..RawEpisode::default()
        };
        for (line_num, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read CSV record at line {}: {}", line_num + 2, e),
            })?;
            if record.len() <= columns.max_index() {
                return Err(DataError::InvalidFormat {
                    message: format!(
                        "line {} has {} fields, expected at least {}",
                        line_num + 2,
                        record.len(),
                        columns.max_index() + 1
                    ),
                }
                .into());
            }
            let field = |col: usize| parse_field(&record, col, line_num + 2);
            episode.t.push(field(columns.t)?);
            episode.r_theta.push(field(columns.r_theta)?);
            episode.r_alpha.push(field(columns.r_alpha)?);
            episode.theta.push(field(columns.theta)?);
            episode.alpha.push(field(columns.alpha)?);
            episode.ff.push(field(columns.ff)?);
            episode.vf.push(field(columns.vf)?);
        }

        if episode.is_empty() {
            return Err(DataError::EmptyEpisode { index }.into());
        }
        tracing::info!("Loaded {} samples from {}", episode.len(), path.display());
        Ok(episode)
    }

    /// Load every `*.csv` file in `dir`, sorted by file name; episode indices
    /// follow that order.
    pub fn load_directory<P: AsRef<Path>>(&self, dir: P) -> KoopResult<Vec<RawEpisode>> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("csv"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(DataError::InsufficientData {
                message: format!("no CSV files in {}", dir.display()),
            }
            .into());
        }
        files
            .iter()
            .enumerate()
            .map(|(index, file)| self.load_csv_file(file, index))
            .collect()
    }

    fn detect_columns(&self, headers: &StringRecord) -> KoopResult<ColumnMap> {
        let find = |candidates: &[&str]| {
            headers
                .iter()
                .position(|h| candidates.iter().any(|c| h.eq_ignore_ascii_case(c)))
        };
        let named = (|| {
            Some(ColumnMap {
                t: find(&["t", "time"])?,
                r_theta: find(&["target_theta", "r_theta"])?,
                r_alpha: find(&["target_alpha", "r_alpha"])?,
                theta: find(&["theta"])?,
                alpha: find(&["alpha"])?,
                ff: find(&["ff", "feedforward"])?,
                vf: find(&["vf"])?,
            })
        })();
        match named {
            Some(map) => Ok(map),
            None if headers.len() > ColumnMap::POSITIONAL.max_index() => {
                tracing::warn!("Unrecognised CSV headers {:?}, using positional layout", headers);
                Ok(ColumnMap::POSITIONAL)
            }
            None => Err(DataError::InvalidFormat {
                message: format!("cannot identify episode columns from headers {:?}", headers),
            }
            .into()),
        }
    }
}

fn parse_field(record: &StringRecord, col: usize, line: usize) -> KoopResult<f64> {
    let raw = record.get(col).unwrap_or_default();
    raw.parse::<f64>().map_err(|e| {
        DataError::ParseError {
            message: format!("line {line}, column {col}: '{raw}' is not a number ({e})"),
        }
        .into()
    })
}
