use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{RetryPolicy, StoredStudy, StudyStorage};
use crate::error::{OptimizerError, OptimizerResult};
use crate::trial::{FrozenTrial, StudyConfig, TrialState};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS studies (
        study_id BIGINT PRIMARY KEY,
        study_name VARCHAR NOT NULL UNIQUE,
        direction VARCHAR NOT NULL,
        config_json VARCHAR NOT NULL,
        created_at VARCHAR NOT NULL
    );

    CREATE TABLE IF NOT EXISTS trials (
        study_id BIGINT NOT NULL,
        number BIGINT NOT NULL,
        state VARCHAR NOT NULL,
        value DOUBLE,
        worker_id VARCHAR,
        error VARCHAR,
        started_at VARCHAR NOT NULL,
        finished_at VARCHAR,
        PRIMARY KEY (study_id, number)
    );

    CREATE TABLE IF NOT EXISTS trial_params (
        study_id BIGINT NOT NULL,
        number BIGINT NOT NULL,
        name VARCHAR NOT NULL,
        value DOUBLE NOT NULL,
        PRIMARY KEY (study_id, number, name)
    );

    CREATE TABLE IF NOT EXISTS trial_intermediate_values (
        study_id BIGINT NOT NULL,
        number BIGINT NOT NULL,
        step BIGINT NOT NULL,
        value DOUBLE NOT NULL,
        PRIMARY KEY (study_id, number, step)
    );";

/// Study storage in a DuckDB file.
///
/// Every operation opens its own connection and runs in one transaction, so
/// several worker processes can share the file. DuckDB admits one writer
/// process at a time; lock and conflict errors are retried with backoff.
#[derive(Debug)]
pub struct DuckDbStorage {
    path: PathBuf,
    retry: RetryPolicy,
    // Serializes operations from threads of this process.
    local: Mutex<()>,
}

impl DuckDbStorage {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> OptimizerResult<Self> {
        Self::open_with_retry(path, RetryPolicy::default())
    }

    pub fn open_with_retry<P: AsRef<Path>>(path: P, retry: RetryPolicy) -> OptimizerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let storage = Self {
            path,
            retry,
            local: Mutex::new(()),
        };
        storage.run("init_schema", |conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        debug!(path = %storage.path.display(), "opened study storage");
        Ok(storage)
    }

    /// Delete any existing database at `path` and open an empty store.
    pub fn recreate<P: AsRef<Path>>(path: P) -> OptimizerResult<Self> {
        let path = path.as_ref();
        let mut wal = path.as_os_str().to_owned();
        wal.push(".wal");
        for file in [path.to_path_buf(), PathBuf::from(wal)] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        info!(path = %path.display(), "recreated study storage");
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn run<T>(&self, operation: &str, f: impl Fn(&Connection) -> OptimizerResult<T>) -> OptimizerResult<T> {
        let _guard = self.local.lock();
        self.retry.run(operation, || {
            let mut conn = Connection::open(&self.path)?;
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }
}

fn parse_time(raw: &str) -> OptimizerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OptimizerError::Storage {
            message: format!("invalid timestamp '{raw}': {e}"),
        })
}

fn load_trials(conn: &Connection, study_id: i64, only: Option<usize>) -> OptimizerResult<Vec<FrozenTrial>> {
    let number_filter = only.map(|n| n as i64).unwrap_or(-1);

    let mut stmt = conn.prepare(
        "SELECT number, state, value, worker_id, error, started_at, finished_at
         FROM trials WHERE study_id = ? AND (? < 0 OR number = ?) ORDER BY number",
    )?;
    let rows = stmt
        .query_map(params![study_id, number_filter, number_filter], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut trials = BTreeMap::new();
    for (number, state, value, worker_id, error, started_at, finished_at) in rows {
        let number = number as usize;
        trials.insert(
            number,
            FrozenTrial {
                number,
                state: TrialState::parse(&state)?,
                params: BTreeMap::new(),
                value,
                intermediate_values: BTreeMap::new(),
                worker_id,
                started_at: parse_time(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_time).transpose()?,
                error,
            },
        );
    }

    let mut stmt = conn.prepare(
        "SELECT number, name, value FROM trial_params
         WHERE study_id = ? AND (? < 0 OR number = ?)",
    )?;
    let params_rows = stmt
        .query_map(params![study_id, number_filter, number_filter], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (number, name, value) in params_rows {
        if let Some(trial) = trials.get_mut(&(number as usize)) {
            trial.params.insert(name, value);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT number, step, value FROM trial_intermediate_values
         WHERE study_id = ? AND (? < 0 OR number = ?)",
    )?;
    let steps = stmt
        .query_map(params![study_id, number_filter, number_filter], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (number, step, value) in steps {
        if let Some(trial) = trials.get_mut(&(number as usize)) {
            trial.intermediate_values.insert(step as usize, value);
        }
    }

    Ok(trials.into_values().collect())
}

fn study_exists(conn: &Connection, study_id: i64) -> OptimizerResult<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM studies WHERE study_id = ?",
        params![study_id],
        |row| row.get(0),
    )?;
    if count == 0 {
        return Err(OptimizerError::StudyNotFound {
            name: format!("id {study_id}"),
        });
    }
    Ok(())
}

fn find_trial(conn: &Connection, study_id: i64, number: usize) -> OptimizerResult<FrozenTrial> {
    load_trials(conn, study_id, Some(number))?
        .pop()
        .ok_or(OptimizerError::TrialNotFound { number })
}

fn ensure_running(conn: &Connection, study_id: i64, number: usize) -> OptimizerResult<()> {
    let trial = find_trial(conn, study_id, number)?;
    if trial.state.is_finished() {
        return Err(OptimizerError::Storage {
            message: format!("trial {number} is already {}", trial.state.as_str()),
        });
    }
    Ok(())
}

impl StudyStorage for DuckDbStorage {
    fn create_study(&self, config: &StudyConfig) -> OptimizerResult<i64> {
        let config_json = serde_json::to_string(config)?;
        let id = self.run("create_study", |conn| {
            let taken: i64 = conn.query_row(
                "SELECT COUNT(*) FROM studies WHERE study_name = ?",
                params![config.name],
                |row| row.get(0),
            )?;
            if taken > 0 {
                return Err(OptimizerError::DuplicateStudy {
                    name: config.name.clone(),
                });
            }
            let id: i64 = conn.query_row("SELECT COALESCE(MAX(study_id) + 1, 0) FROM studies", params![], |row| {
                row.get(0)
            })?;
            conn.execute(
                "INSERT INTO studies (study_id, study_name, direction, config_json, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    id,
                    config.name,
                    config.direction.as_str(),
                    config_json,
                    config.created_at.to_rfc3339()
                ],
            )?;
            Ok(id)
        })?;
        info!(study = %config.name, study_id = id, "created study");
        Ok(id)
    }

    fn load_study(&self, name: Option<&str>) -> OptimizerResult<StoredStudy> {
        let rows = self.run("load_study", |conn| {
            let mut stmt = conn.prepare("SELECT study_id, study_name, config_json FROM studies ORDER BY study_id")?;
            let rows = stmt
                .query_map(params![], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let (id, _, json) = match name {
            Some(name) => rows
                .into_iter()
                .find(|(_, n, _)| n == name)
                .ok_or_else(|| OptimizerError::StudyNotFound { name: name.to_string() })?,
            None => {
                let count = rows.len();
                let mut rows = rows.into_iter();
                match (rows.next(), count) {
                    (Some(only), 1) => only,
                    (None, _) => {
                        return Err(OptimizerError::StudyNotFound {
                            name: "<any>".to_string(),
                        })
                    }
                    _ => return Err(OptimizerError::AmbiguousStudy { count }),
                }
            }
        };
        Ok(StoredStudy {
            id,
            config: serde_json::from_str(&json)?,
        })
    }

    fn create_trial(&self, study_id: i64, worker_id: &str) -> OptimizerResult<usize> {
        let number = self.run("create_trial", |conn| {
            study_exists(conn, study_id)?;
            let number: i64 = conn.query_row(
                "SELECT COALESCE(MAX(number) + 1, 0) FROM trials WHERE study_id = ?",
                params![study_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO trials (study_id, number, state, worker_id, started_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    study_id,
                    number,
                    TrialState::Running.as_str(),
                    worker_id,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(number)
        })?;
        Ok(number as usize)
    }

    fn set_trial_param(&self, study_id: i64, number: usize, name: &str, value: f64) -> OptimizerResult<()> {
        self.run("set_trial_param", |conn| {
            ensure_running(conn, study_id, number)?;
            conn.execute(
                "INSERT OR REPLACE INTO trial_params (study_id, number, name, value) VALUES (?, ?, ?, ?)",
                params![study_id, number as i64, name, value],
            )?;
            Ok(())
        })
    }

    fn report_intermediate(&self, study_id: i64, number: usize, step: usize, value: f64) -> OptimizerResult<()> {
        self.run("report_intermediate", |conn| {
            ensure_running(conn, study_id, number)?;
            conn.execute(
                "INSERT OR REPLACE INTO trial_intermediate_values (study_id, number, step, value)
                 VALUES (?, ?, ?, ?)",
                params![study_id, number as i64, step as i64, value],
            )?;
            Ok(())
        })
    }

    fn finalize_trial(
        &self,
        study_id: i64,
        number: usize,
        state: TrialState,
        value: Option<f64>,
        error: Option<&str>,
    ) -> OptimizerResult<()> {
        self.run("finalize_trial", |conn| {
            let mut trial = find_trial(conn, study_id, number)?;
            trial.finish(state, value, error.map(str::to_string))?;
            conn.execute(
                "UPDATE trials SET state = ?, value = ?, error = ?, finished_at = ?
                 WHERE study_id = ? AND number = ?",
                params![
                    trial.state.as_str(),
                    trial.value,
                    trial.error,
                    trial.finished_at.map(|t| t.to_rfc3339()),
                    study_id,
                    number as i64
                ],
            )?;
            Ok(())
        })
    }

    fn trials(&self, study_id: i64) -> OptimizerResult<Vec<FrozenTrial>> {
        self.run("trials", |conn| {
            study_exists(conn, study_id)?;
            load_trials(conn, study_id, None)
        })
    }

    fn trial(&self, study_id: i64, number: usize) -> OptimizerResult<FrozenTrial> {
        self.run("trial", |conn| find_trial(conn, study_id, number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchSpace;
    use crate::trial::ObjectiveDirection;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn config(name: &str) -> StudyConfig {
        StudyConfig::new(name, SearchSpace::new().add_log_uniform("alpha", 1e-12, 1e12))
            .with_direction(ObjectiveDirection::Maximize)
    }

    #[test]
    fn study_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("studies").join("cl.db");

        let study_config = config("closed_loop");
        let id = {
            let storage = DuckDbStorage::open(&path).unwrap();
            let id = storage.create_study(&study_config).unwrap();
            let n = storage.create_trial(id, "pid-1").unwrap();
            storage.set_trial_param(id, n, "alpha", 1e-3).unwrap();
            storage.report_intermediate(id, n, 0, 0.91).unwrap();
            storage.report_intermediate(id, n, 1, 0.93).unwrap();
            storage.finalize_trial(id, n, TrialState::Completed, Some(0.92), None).unwrap();
            id
        };

        let storage = DuckDbStorage::open(&path).unwrap();
        let stored = storage.load_study(None).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.config, study_config);

        let trials = storage.trials(id).unwrap();
        assert_eq!(trials.len(), 1);
        let trial = &trials[0];
        assert_eq!(trial.state, TrialState::Completed);
        assert_eq!(trial.value, Some(0.92));
        assert_eq!(trial.params["alpha"], 1e-3);
        assert_eq!(trial.intermediate_values.len(), 2);
        assert_eq!(trial.worker_id.as_deref(), Some("pid-1"));
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn duplicate_and_missing_studies() {
        let dir = TempDir::new().unwrap();
        let storage = DuckDbStorage::open(dir.path().join("s.db")).unwrap();
        assert!(matches!(storage.load_study(None), Err(OptimizerError::StudyNotFound { .. })));
        storage.create_study(&config("a")).unwrap();
        assert!(matches!(
            storage.create_study(&config("a")),
            Err(OptimizerError::DuplicateStudy { .. })
        ));
        storage.create_study(&config("b")).unwrap();
        assert!(matches!(storage.load_study(None), Err(OptimizerError::AmbiguousStudy { count: 2 })));
        assert_eq!(storage.load_study(Some("b")).unwrap().config.name, "b");
        assert!(matches!(storage.create_trial(99, "w"), Err(OptimizerError::StudyNotFound { .. })));
    }

    #[test]
    fn pruned_and_failed_trials_are_recorded() {
        let dir = TempDir::new().unwrap();
        let storage = DuckDbStorage::open(dir.path().join("s.db")).unwrap();
        let id = storage.create_study(&config("ol")).unwrap();

        let pruned = storage.create_trial(id, "w").unwrap();
        storage.report_intermediate(id, pruned, 0, -42.0).unwrap();
        storage.finalize_trial(id, pruned, TrialState::Pruned, None, None).unwrap();

        let failed = storage.create_trial(id, "w").unwrap();
        storage
            .finalize_trial(id, failed, TrialState::Failed, None, Some("diverged"))
            .unwrap();

        let trials = storage.trials(id).unwrap();
        assert_eq!(trials[0].state, TrialState::Pruned);
        assert_eq!(trials[0].value, Some(-42.0));
        assert_eq!(trials[1].state, TrialState::Failed);
        assert_eq!(trials[1].error.as_deref(), Some("diverged"));

        // Finished trials reject further writes.
        assert!(matches!(
            storage.finalize_trial(id, pruned, TrialState::Completed, Some(1.0), None),
            Err(OptimizerError::InvalidTransition { .. })
        ));
        assert!(storage.report_intermediate(id, failed, 1, 0.0).is_err());
        assert!(matches!(
            storage.best_trial(id, ObjectiveDirection::Maximize),
            Err(OptimizerError::NoCompletedTrials)
        ));
    }

    #[test]
    fn recreate_wipes_existing_studies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.db");
        DuckDbStorage::open(&path).unwrap().create_study(&config("a")).unwrap();
        let storage = DuckDbStorage::recreate(&path).unwrap();
        assert!(matches!(storage.load_study(Some("a")), Err(OptimizerError::StudyNotFound { .. })));
        storage.create_study(&config("a")).unwrap();
    }

    #[test]
    fn concurrent_workers_get_unique_trial_numbers() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(DuckDbStorage::open(dir.path().join("s.db")).unwrap());
        let id = storage.create_study(&config("s")).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|w| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    (0..5)
                        .map(|_| {
                            let n = storage.create_trial(id, &format!("w{w}")).unwrap();
                            storage.finalize_trial(id, n, TrialState::Completed, Some(n as f64), None).unwrap();
                            n
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut numbers: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..15).collect::<Vec<_>>());
        assert_eq!(storage.best_trial(id, ObjectiveDirection::Maximize).unwrap().number, 14);
    }
}
