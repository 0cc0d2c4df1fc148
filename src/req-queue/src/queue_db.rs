use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use ltfsdm_lib::{unix_timestamp, DmError, DmResult, FileState, OpKind, ReqState, TargetState};
use rusqlite::{params, Connection, OptionalExtension};

/// One REQUEST_QUEUE row. A migration request has one row per pool and
/// replica; recall and tape-move requests have a single row each.
#[derive(Debug, Clone)]
pub struct Request {
    pub operation: OpKind,
    pub req_num: i64,
    pub target_state: TargetState,
    pub num_repl: i64,
    pub repl_num: i64,
    pub pool: String,
    pub tape_id: String,
    pub drive_id: String,
    pub state: ReqState,
}

/// One JOB_QUEUE row: a single file of a single replica.
#[derive(Debug, Clone)]
pub struct Job {
    pub operation: OpKind,
    pub file_name: String,
    pub req_num: i64,
    pub target_state: TargetState,
    pub repl_num: i64,
    pub file_size: i64,
    pub tape_id: String,
    pub file_state: FileState,
}

/// Folded per-state job counts as reported to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub resident: i64,
    pub premigrated: i64,
    pub migrated: i64,
    pub failed: i64,
}

#[derive(Debug, Clone)]
pub struct ManagedFs {
    pub fs_path: String,
    pub mount_point: String,
    pub fs_name: String,
    pub added_at: u64,
}

#[derive(Debug, Clone)]
pub struct TapeRecord {
    pub tape_id: String,
    pub slot: u64,
    pub total_cap: u64,
    pub remaining_cap: u64,
}

fn db_err(e: rusqlite::Error) -> DmError {
    DmError::Db(e.to_string())
}

fn op_from_sql(s: &str) -> DmResult<OpKind> {
    OpKind::from_str(s).ok_or_else(|| DmError::Db(format!("unknown operation '{}'", s)))
}

fn req_state_from_sql(s: &str) -> DmResult<ReqState> {
    ReqState::from_str(s).ok_or_else(|| DmError::Db(format!("unknown request state '{}'", s)))
}

fn target_from_sql(s: &str) -> DmResult<TargetState> {
    TargetState::from_str(s).ok_or_else(|| DmError::Db(format!("unknown target state '{}'", s)))
}

fn file_state_from_sql(s: &str) -> DmResult<FileState> {
    FileState::from_str(s).ok_or_else(|| DmError::Db(format!("unknown file state '{}'", s)))
}

/// The persistent request and job queues. One connection guarded by a
/// mutex; concurrent readers (the client's info paths) open their own
/// store on the same database file.
pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl QueueStore {
    pub fn open(db_path: &Path) -> DmResult<QueueStore> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS REQUEST_QUEUE (
                OPERATION TEXT NOT NULL,
                REQ_NUM INTEGER NOT NULL,
                TARGET_STATE TEXT NOT NULL,
                NUM_REPL INTEGER NOT NULL,
                REPL_NUM INTEGER NOT NULL,
                POOL TEXT NOT NULL DEFAULT '',
                TAPE_ID TEXT NOT NULL DEFAULT '',
                DRIVE_ID TEXT NOT NULL DEFAULT '',
                STATE TEXT NOT NULL,
                TIME_ADDED INTEGER NOT NULL,
                PRIMARY KEY (REQ_NUM, REPL_NUM, POOL)
            );
            CREATE TABLE IF NOT EXISTS JOB_QUEUE (
                OPERATION TEXT NOT NULL,
                FILE_NAME TEXT NOT NULL,
                REQ_NUM INTEGER NOT NULL,
                TARGET_STATE TEXT NOT NULL,
                REPL_NUM INTEGER NOT NULL,
                FILE_SIZE INTEGER NOT NULL,
                TAPE_ID TEXT NOT NULL DEFAULT '',
                FILE_STATE TEXT NOT NULL,
                TIME_ADDED INTEGER NOT NULL,
                PRIMARY KEY (FILE_NAME, REPL_NUM, REQ_NUM)
            );
            CREATE TABLE IF NOT EXISTS MANAGED_FS (
                FS_PATH TEXT PRIMARY KEY,
                MOUNT_POINT TEXT NOT NULL,
                FS_NAME TEXT NOT NULL,
                ADDED_AT INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS TAPE_LIST (
                TAPE_ID TEXT PRIMARY KEY,
                SLOT INTEGER NOT NULL,
                TOTAL_CAP INTEGER NOT NULL,
                REMAINING_CAP INTEGER NOT NULL,
                UPDATED_AT INTEGER NOT NULL
            );",
        )
        .map_err(db_err)?;
        Ok(QueueStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_request(&self, req: &Request) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO REQUEST_QUEUE (OPERATION, REQ_NUM, TARGET_STATE, NUM_REPL, REPL_NUM,
                POOL, TAPE_ID, DRIVE_ID, STATE, TIME_ADDED)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                req.operation.as_str(),
                req.req_num,
                req.target_state.as_str(),
                req.num_repl,
                req.repl_num,
                req.pool,
                req.tape_id,
                req.drive_id,
                req.state.as_str(),
                unix_timestamp() as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Duplicate `(file_name, repl_num)` within a request violates the
    /// primary key; that case is surfaced distinctly so the caller can
    /// report the single file without aborting the request.
    pub fn insert_job(&self, job: &Job) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        match conn.execute(
            "INSERT INTO JOB_QUEUE (OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE, REPL_NUM,
                FILE_SIZE, TAPE_ID, FILE_STATE, TIME_ADDED)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.operation.as_str(),
                job.file_name,
                job.req_num,
                job.target_state.as_str(),
                job.repl_num,
                job.file_size,
                job.tape_id,
                job.file_state.as_str(),
                unix_timestamp() as i64,
            ],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DmError::DuplicateJob(job.file_name.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn request_rows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> DmResult<Vec<Request>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut requests = Vec::with_capacity(rows.len());
        for (op, req_num, target, num_repl, repl_num, pool, tape_id, drive_id, state) in rows {
            requests.push(Request {
                operation: op_from_sql(&op)?,
                req_num,
                target_state: target_from_sql(&target)?,
                num_repl,
                repl_num,
                pool,
                tape_id,
                drive_id,
                state: req_state_from_sql(&state)?,
            });
        }
        Ok(requests)
    }

    const REQUEST_COLS: &'static str =
        "OPERATION, REQ_NUM, TARGET_STATE, NUM_REPL, REPL_NUM, POOL, TAPE_ID, DRIVE_ID, STATE";

    /// Rows awaiting scheduling, in arrival order.
    pub fn new_requests(&self) -> DmResult<Vec<Request>> {
        self.request_rows(
            &format!(
                "SELECT {} FROM REQUEST_QUEUE WHERE STATE = ?1 ORDER BY REQ_NUM, REPL_NUM",
                Self::REQUEST_COLS
            ),
            &[&ReqState::New.as_str()],
        )
    }

    pub fn requests(&self, req_num: Option<i64>) -> DmResult<Vec<Request>> {
        match req_num {
            Some(n) => self.request_rows(
                &format!(
                    "SELECT {} FROM REQUEST_QUEUE WHERE REQ_NUM = ?1 ORDER BY REQ_NUM, REPL_NUM",
                    Self::REQUEST_COLS
                ),
                &[&n],
            ),
            None => self.request_rows(
                &format!(
                    "SELECT {} FROM REQUEST_QUEUE ORDER BY REQ_NUM, REPL_NUM",
                    Self::REQUEST_COLS
                ),
                &[],
            ),
        }
    }

    pub fn update_request_state(&self, req_num: i64, state: ReqState) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2",
            params![state.as_str(), req_num],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Commit a migration replica to a tape and drive.
    pub fn bind_migration_request(
        &self,
        req_num: i64,
        repl_num: i64,
        pool: &str,
        tape_id: &str,
        drive_id: &str,
    ) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1, TAPE_ID = ?2, DRIVE_ID = ?3
             WHERE REQ_NUM = ?4 AND REPL_NUM = ?5 AND POOL = ?6",
            params![
                ReqState::InProgress.as_str(),
                tape_id,
                drive_id,
                req_num,
                repl_num,
                pool
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Commit a recall or tape-handling request bound to a specific tape.
    pub fn bind_recall_request(&self, req_num: i64, tape_id: &str, drive_id: &str) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1, DRIVE_ID = ?2
             WHERE REQ_NUM = ?3 AND TAPE_ID = ?4",
            params![ReqState::InProgress.as_str(), drive_id, req_num, tape_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// A pre-empted migration replica goes back to the queue unbound.
    pub fn suspend_migration_request(&self, req_num: i64, repl_num: i64, pool: &str) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1, TAPE_ID = '', DRIVE_ID = ''
             WHERE REQ_NUM = ?2 AND REPL_NUM = ?3 AND POOL = ?4",
            params![ReqState::New.as_str(), req_num, repl_num, pool],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn complete_migration_request(
        &self,
        req_num: i64,
        repl_num: i64,
        pool: &str,
    ) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1
             WHERE REQ_NUM = ?2 AND REPL_NUM = ?3 AND POOL = ?4",
            params![ReqState::Completed.as_str(), req_num, repl_num, pool],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// A transparent-recall request picked up a late job after its
    /// worker completed; put it back into the queue.
    pub fn reopen_recall_request(&self, req_num: i64, tape_id: &str) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1, DRIVE_ID = ''
             WHERE REQ_NUM = ?2 AND TAPE_ID = ?3",
            params![ReqState::New.as_str(), req_num, tape_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn complete_recall_request(&self, req_num: i64, tape_id: &str) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE REQUEST_QUEUE SET STATE = ?1 WHERE REQ_NUM = ?2 AND TAPE_ID = ?3",
            params![ReqState::Completed.as_str(), req_num, tape_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Smallest file still resident for a migration replica; drives the
    /// capacity check in pool scheduling.
    pub fn smallest_resident_job(&self, req_num: i64, repl_num: i64) -> DmResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT MIN(FILE_SIZE) FROM JOB_QUEUE
             WHERE REQ_NUM = ?1 AND REPL_NUM = ?2 AND FILE_STATE = ?3",
            params![req_num, repl_num, FileState::Resident.as_str()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(db_err)
    }

    /// In-flight states fold into the nearest client-visible bucket.
    pub fn job_state_counts(&self, req_num: i64) -> DmResult<JobCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT FILE_STATE, COUNT(*) FROM JOB_QUEUE WHERE REQ_NUM = ?1 GROUP BY FILE_STATE",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![req_num], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            match file_state_from_sql(&state)? {
                FileState::Resident | FileState::InMigration => counts.resident += count,
                FileState::Premigrated | FileState::Stubbing => counts.premigrated += count,
                FileState::Migrated | FileState::InRecall => counts.migrated += count,
                FileState::Failed => counts.failed += count,
            }
        }
        Ok(counts)
    }

    /// A request is done once every one of its queue rows completed.
    pub fn request_done(&self, req_num: i64) -> DmResult<bool> {
        let conn = self.conn.lock().unwrap();
        let open: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM REQUEST_QUEUE WHERE REQ_NUM = ?1 AND STATE != ?2",
                params![req_num, ReqState::Completed.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM REQUEST_QUEUE WHERE REQ_NUM = ?1",
                params![req_num],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(total > 0 && open == 0)
    }

    pub fn update_job_state(
        &self,
        req_num: i64,
        repl_num: i64,
        file_name: &str,
        state: FileState,
    ) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE JOB_QUEUE SET FILE_STATE = ?1
             WHERE REQ_NUM = ?2 AND REPL_NUM = ?3 AND FILE_NAME = ?4",
            params![state.as_str(), req_num, repl_num, file_name],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Stubbing a multi-replica file finishes all of its rows at once.
    pub fn update_job_state_all_replicas(
        &self,
        req_num: i64,
        file_name: &str,
        state: FileState,
    ) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE JOB_QUEUE SET FILE_STATE = ?1 WHERE REQ_NUM = ?2 AND FILE_NAME = ?3",
            params![state.as_str(), req_num, file_name],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn update_job_tape(
        &self,
        req_num: i64,
        repl_num: i64,
        file_name: &str,
        tape_id: &str,
    ) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE JOB_QUEUE SET TAPE_ID = ?1
             WHERE REQ_NUM = ?2 AND REPL_NUM = ?3 AND FILE_NAME = ?4",
            params![tape_id, req_num, repl_num, file_name],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn job_rows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> DmResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (op, file_name, req_num, target, repl_num, file_size, tape_id, file_state) in rows {
            jobs.push(Job {
                operation: op_from_sql(&op)?,
                file_name,
                req_num,
                target_state: target_from_sql(&target)?,
                repl_num,
                file_size,
                tape_id,
                file_state: file_state_from_sql(&file_state)?,
            });
        }
        Ok(jobs)
    }

    const JOB_COLS: &'static str =
        "OPERATION, FILE_NAME, REQ_NUM, TARGET_STATE, REPL_NUM, FILE_SIZE, TAPE_ID, FILE_STATE";

    pub fn jobs(&self, req_num: Option<i64>) -> DmResult<Vec<Job>> {
        match req_num {
            Some(n) => self.job_rows(
                &format!(
                    "SELECT {} FROM JOB_QUEUE WHERE REQ_NUM = ?1 ORDER BY ROWID",
                    Self::JOB_COLS
                ),
                &[&n],
            ),
            None => self.job_rows(
                &format!("SELECT {} FROM JOB_QUEUE ORDER BY ROWID", Self::JOB_COLS),
                &[],
            ),
        }
    }

    /// Migration work list: files of one replica still resident.
    pub fn resident_jobs(&self, req_num: i64, repl_num: i64) -> DmResult<Vec<Job>> {
        self.job_rows(
            &format!(
                "SELECT {} FROM JOB_QUEUE
                 WHERE REQ_NUM = ?1 AND REPL_NUM = ?2 AND FILE_STATE = ?3 ORDER BY ROWID",
                Self::JOB_COLS
            ),
            &[&req_num, &repl_num, &FileState::Resident.as_str()],
        )
    }

    /// Recall work list: files of one request on one tape.
    pub fn recall_jobs(&self, req_num: i64, tape_id: &str) -> DmResult<Vec<Job>> {
        self.job_rows(
            &format!(
                "SELECT {} FROM JOB_QUEUE
                 WHERE REQ_NUM = ?1 AND TAPE_ID = ?2 AND FILE_STATE IN (?3, ?4) ORDER BY ROWID",
                Self::JOB_COLS
            ),
            &[
                &req_num,
                &tape_id,
                &FileState::Migrated.as_str(),
                &FileState::Premigrated.as_str(),
            ],
        )
    }

    /// Distinct tapes holding jobs of one recall request, in job order.
    pub fn job_tapes(&self, req_num: i64) -> DmResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT TAPE_ID FROM JOB_QUEUE WHERE REQ_NUM = ?1 AND TAPE_ID != ''
                 GROUP BY TAPE_ID ORDER BY MIN(ROWID)",
            )
            .map_err(db_err)?;
        let tapes = stmt
            .query_map(params![req_num], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(tapes)
    }

    /// Crash recovery: whatever was running when the server died is
    /// rescheduled from scratch. Migration rows lose their tape binding,
    /// recall rows keep it (the tape is part of their identity).
    pub fn reset_in_progress(&self) -> DmResult<usize> {
        let conn = self.conn.lock().unwrap();
        let migrations = conn
            .execute(
                "UPDATE REQUEST_QUEUE SET STATE = ?1, TAPE_ID = '', DRIVE_ID = ''
                 WHERE STATE = ?2 AND OPERATION = ?3",
                params![
                    ReqState::New.as_str(),
                    ReqState::InProgress.as_str(),
                    OpKind::Migration.as_str()
                ],
            )
            .map_err(db_err)?;
        let others = conn
            .execute(
                "UPDATE REQUEST_QUEUE SET STATE = ?1, DRIVE_ID = ''
                 WHERE STATE = ?2",
                params![ReqState::New.as_str(), ReqState::InProgress.as_str()],
            )
            .map_err(db_err)?;
        Ok(migrations + others)
    }

    pub fn in_progress_count(&self) -> DmResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM REQUEST_QUEUE WHERE STATE = ?1",
            params![ReqState::InProgress.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Requests that still need scheduler attention (finish-drain stop).
    pub fn open_request_count(&self) -> DmResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM REQUEST_QUEUE WHERE STATE != ?1",
            params![ReqState::Completed.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// Open transparent-recall request for a tape, if any; new upcalls
    /// for the same tape join it instead of creating a second request.
    pub fn active_recall_request(&self, tape_id: &str) -> DmResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT REQ_NUM FROM REQUEST_QUEUE
             WHERE OPERATION = ?1 AND TAPE_ID = ?2 AND STATE != ?3
             ORDER BY REQ_NUM LIMIT 1",
            params![
                OpKind::TraRecall.as_str(),
                tape_id,
                ReqState::Completed.as_str()
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Returns false if the file system is already registered.
    pub fn register_fs(&self, fs: &ManagedFs) -> DmResult<bool> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT FS_PATH FROM MANAGED_FS WHERE FS_PATH = ?1",
                params![fs.fs_path],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if existing.is_some() {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO MANAGED_FS (FS_PATH, MOUNT_POINT, FS_NAME, ADDED_AT)
             VALUES (?1, ?2, ?3, ?4)",
            params![fs.fs_path, fs.mount_point, fs.fs_name, fs.added_at as i64],
        )
        .map_err(db_err)?;
        Ok(true)
    }

    pub fn managed_fs_list(&self) -> DmResult<Vec<ManagedFs>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT FS_PATH, MOUNT_POINT, FS_NAME, ADDED_AT FROM MANAGED_FS ORDER BY FS_PATH")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ManagedFs {
                    fs_path: row.get(0)?,
                    mount_point: row.get(1)?,
                    fs_name: row.get(2)?,
                    added_at: row.get::<_, i64>(3)? as u64,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Snapshot of the tapes seen at the last inventory.
    pub fn record_tapes(&self, tapes: &[TapeRecord]) -> DmResult<()> {
        let conn = self.conn.lock().unwrap();
        for tape in tapes {
            conn.execute(
                "INSERT INTO TAPE_LIST (TAPE_ID, SLOT, TOTAL_CAP, REMAINING_CAP, UPDATED_AT)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(TAPE_ID) DO UPDATE SET
                    SLOT = excluded.SLOT,
                    TOTAL_CAP = excluded.TOTAL_CAP,
                    REMAINING_CAP = excluded.REMAINING_CAP,
                    UPDATED_AT = excluded.UPDATED_AT",
                params![
                    tape.tape_id,
                    tape.slot as i64,
                    tape.total_cap as i64,
                    tape.remaining_cap as i64,
                    unix_timestamp() as i64,
                ],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (QueueStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = QueueStore::open(&tmp.path().join("queue.db")).unwrap();
        (store, tmp)
    }

    fn mig_request(req_num: i64, repl_num: i64, pool: &str) -> Request {
        Request {
            operation: OpKind::Migration,
            req_num,
            target_state: TargetState::Migrated,
            num_repl: 1,
            repl_num,
            pool: pool.to_string(),
            tape_id: String::new(),
            drive_id: String::new(),
            state: ReqState::New,
        }
    }

    fn mig_job(req_num: i64, repl_num: i64, file_name: &str, size: i64) -> Job {
        Job {
            operation: OpKind::Migration,
            file_name: file_name.to_string(),
            req_num,
            target_state: TargetState::Migrated,
            repl_num,
            file_size: size,
            tape_id: String::new(),
            file_state: FileState::Resident,
        }
    }

    #[test]
    fn test_duplicate_job_is_distinct_error() {
        let (store, _tmp) = open_store();
        store.insert_job(&mig_job(1, 0, "/data/a", 100)).unwrap();
        let err = store.insert_job(&mig_job(1, 0, "/data/a", 100)).unwrap_err();
        assert!(err.is_duplicate_job());
        // same file under a different replica is a different row
        store.insert_job(&mig_job(1, 1, "/data/a", 100)).unwrap();
    }

    #[test]
    fn test_new_requests_ordered_by_req_num() {
        let (store, _tmp) = open_store();
        store.insert_request(&mig_request(3, 0, "p1")).unwrap();
        store.insert_request(&mig_request(1, 0, "p1")).unwrap();
        store.insert_request(&mig_request(1, 1, "p2")).unwrap();
        store.insert_request(&mig_request(2, 0, "p1")).unwrap();

        let rows = store.new_requests().unwrap();
        let order: Vec<(i64, i64)> = rows.iter().map(|r| (r.req_num, r.repl_num)).collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0), (3, 0)]);
    }

    #[test]
    fn test_smallest_resident_job() {
        let (store, _tmp) = open_store();
        store.insert_job(&mig_job(1, 0, "/data/a", 4096)).unwrap();
        store.insert_job(&mig_job(1, 0, "/data/b", 1024)).unwrap();
        store.insert_job(&mig_job(1, 0, "/data/c", 9000)).unwrap();
        store.update_job_state(1, 0, "/data/b", FileState::Migrated).unwrap();

        assert_eq!(store.smallest_resident_job(1, 0).unwrap(), Some(4096));
        assert_eq!(store.smallest_resident_job(2, 0).unwrap(), None);
    }

    #[test]
    fn test_job_state_counts_fold_in_flight_states() {
        let (store, _tmp) = open_store();
        store.insert_job(&mig_job(1, 0, "/data/a", 1)).unwrap();
        store.insert_job(&mig_job(1, 0, "/data/b", 1)).unwrap();
        store.insert_job(&mig_job(1, 0, "/data/c", 1)).unwrap();
        store.insert_job(&mig_job(1, 0, "/data/d", 1)).unwrap();
        store.update_job_state(1, 0, "/data/b", FileState::InMigration).unwrap();
        store.update_job_state(1, 0, "/data/c", FileState::Stubbing).unwrap();
        store.update_job_state(1, 0, "/data/d", FileState::Failed).unwrap();

        let counts = store.job_state_counts(1).unwrap();
        assert_eq!(counts.resident, 2);
        assert_eq!(counts.premigrated, 1);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn test_request_done_requires_all_rows_completed() {
        let (store, _tmp) = open_store();
        assert!(!store.request_done(1).unwrap());

        store.insert_request(&mig_request(1, 0, "p1")).unwrap();
        store.insert_request(&mig_request(1, 1, "p2")).unwrap();
        store.complete_migration_request(1, 0, "p1").unwrap();
        assert!(!store.request_done(1).unwrap());

        store.complete_migration_request(1, 1, "p2").unwrap();
        assert!(store.request_done(1).unwrap());
    }

    #[test]
    fn test_reset_in_progress_unbinds_migrations_only() {
        let (store, _tmp) = open_store();
        store.insert_request(&mig_request(1, 0, "p1")).unwrap();
        store.bind_migration_request(1, 0, "p1", "T1", "D1").unwrap();

        let mut rec = mig_request(2, 0, "");
        rec.operation = OpKind::SelRecall;
        rec.tape_id = "T2".to_string();
        store.insert_request(&rec).unwrap();
        store.bind_recall_request(2, "T2", "D2").unwrap();

        store.reset_in_progress().unwrap();

        let rows = store.requests(None).unwrap();
        let mig = rows.iter().find(|r| r.req_num == 1).unwrap();
        assert_eq!(mig.state, ReqState::New);
        assert!(mig.tape_id.is_empty());
        assert!(mig.drive_id.is_empty());

        let rec = rows.iter().find(|r| r.req_num == 2).unwrap();
        assert_eq!(rec.state, ReqState::New);
        assert_eq!(rec.tape_id, "T2");
        assert!(rec.drive_id.is_empty());
    }

    #[test]
    fn test_register_fs_reports_existing() {
        let (store, _tmp) = open_store();
        let fs = ManagedFs {
            fs_path: "/mnt/data".to_string(),
            mount_point: "/mnt/data".to_string(),
            fs_name: "xfs".to_string(),
            added_at: 1,
        };
        assert!(store.register_fs(&fs).unwrap());
        assert!(!store.register_fs(&fs).unwrap());
        assert_eq!(store.managed_fs_list().unwrap().len(), 1);
    }

    #[test]
    fn test_active_recall_request_grouping() {
        let (store, _tmp) = open_store();
        let mut req = mig_request(5, 0, "");
        req.operation = OpKind::TraRecall;
        req.tape_id = "T9".to_string();
        store.insert_request(&req).unwrap();

        assert_eq!(store.active_recall_request("T9").unwrap(), Some(5));
        assert_eq!(store.active_recall_request("T1").unwrap(), None);

        store.complete_recall_request(5, "T9").unwrap();
        assert_eq!(store.active_recall_request("T9").unwrap(), None);
    }
}
