use std::sync::Arc;

use ltfsdm_lib::{DmError, DmResult, FileState, OpKind, ReqState, TargetState};
use req_queue::{Job, JobCounts, Request};

use crate::daemon::Ctx;

enum FileOpKind {
    Migration { pools: Vec<String> },
    SelRecall,
    TransRecall,
}

/// Builds the job and request rows for one client request. Created by
/// the dispatcher, fed one file name at a time, committed with
/// `add_request`, then polled with `query_result` until done.
pub struct FileOperation {
    ctx: Arc<Ctx>,
    req_num: i64,
    target_state: TargetState,
    kind: FileOpKind,
}

impl FileOperation {
    /// `pools` must already be validated: deduplicated, existing, 1..=3.
    pub fn migration(
        ctx: Arc<Ctx>,
        req_num: i64,
        target_state: TargetState,
        pools: Vec<String>,
    ) -> FileOperation {
        FileOperation {
            ctx,
            req_num,
            target_state,
            kind: FileOpKind::Migration { pools },
        }
    }

    pub fn sel_recall(ctx: Arc<Ctx>, req_num: i64, target_state: TargetState) -> FileOperation {
        FileOperation {
            ctx,
            req_num,
            target_state,
            kind: FileOpKind::SelRecall,
        }
    }

    pub fn trans_recall(ctx: Arc<Ctx>, req_num: i64) -> FileOperation {
        FileOperation {
            ctx,
            req_num,
            target_state: TargetState::Resident,
            kind: FileOpKind::TransRecall,
        }
    }

    pub fn req_num(&self) -> i64 {
        self.req_num
    }

    fn operation(&self) -> OpKind {
        match self.kind {
            FileOpKind::Migration { .. } => OpKind::Migration,
            FileOpKind::SelRecall => OpKind::SelRecall,
            FileOpKind::TransRecall => OpKind::TraRecall,
        }
    }

    /// Validate one file against the target state and insert its job
    /// rows. Failures affect this file only.
    pub fn add_job(&self, file_name: &str) -> DmResult<()> {
        let meta = std::fs::metadata(file_name)
            .map_err(|e| DmError::Io(format!("{}: {}", file_name, e)))?;
        if !meta.is_file() {
            return Err(DmError::Io(format!("{}: not a regular file", file_name)));
        }
        let file_size = meta.len() as i64;
        let cur_state = self.ctx.attrs.state_of(file_name);

        match &self.kind {
            FileOpKind::Migration { pools } => {
                match cur_state {
                    FileState::Resident => {}
                    FileState::Premigrated if self.target_state == TargetState::Migrated => {}
                    other => {
                        return Err(DmError::WrongFileState(format!(
                            "{} is {}",
                            file_name,
                            other.as_str()
                        )))
                    }
                }
                for repl_num in 0..pools.len() as i64 {
                    self.ctx.queue.insert_job(&Job {
                        operation: OpKind::Migration,
                        file_name: file_name.to_string(),
                        req_num: self.req_num,
                        target_state: self.target_state,
                        repl_num,
                        file_size,
                        tape_id: String::new(),
                        file_state: FileState::Resident,
                    })?;
                }
                Ok(())
            }
            FileOpKind::SelRecall | FileOpKind::TransRecall => {
                match cur_state {
                    FileState::Migrated => {}
                    FileState::Premigrated if self.target_state == TargetState::Resident => {}
                    other => {
                        return Err(DmError::WrongFileState(format!(
                            "{} is {}",
                            file_name,
                            other.as_str()
                        )))
                    }
                }
                let attrs = self.ctx.attrs.get(file_name).ok_or_else(|| {
                    DmError::AttrFormat(format!("{}: no migration attributes", file_name))
                })?;
                let tape_id = attrs.tape_ids.first().cloned().ok_or_else(|| {
                    DmError::AttrFormat(format!("{}: no tape copy recorded", file_name))
                })?;
                self.ctx.queue.insert_job(&Job {
                    operation: self.operation(),
                    file_name: file_name.to_string(),
                    req_num: self.req_num,
                    target_state: self.target_state,
                    repl_num: 0,
                    file_size,
                    tape_id,
                    file_state: cur_state,
                })?;
                Ok(())
            }
        }
    }

    /// Commit the request rows and wake the scheduler. Migration gets
    /// one row per pool and replica; recalls one row per involved tape.
    pub fn add_request(&self) -> DmResult<()> {
        match &self.kind {
            FileOpKind::Migration { pools } => {
                for (repl_num, pool) in pools.iter().enumerate() {
                    self.ctx.queue.insert_request(&Request {
                        operation: OpKind::Migration,
                        req_num: self.req_num,
                        target_state: self.target_state,
                        num_repl: pools.len() as i64,
                        repl_num: repl_num as i64,
                        pool: pool.clone(),
                        tape_id: String::new(),
                        drive_id: String::new(),
                        state: ReqState::New,
                    })?;
                }
            }
            FileOpKind::SelRecall | FileOpKind::TransRecall => {
                let tapes = self.ctx.queue.job_tapes(self.req_num)?;
                for (idx, tape_id) in tapes.iter().enumerate() {
                    self.ctx.queue.insert_request(&Request {
                        operation: self.operation(),
                        req_num: self.req_num,
                        target_state: self.target_state,
                        num_repl: 0,
                        repl_num: idx as i64,
                        pool: String::new(),
                        tape_id: tape_id.clone(),
                        drive_id: String::new(),
                        state: ReqState::New,
                    })?;
                }
            }
        }
        self.ctx.sched.notify_one();
        Ok(())
    }

    /// Current job counts and whether every row of the request reached
    /// its terminal state.
    pub fn query_result(&self) -> DmResult<(JobCounts, bool)> {
        let counts = self.ctx.queue.job_state_counts(self.req_num)?;
        let done = self.ctx.queue.request_done(self.req_num)?;
        Ok((counts, done))
    }
}
