use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use ltfsdm_lib::{codes, DmResult, FileState, TargetState};
use req_queue::Job;
use tokio::sync::{mpsc, oneshot};

use crate::daemon::Ctx;
use crate::fileops::FileOperation;

/// Window a transparent-recall worker keeps the tape claimed after its
/// job list ran dry, picking up upcalls that arrive back to back.
const BATCH_WINDOW: Duration = Duration::from_millis(300);

/// A file-system upcall asking for a file's data. `done` receives the
/// response code once the file is back on disk.
pub struct RecallEvent {
    pub file_name: String,
    pub done: Option<oneshot::Sender<i32>>,
}

/// Copy the jobs of one selective-recall request back from a tape.
pub async fn exec_sel_request(
    ctx: Arc<Ctx>,
    req_num: i64,
    target_state: TargetState,
    drive_id: String,
    tape_id: String,
) {
    let jobs = match ctx.queue.recall_jobs(req_num, &tape_id) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("request {}: reading jobs failed: {}", req_num, e);
            Vec::new()
        }
    };

    for job in jobs {
        if ctx.term.forced() {
            warn!(
                "request {}: abandoning {} on forced terminate",
                req_num, job.file_name
            );
            let _ =
                ctx.queue
                    .update_job_state(req_num, job.repl_num, &job.file_name, FileState::Failed);
            abort_recall(&ctx, &drive_id, &tape_id);
            return;
        }
        recall_file(&ctx, req_num, target_state, &drive_id, &tape_id, &job).await;
    }

    finish_recall(&ctx, req_num, &drive_id, &tape_id).await;
}

/// Transparent recall: drain the job list, then keep the tape for a
/// short window in case more upcalls for it arrive. New jobs appended
/// by the event loop wake this worker through the cartridge condition.
pub async fn exec_tra_request(ctx: Arc<Ctx>, req_num: i64, drive_id: String, tape_id: String) {
    let notify = ctx.inv.cartridge_notify(&tape_id);
    let mut ran_dry = false;

    loop {
        let jobs = match ctx.queue.recall_jobs(req_num, &tape_id) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("request {}: reading jobs failed: {}", req_num, e);
                break;
            }
        };

        if jobs.is_empty() {
            // wait one window, then re-check once: an upcall may have
            // inserted a job between the query and the wait
            if ctx.term.terminate() || ran_dry {
                break;
            }
            let Some(notify) = notify.as_ref() else { break };
            ran_dry = true;
            let _ = tokio::time::timeout(BATCH_WINDOW, notify.notified()).await;
            debug!("request {}: re-checking for recall jobs", req_num);
            continue;
        }
        ran_dry = false;

        for job in jobs {
            if ctx.term.forced() {
                let _ = ctx.queue.update_job_state(
                    req_num,
                    job.repl_num,
                    &job.file_name,
                    FileState::Failed,
                );
                ctx.answer_recall_waiter(req_num, &job.file_name, codes::TERMINATING);
                abort_recall(&ctx, &drive_id, &tape_id);
                return;
            }
            let code = recall_file(
                &ctx,
                req_num,
                TargetState::Resident,
                &drive_id,
                &tape_id,
                &job,
            )
            .await;
            ctx.answer_recall_waiter(req_num, &job.file_name, code);
        }
    }

    finish_recall(&ctx, req_num, &drive_id, &tape_id).await;
}

async fn recall_file(
    ctx: &Ctx,
    req_num: i64,
    target_state: TargetState,
    drive_id: &str,
    tape_id: &str,
    job: &Job,
) -> i32 {
    if let Err(e) =
        ctx.queue
            .update_job_state(req_num, job.repl_num, &job.file_name, FileState::InRecall)
    {
        error!("request {}: updating {} failed: {}", req_num, job.file_name, e);
        return codes::GENERAL_ERROR;
    }

    match ctx
        .library
        .read_file(drive_id, tape_id, &job.file_name, job.file_size as u64)
        .await
    {
        Ok(()) => {
            let final_state = match target_state {
                TargetState::Premigrated => FileState::Premigrated,
                _ => FileState::Resident,
            };
            let _ = ctx
                .queue
                .update_job_state(req_num, job.repl_num, &job.file_name, final_state);
            if let Err(e) = update_attrs(ctx, &job.file_name, job.file_size as u64, final_state) {
                error!("request {}: attributes of {}: {}", req_num, job.file_name, e);
            }
            codes::OK
        }
        Err(e) => {
            error!(
                "request {}: recalling {} failed ({}): {}",
                req_num,
                job.file_name,
                e.code(),
                e
            );
            let _ = ctx
                .queue
                .update_job_state(req_num, job.repl_num, &job.file_name, FileState::Failed);
            e.code()
        }
    }
}

fn update_attrs(ctx: &Ctx, file_name: &str, file_size: u64, state: FileState) -> DmResult<()> {
    ctx.attrs.set_state(file_name, file_size, state)?;
    if state == FileState::Resident {
        ctx.attrs.clear_copies(file_name)?;
    }
    Ok(())
}

async fn finish_recall(ctx: &Ctx, req_num: i64, drive_id: &str, tape_id: &str) {
    if let Err(e) = ctx.queue.complete_recall_request(req_num, tape_id) {
        error!("request {}: completing failed: {}", req_num, e);
    }
    ctx.inv.release_resources(drive_id, tape_id);
    info!("request {}: recall from {} finished", req_num, tape_id);
    ctx.sched.notify_one();
}

/// Forced terminate: the row stays in progress for startup recovery.
fn abort_recall(ctx: &Ctx, drive_id: &str, tape_id: &str) {
    ctx.inv.release_resources(drive_id, tape_id);
    ctx.sched.notify_one();
}

/// Consumes file-system upcalls. Events for a tape with an open
/// transparent-recall request join it; otherwise a new request is
/// created. The responder is parked until the worker finishes the file.
pub async fn event_loop(ctx: Arc<Ctx>, mut rx: mpsc::Receiver<RecallEvent>) {
    while let Some(event) = rx.recv().await {
        if ctx.term.terminate() {
            if let Some(done) = event.done {
                let _ = done.send(codes::TERMINATING);
            }
            continue;
        }
        if let Err(e) = handle_event(&ctx, event) {
            error!("transparent recall event failed: {}", e);
        }
    }
}

fn handle_event(ctx: &Arc<Ctx>, event: RecallEvent) -> DmResult<()> {
    let tape_id = match ctx.attrs.get(&event.file_name) {
        Some(a) if matches!(a.state, FileState::Migrated | FileState::Premigrated) => {
            match a.tape_ids.first() {
                Some(tape) => tape.clone(),
                None => {
                    if let Some(done) = event.done {
                        let _ = done.send(codes::ATTR_FORMAT);
                    }
                    return Ok(());
                }
            }
        }
        _ => {
            // nothing on tape, the data is already resident
            if let Some(done) = event.done {
                let _ = done.send(codes::OK);
            }
            return Ok(());
        }
    };

    let existing = ctx.queue.active_recall_request(&tape_id)?;
    let req_num = match existing {
        Some(req_num) => req_num,
        None => ctx.next_req_num(),
    };

    let fop = FileOperation::trans_recall(ctx.clone(), req_num);
    let inserted = match fop.add_job(&event.file_name) {
        Ok(()) => true,
        Err(e) if e.is_duplicate_job() => false,
        Err(e) => {
            if let Some(done) = event.done {
                let _ = done.send(e.code());
            }
            return Err(e);
        }
    };

    if let Some(done) = event.done {
        let mut waiters = ctx.recall_waiters.lock().unwrap();
        waiters.insert((req_num, event.file_name.clone()), done);
    }

    if existing.is_none() {
        fop.add_request()?;
        info!(
            "request {}: transparent recall of {} from {}",
            req_num, event.file_name, tape_id
        );
    } else if inserted {
        debug!(
            "request {}: {} joined recall of {}",
            req_num, event.file_name, tape_id
        );
        // wake the worker if it is already draining this tape
        if let Some(notify) = ctx.inv.cartridge_notify(&tape_id) {
            notify.notify_waiters();
        }
        // the worker may have completed the request between the lookup
        // and the insert; reopen it so the job is not stranded
        if ctx.queue.active_recall_request(&tape_id)?.is_none() {
            ctx.queue.reopen_recall_request(req_num, &tape_id)?;
        }
        ctx.sched.notify_one();
    }
    Ok(())
}
