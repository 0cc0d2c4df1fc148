use std::sync::Arc;

use log::{error, info, warn};
use ltfsdm_lib::{FileState, OpKind, TargetState};

use crate::daemon::Ctx;

/// Arguments of one dispatched migration replica.
#[derive(Debug, Clone)]
pub struct MigrationArgs {
    pub req_num: i64,
    pub repl_num: i64,
    pub num_repl: i64,
    pub target_state: TargetState,
    pub pool: String,
    pub drive_id: String,
    pub tape_id: String,
}

/// Copy the resident jobs of one replica to the bound tape. Between
/// files the worker checks the drive's pre-emption flag; a
/// higher-priority operation suspends the replica, which goes back to
/// the queue unbound and is rescheduled later.
pub async fn exec_request(ctx: Arc<Ctx>, args: MigrationArgs) {
    let jobs = match ctx.queue.resident_jobs(args.req_num, args.repl_num) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("request {}: reading jobs failed: {}", args.req_num, e);
            ctx.inv.release_resources(&args.drive_id, &args.tape_id);
            ctx.sched.notify_one();
            return;
        }
    };

    let mut suspended = false;
    let mut aborted = false;

    for job in jobs {
        if ctx.term.forced() {
            warn!(
                "request {}: abandoning {} on forced terminate",
                args.req_num, job.file_name
            );
            let _ = ctx.queue.update_job_state(
                args.req_num,
                args.repl_num,
                &job.file_name,
                FileState::Failed,
            );
            aborted = true;
            break;
        }

        if let Some(op) = ctx.inv.drive_to_unblock(&args.drive_id) {
            if op.priority() < OpKind::Migration.priority() {
                info!(
                    "request {}: suspending for {} on {}",
                    args.req_num,
                    op.as_str(),
                    args.drive_id
                );
                suspended = true;
                break;
            }
        }

        if let Err(e) = process_file(&ctx, &args, &job.file_name, job.file_size as u64).await {
            error!(
                "request {}: migrating {} failed ({}): {}",
                args.req_num,
                job.file_name,
                e.code(),
                e
            );
            let _ = ctx.queue.update_job_state(
                args.req_num,
                args.repl_num,
                &job.file_name,
                FileState::Failed,
            );
        }
    }

    // an aborted replica stays in progress; startup recovery will
    // reschedule whatever is still resident
    let result = if suspended {
        ctx.queue
            .suspend_migration_request(args.req_num, args.repl_num, &args.pool)
    } else if aborted {
        Ok(())
    } else {
        ctx.queue
            .complete_migration_request(args.req_num, args.repl_num, &args.pool)
    };
    if let Err(e) = result {
        error!("request {}: updating request row failed: {}", args.req_num, e);
    }

    ctx.inv.release_resources(&args.drive_id, &args.tape_id);
    ctx.sched.notify_one();
}

async fn process_file(
    ctx: &Ctx,
    args: &MigrationArgs,
    file_name: &str,
    file_size: u64,
) -> ltfsdm_lib::DmResult<()> {
    ctx.queue
        .update_job_state(args.req_num, args.repl_num, file_name, FileState::InMigration)?;
    ctx.queue
        .update_job_tape(args.req_num, args.repl_num, file_name, &args.tape_id)?;

    ctx.library
        .write_file(&args.drive_id, &args.tape_id, file_name, file_size)
        .await?;
    ctx.inv.consume_capacity(&args.tape_id, file_size);
    ctx.attrs.add_copy(file_name, file_size, &args.tape_id)?;

    ctx.queue
        .update_job_state(args.req_num, args.repl_num, file_name, FileState::Premigrated)?;

    let copies = ctx
        .attrs
        .get(file_name)
        .map(|a| a.tape_ids.len() as i64)
        .unwrap_or(0);
    if copies < args.num_repl {
        // remaining replicas will finish the file
        return Ok(());
    }

    match args.target_state {
        TargetState::Migrated => {
            ctx.queue
                .update_job_state(args.req_num, args.repl_num, file_name, FileState::Stubbing)?;
            ctx.attrs
                .set_state(file_name, file_size, FileState::Migrated)?;
            ctx.queue
                .update_job_state_all_replicas(args.req_num, file_name, FileState::Migrated)?;
        }
        _ => {
            ctx.attrs
                .set_state(file_name, file_size, FileState::Premigrated)?;
        }
    }
    Ok(())
}
