use std::sync::Arc;

use log::{error, info};
use ltfsdm_lib::{DmResult, OpKind, ReqState, TargetState};
use req_queue::Request;

use crate::daemon::Ctx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeOpMode {
    Format,
    Check,
}

/// Queue a format or check of one pool cartridge. These arrive through
/// pool maintenance, not through the client message set.
pub fn add_request(ctx: &Ctx, pool: &str, tape_id: &str, mode: TapeOpMode) -> DmResult<i64> {
    let req_num = ctx.next_req_num();
    let op = match mode {
        TapeOpMode::Format => OpKind::Format,
        TapeOpMode::Check => OpKind::Check,
    };
    ctx.queue.insert_request(&Request {
        operation: op,
        req_num,
        target_state: TargetState::Resident,
        num_repl: 0,
        repl_num: 0,
        pool: pool.to_string(),
        tape_id: tape_id.to_string(),
        drive_id: String::new(),
        state: ReqState::New,
    })?;
    info!("request {}: {} of {}", req_num, op.as_str(), tape_id);
    ctx.sched.notify_one();
    Ok(req_num)
}

/// Execute a format or check once the scheduler has moved the cartridge
/// into a drive.
pub async fn exec_request(
    ctx: Arc<Ctx>,
    pool: String,
    drive_id: String,
    tape_id: String,
    req_num: i64,
    mode: TapeOpMode,
) {
    let result = match mode {
        TapeOpMode::Format => ctx.library.format(&drive_id, &tape_id).await,
        TapeOpMode::Check => ctx.library.check(&drive_id, &tape_id).await,
    };

    match result {
        Ok(()) => {
            if mode == TapeOpMode::Format {
                ctx.inv.refresh_after_format(&tape_id);
            }
            info!(
                "request {}: {:?} of {} (pool {}) done",
                req_num, mode, tape_id, pool
            );
        }
        Err(e) => {
            error!(
                "request {}: {:?} of {} (pool {}) failed ({}): {}",
                req_num,
                mode,
                tape_id,
                pool,
                e.code(),
                e
            );
        }
    }

    ctx.inv.release_resources(&drive_id, &tape_id);
    if let Err(e) = ctx.queue.update_request_state(req_num, ReqState::Completed) {
        error!("request {}: completing failed: {}", req_num, e);
    }
    ctx.sched.notify_one();
}
