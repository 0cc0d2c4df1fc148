use std::sync::Arc;

use log::{error, info};
use ltfsdm_lib::{OpKind, ReqState, TargetState};
use req_queue::Request;
use tape_inventory::CartridgeState;

use crate::daemon::Ctx;

/// Insert the queue row for a mount, move, or unmount initiated by the
/// scheduler. The move runs as a request of its own so that it competes
/// for the drive through the normal scheduling path.
pub async fn add_request(ctx: Arc<Ctx>, drive_id: String, tape_id: String, op: OpKind) {
    let req_num = ctx.next_req_num();
    let req = Request {
        operation: op,
        req_num,
        target_state: TargetState::Resident,
        num_repl: 0,
        repl_num: 0,
        pool: String::new(),
        tape_id: tape_id.clone(),
        drive_id,
        state: ReqState::New,
    };
    let drive_id = req.drive_id.clone();
    if let Err(e) = ctx.queue.insert_request(&req) {
        error!("queueing {} of {} failed: {}", op.as_str(), tape_id, e);
        // give the reserved drive back
        ctx.inv.with_state(|inv| {
            if let Some(drive) = inv.drive_mut(&drive_id) {
                drive.move_req = None;
            }
        });
        return;
    }
    info!("request {}: {} of {}", req_num, op.as_str(), tape_id);
    ctx.sched.notify_one();
}

/// Execute one physical mount, move, or unmount against a drive.
pub async fn exec_request(
    ctx: Arc<Ctx>,
    drive_id: String,
    tape_id: String,
    req_num: i64,
    op: OpKind,
) {
    let prior = match op {
        OpKind::Unmount => CartridgeState::Mounted,
        _ => CartridgeState::Unmounted,
    };
    ctx.inv.set_cartridge_state(&tape_id, CartridgeState::Moving);

    let result = match op {
        OpKind::Mount => ctx.library.mount(&drive_id, &tape_id).await,
        OpKind::Move => ctx.library.move_to_drive(&drive_id, &tape_id).await,
        OpKind::Unmount => ctx.library.unmount(&drive_id, &tape_id).await,
        other => {
            error!("request {}: {} is not a tape move", req_num, other.as_str());
            return;
        }
    };

    match result {
        Ok(()) => {
            if op == OpKind::Unmount {
                ctx.inv.finish_unmount(&drive_id, &tape_id);
            } else {
                ctx.inv.finish_mount(&drive_id, &tape_id);
            }
            info!(
                "request {}: {} of {} on {} done",
                req_num,
                op.as_str(),
                tape_id,
                drive_id
            );
        }
        Err(e) => {
            error!(
                "request {}: {} of {} on {} failed ({}): {}",
                req_num,
                op.as_str(),
                tape_id,
                drive_id,
                e.code(),
                e
            );
            ctx.inv.fail_move(&drive_id, &tape_id, prior);
        }
    }

    if let Err(e) = ctx
        .queue
        .update_request_state(req_num, ReqState::Completed)
    {
        error!("request {}: completing failed: {}", req_num, e);
    }
    ctx.sched.notify_one();
}
