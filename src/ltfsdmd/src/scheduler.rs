use std::sync::Arc;

use log::{debug, error, info, warn};
use ltfsdm_lib::{OpKind, ReqState, TargetState};
use tape_inventory::{CartridgeState, Drive, InvState};

use crate::daemon::Ctx;
use crate::migration::{self, MigrationArgs};
use crate::recall;
use crate::tape_handler::{self, TapeOpMode};
use crate::tape_mover;

const MIB: u64 = 1024 * 1024;

/// Working copy of one queue row during a scheduling pass. `res_avail`
/// fills in the drive (and, for pool scheduling, the tape) when it
/// commits resources to the request.
struct SchedRow {
    op: OpKind,
    req_num: i64,
    target_state: TargetState,
    num_repl: i64,
    repl_num: i64,
    pool: String,
    tape_id: String,
    drive_id: String,
    min_file_size: u64,
    mount_target: OpKind,
}

pub struct Scheduler {
    ctx: Arc<Ctx>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Ctx>) -> Scheduler {
        Scheduler { ctx }
    }

    /// Main loop: wait for a wakeup (new request, finished tape move,
    /// completed request), then walk the new rows in arrival order and
    /// dispatch whatever the inventory can serve. On terminate, drain
    /// the workers and wake anything parked on a cartridge.
    pub async fn run(self) {
        loop {
            self.ctx.sched.notified().await;

            if self.ctx.term.terminate() {
                if !self.ctx.term.finish() {
                    break;
                }
                // finish-drain keeps scheduling until the queue is empty
                match self.ctx.queue.open_request_count() {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("reading queue during drain failed: {}", e);
                        break;
                    }
                }
            }

            self.schedule_pass();
        }

        info!("scheduler stopping, waiting for workers");
        self.ctx.worker_pool.wait_all().await;
        self.ctx.inv.notify_all_cartridges();
        info!("scheduler finished");
    }

    fn schedule_pass(&self) {
        let rows = match self.ctx.queue.new_requests() {
            Ok(rows) => rows,
            Err(e) => {
                error!("reading request queue failed: {}", e);
                return;
            }
        };

        for req in rows {
            let min_file_size = if req.operation == OpKind::Migration {
                match self
                    .ctx
                    .queue
                    .smallest_resident_job(req.req_num, req.repl_num)
                {
                    Ok(Some(size)) => size.max(0) as u64,
                    Ok(None) => 0,
                    Err(e) => {
                        error!("request {}: reading jobs failed: {}", req.req_num, e);
                        continue;
                    }
                }
            } else {
                0
            };

            let mount_target = match req.operation {
                OpKind::Format | OpKind::Check => OpKind::Move,
                _ => OpKind::Mount,
            };

            let mut row = SchedRow {
                op: req.operation,
                req_num: req.req_num,
                target_state: req.target_state,
                num_repl: req.num_repl,
                repl_num: req.repl_num,
                pool: req.pool,
                tape_id: req.tape_id,
                drive_id: req.drive_id,
                min_file_size,
                mount_target,
            };

            let avail = self.ctx.inv.with_state(|inv| self.res_avail(inv, &mut row));
            if !avail {
                continue;
            }

            debug!(
                "request {}: committed to drive {} tape {}",
                row.req_num, row.drive_id, row.tape_id
            );
            self.dispatch(row);
        }
    }

    fn res_avail(&self, inv: &mut InvState, row: &mut SchedRow) -> bool {
        if row.op.is_tape_move() {
            self.res_avail_tape_move(inv, row)
        } else if row.op == OpKind::Migration && row.tape_id.is_empty() {
            self.pool_res_avail(inv, row)
        } else {
            self.tape_res_avail(inv, row)
        }
    }

    /// A drive can serve this request if it is idle and either carries
    /// no pending move or the pending move belongs to this request.
    fn drive_is_usable(drive: &Drive, row: &SchedRow) -> bool {
        if drive.busy {
            return false;
        }
        match &drive.move_req {
            Some((req_num, pool)) => *req_num == row.req_num && pool == &row.pool,
            None => true,
        }
    }

    /// Resource check for a request bound to a specific tape (recalls,
    /// format, check, and migration replicas already assigned a tape).
    fn tape_res_avail(&self, inv: &mut InvState, row: &mut SchedRow) -> bool {
        let (cart_state, cart_slot, cart_requested) = match inv.cartridge(&row.tape_id) {
            Some(cart) => (cart.state, cart.slot, cart.requested),
            None => {
                warn!("request {}: tape {} not in inventory", row.req_num, row.tape_id);
                return false;
            }
        };

        match cart_state {
            CartridgeState::Moving => return false,
            CartridgeState::InUse => {
                // the tape is held by a lower-priority worker: ask the
                // holding drive to release it, once
                if cart_requested {
                    return false;
                }
                let holder = inv
                    .drives
                    .iter()
                    .position(|d| d.slot == cart_slot)
                    .filter(|&i| row.op.priority() < inv.drives[i].unblock_priority());
                if let Some(i) = holder {
                    inv.drives[i].to_unblock = Some(row.op);
                    debug!(
                        "request {}: asking {} to release {} for {}",
                        row.req_num,
                        inv.drives[i].id,
                        row.tape_id,
                        row.op.as_str()
                    );
                    if let Some(cart) = inv.cartridge_mut(&row.tape_id) {
                        cart.requested = true;
                    }
                }
                return false;
            }
            CartridgeState::Mounted => {
                let drive_id = inv
                    .drives
                    .iter()
                    .find(|d| d.slot == cart_slot && !d.busy)
                    .map(|d| d.id.clone());
                return match drive_id {
                    Some(drive_id) => {
                        row.drive_id = drive_id.clone();
                        if let Err(e) = inv.make_use(&drive_id, &row.tape_id) {
                            error!("request {}: claim failed: {}", row.req_num, e);
                            return false;
                        }
                        true
                    }
                    None => false,
                };
            }
            _ => {}
        }

        let drives: Vec<(String, u64)> =
            inv.drives.iter().map(|d| (d.id.clone(), d.slot)).collect();

        // a usable drive with nothing mounted at its slot
        for (drive_id, slot) in &drives {
            let Some(drive) = inv.drive(drive_id) else { continue };
            if !Self::drive_is_usable(drive, row) {
                continue;
            }
            let occupied = inv
                .cartridges
                .iter()
                .any(|c| c.slot == *slot && c.state == CartridgeState::Mounted);
            if !occupied && cart_state == CartridgeState::Unmounted {
                self.move_tape(inv, drive_id, row.tape_id.clone(), row.mount_target, row);
                return false;
            }
        }

        // a usable drive holding a mounted, unused cartridge
        for (drive_id, slot) in &drives {
            let Some(drive) = inv.drive(drive_id) else { continue };
            if !Self::drive_is_usable(drive, row) {
                continue;
            }
            let mounted = inv
                .cartridges
                .iter()
                .find(|c| c.slot == *slot && c.state == CartridgeState::Mounted)
                .map(|c| c.id.clone());
            if let Some(mounted_id) = mounted {
                self.move_tape(inv, drive_id, mounted_id, OpKind::Unmount, row);
                if let Some(cart) = inv.cartridge_mut(&row.tape_id) {
                    cart.requested = false;
                }
                return false;
            }
        }

        // a pre-emption for this cartridge is already outstanding
        if inv
            .cartridge(&row.tape_id)
            .map(|c| c.requested)
            .unwrap_or(false)
        {
            return false;
        }

        // ask a lower-priority holder to release its drive
        for i in 0..inv.drives.len() {
            if row.op.priority() < inv.drives[i].unblock_priority() {
                inv.drives[i].to_unblock = Some(row.op);
                debug!(
                    "request {}: asking {} to release for {}",
                    row.req_num,
                    inv.drives[i].id,
                    row.op.as_str()
                );
                if let Some(cart) = inv.cartridge_mut(&row.tape_id) {
                    cart.requested = true;
                }
                break;
            }
        }

        false
    }

    /// Resource check for a migration replica not yet bound to a tape:
    /// any pool cartridge with room for the smallest remaining file.
    fn pool_res_avail(&self, inv: &mut InvState, row: &mut SchedRow) -> bool {
        let Some(pool) = inv.pool(&row.pool) else {
            warn!("request {}: pool {} does not exist", row.req_num, row.pool);
            return false;
        };
        let pool_carts = pool.cartridges.clone();
        let mut unmounted_exists = false;

        for cartname in &pool_carts {
            let Some(cart) = inv.cartridge(cartname) else {
                warn!("tape {} of pool {} not in inventory", cartname, row.pool);
                continue;
            };
            match cart.state {
                CartridgeState::Mounted => {
                    // a requested cartridge is earmarked for a
                    // higher-priority operation
                    if cart.requested {
                        continue;
                    }
                    if cart.remaining_cap * MIB < row.min_file_size {
                        continue;
                    }
                    let slot = cart.slot;
                    let drive_id = inv
                        .drives
                        .iter()
                        .find(|d| d.slot == slot && !d.busy)
                        .map(|d| d.id.clone());
                    if let Some(drive_id) = drive_id {
                        row.tape_id = cartname.clone();
                        row.drive_id = drive_id.clone();
                        if let Err(e) = inv.make_use(&drive_id, cartname) {
                            error!("request {}: claim failed: {}", row.req_num, e);
                            continue;
                        }
                        return true;
                    }
                }
                CartridgeState::Unmounted => unmounted_exists = true,
                _ => {}
            }
        }

        if !unmounted_exists {
            return false;
        }

        let drives: Vec<(String, u64)> =
            inv.drives.iter().map(|d| (d.id.clone(), d.slot)).collect();

        // an empty usable drive to mount an eligible pool cartridge
        for (drive_id, slot) in &drives {
            let Some(drive) = inv.drive(drive_id) else { continue };
            if !Self::drive_is_usable(drive, row) {
                continue;
            }
            let occupied = inv
                .cartridges
                .iter()
                .any(|c| c.slot == *slot && c.state == CartridgeState::Mounted);
            if occupied {
                continue;
            }
            for cartname in &pool_carts {
                let eligible = inv
                    .cartridge(cartname)
                    .map(|c| {
                        c.state == CartridgeState::Unmounted
                            && c.remaining_cap * MIB >= row.min_file_size
                    })
                    .unwrap_or(false);
                if eligible {
                    self.move_tape(inv, drive_id, cartname.clone(), row.mount_target, row);
                    return false;
                }
            }
        }

        // TODO: clarify whether this check has to precede the mount scan
        if inv.request_exists(row.req_num, &row.pool) {
            return false;
        }

        // a usable drive holding a mounted cartridge to unmount
        for (drive_id, slot) in &drives {
            let Some(drive) = inv.drive(drive_id) else { continue };
            if !Self::drive_is_usable(drive, row) {
                continue;
            }
            let mounted = inv
                .cartridges
                .iter()
                .find(|c| c.slot == *slot && c.state == CartridgeState::Mounted)
                .map(|c| c.id.clone());
            if let Some(mounted_id) = mounted {
                self.move_tape(inv, drive_id, mounted_id, OpKind::Unmount, row);
                return false;
            }
        }

        false
    }

    /// Resource check for a queued mount, move, or unmount: the target
    /// drive must be idle, and for a mount it must not hold another
    /// mounted cartridge.
    fn res_avail_tape_move(&self, inv: &mut InvState, row: &mut SchedRow) -> bool {
        let Some(drive) = inv.drive(&row.drive_id) else {
            warn!("request {}: drive {} not in inventory", row.req_num, row.drive_id);
            return false;
        };
        if drive.busy {
            return false;
        }
        let drive_slot = drive.slot;

        if matches!(row.op, OpKind::Mount | OpKind::Move) {
            let occupied = inv
                .cartridges
                .iter()
                .any(|c| c.slot == drive_slot && c.state == CartridgeState::Mounted);
            if occupied {
                return false;
            }
        } else {
            let in_drive = inv
                .cartridge(&row.tape_id)
                .map(|c| c.slot == drive_slot && c.state == CartridgeState::Mounted)
                .unwrap_or(false);
            if !in_drive {
                return false;
            }
        }

        if let Err(e) = inv.make_use(&row.drive_id, &row.tape_id) {
            error!("request {}: claim failed: {}", row.req_num, e);
            return false;
        }
        true
    }

    /// Reserve a drive and enqueue the physical move as a request of
    /// its own. One pending move per request and pool at a time.
    fn move_tape(
        &self,
        inv: &mut InvState,
        drive_id: &str,
        tape_id: String,
        mover_op: OpKind,
        row: &SchedRow,
    ) {
        if row.op.is_tape_move() {
            return;
        }
        if inv.request_exists(row.req_num, &row.pool) {
            return;
        }

        let label = match mover_op {
            OpKind::Mount => format!("mnt.{}", tape_id),
            OpKind::Move => format!("mov.{}", tape_id),
            _ => format!("umn.{}", tape_id),
        };
        info!(
            "request {}: {} of {} on {}",
            row.req_num,
            mover_op.as_str(),
            tape_id,
            drive_id
        );

        if let Some(drive) = inv.drive_mut(drive_id) {
            drive.move_req = Some((row.req_num, row.pool.clone()));
        }

        let ctx = self.ctx.clone();
        let drive_id = drive_id.to_string();
        self.ctx.worker_pool.spawn(&label, async move {
            tape_mover::add_request(ctx, drive_id, tape_id, mover_op).await;
        });
    }

    /// Mark the row in progress and hand it to its worker.
    fn dispatch(&self, row: SchedRow) {
        let ctx = self.ctx.clone();
        match row.op {
            OpKind::Mount | OpKind::Move | OpKind::Unmount => {
                if let Err(e) = self
                    .ctx
                    .queue
                    .update_request_state(row.req_num, ReqState::InProgress)
                {
                    error!("request {}: binding failed: {}", row.req_num, e);
                    self.ctx.inv.release_resources(&row.drive_id, &row.tape_id);
                    return;
                }
                let tag = match row.op {
                    OpKind::Mount => "MNT",
                    OpKind::Move => "MOV",
                    _ => "UMN",
                };
                let label = format!("{}({})", tag, row.tape_id);
                self.ctx.worker_pool.spawn(&label, async move {
                    tape_mover::exec_request(ctx, row.drive_id, row.tape_id, row.req_num, row.op)
                        .await;
                });
            }
            OpKind::Format | OpKind::Check => {
                if let Err(e) = self
                    .ctx
                    .queue
                    .update_request_state(row.req_num, ReqState::InProgress)
                {
                    error!("request {}: binding failed: {}", row.req_num, e);
                    self.ctx.inv.release_resources(&row.drive_id, &row.tape_id);
                    return;
                }
                let mode = if row.op == OpKind::Format {
                    TapeOpMode::Format
                } else {
                    TapeOpMode::Check
                };
                let tag = if mode == TapeOpMode::Format { "FMT" } else { "CHK" };
                let label = format!("{}({})", tag, row.tape_id);
                self.ctx.worker_pool.spawn(&label, async move {
                    tape_handler::exec_request(
                        ctx,
                        row.pool,
                        row.drive_id,
                        row.tape_id,
                        row.req_num,
                        mode,
                    )
                    .await;
                });
            }
            OpKind::Migration => {
                if let Err(e) = self.ctx.queue.bind_migration_request(
                    row.req_num,
                    row.repl_num,
                    &row.pool,
                    &row.tape_id,
                    &row.drive_id,
                ) {
                    error!("request {}: binding failed: {}", row.req_num, e);
                    self.ctx.inv.release_resources(&row.drive_id, &row.tape_id);
                    return;
                }
                let label = format!("M({},{},{})", row.req_num, row.repl_num, row.pool);
                let args = MigrationArgs {
                    req_num: row.req_num,
                    repl_num: row.repl_num,
                    num_repl: row.num_repl,
                    target_state: row.target_state,
                    pool: row.pool,
                    drive_id: row.drive_id,
                    tape_id: row.tape_id,
                };
                self.ctx.worker_pool.spawn(&label, async move {
                    migration::exec_request(ctx, args).await;
                });
            }
            OpKind::SelRecall => {
                if let Err(e) =
                    self.ctx
                        .queue
                        .bind_recall_request(row.req_num, &row.tape_id, &row.drive_id)
                {
                    error!("request {}: binding failed: {}", row.req_num, e);
                    self.ctx.inv.release_resources(&row.drive_id, &row.tape_id);
                    return;
                }
                let label = format!("SR({})", row.req_num);
                self.ctx.worker_pool.spawn(&label, async move {
                    recall::exec_sel_request(
                        ctx,
                        row.req_num,
                        row.target_state,
                        row.drive_id,
                        row.tape_id,
                    )
                    .await;
                });
            }
            OpKind::TraRecall => {
                if let Err(e) =
                    self.ctx
                        .queue
                        .bind_recall_request(row.req_num, &row.tape_id, &row.drive_id)
                {
                    error!("request {}: binding failed: {}", row.req_num, e);
                    self.ctx.inv.release_resources(&row.drive_id, &row.tape_id);
                    return;
                }
                let label = format!("TR({})", row.req_num);
                self.ctx.worker_pool.spawn(&label, async move {
                    recall::exec_tra_request(ctx, row.req_num, row.drive_id, row.tape_id).await;
                });
            }
        }
    }
}
