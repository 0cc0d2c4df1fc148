use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use ltfsdm_lib::{
    codes, unix_timestamp, AddRespCode, DmConnection, DmResult, Message, TargetState, UNSET,
};
use req_queue::ManagedFs;
use tokio::net::UnixStream;

use crate::daemon::Ctx;
use crate::fileops::FileOperation;

/// User-visible message id logged when a session names the same file
/// twice within one request.
const MSG_DUPLICATE_FILE: &str = "LTFSDMS0019E";

/// Per-connection state machine. ReqNumber messages allocate request
/// numbers in a loop; the first data message releases the termination
/// lock, gets handled, and the session closes. A wrong key closes the
/// session without an answer.
pub async fn handle_connection(ctx: Arc<Ctx>, stream: UnixStream) {
    let mut conn = DmConnection::new(stream);
    let mut term_guard = Some(ctx.term_lock.lock().await);
    let mut local_req_num = UNSET;

    loop {
        let msg = match conn.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("session ended: {}", e);
                return;
            }
        };

        let Some(key_sent) = msg.key() else {
            error!("received a response message, closing session");
            return;
        };
        if key_sent != ctx.key {
            warn!("message with wrong key {}", key_sent);
            return;
        }

        match msg {
            Message::ReqNumber { .. } => {
                local_req_num = ctx.next_req_num();
                debug!("assigned request number {}", local_req_num);
                if send(&mut conn, Message::ReqNumberResp {
                    success: true,
                    req_num: local_req_num,
                })
                .await
                .is_err()
                {
                    return;
                }
            }
            Message::StopRequest { forced, finish, .. } => {
                stop_message(&ctx, &mut conn, forced, finish, term_guard.take()).await;
                return;
            }
            other => {
                // release before any long blocking work
                term_guard.take();
                dispatch_message(&ctx, &mut conn, local_req_num, other).await;
                return;
            }
        }
    }
}

async fn send(conn: &mut DmConnection, msg: Message) -> DmResult<()> {
    conn.send(&msg).await.map_err(|e| {
        error!("sending response failed: {}", e);
        e
    })
}

async fn dispatch_message(ctx: &Arc<Ctx>, conn: &mut DmConnection, _local_req_num: i64, msg: Message) {
    match msg {
        Message::MigRequest {
            req_num,
            pools,
            target_state,
            ..
        } => migration_message(ctx, conn, req_num, pools, target_state).await,
        Message::SelRecRequest {
            req_num,
            target_state,
            ..
        } => sel_recall_message(ctx, conn, req_num, target_state).await,
        Message::StatusRequest { .. } => {
            let _ = send(conn, Message::StatusResp {
                success: true,
                pid: std::process::id(),
            })
            .await;
        }
        Message::AddRequest {
            managed_fs,
            mount_point,
            fs_name,
            ..
        } => add_message(ctx, conn, managed_fs, mount_point, fs_name).await,
        Message::InfoRequestsRequest { req_num, .. } => {
            info_requests_message(ctx, conn, req_num).await
        }
        Message::InfoJobsRequest { req_num, .. } => info_jobs_message(ctx, conn, req_num).await,
        Message::InfoDrivesRequest { .. } => info_drives_message(ctx, conn).await,
        Message::InfoTapesRequest { .. } => info_tapes_message(ctx, conn).await,
        Message::InfoPoolsRequest { .. } => info_pools_message(ctx, conn).await,
        Message::PoolCreateRequest { pool, .. } => {
            let response = match ctx.inv.pool_create(&pool) {
                Ok(()) => codes::OK,
                Err(e) => {
                    warn!("creating pool {} failed: {}", pool, e);
                    e.code()
                }
            };
            let _ = send(conn, Message::PoolResp {
                tape_id: String::new(),
                response,
            })
            .await;
        }
        Message::PoolDeleteRequest { pool, .. } => {
            let response = match ctx.inv.pool_delete(&pool) {
                Ok(()) => codes::OK,
                Err(e) => {
                    warn!("deleting pool {} failed: {}", pool, e);
                    e.code()
                }
            };
            let _ = send(conn, Message::PoolResp {
                tape_id: String::new(),
                response,
            })
            .await;
        }
        Message::PoolAddRequest { pool, tapes, .. } => {
            for tape_id in tapes {
                let response = match ctx.inv.pool_add(&pool, &tape_id) {
                    Ok(()) => {
                        info!("tape {} added to pool {}", tape_id, pool);
                        codes::OK
                    }
                    Err(e) => {
                        warn!("adding {} to pool {} failed: {}", tape_id, pool, e);
                        e.code()
                    }
                };
                if send(conn, Message::PoolResp { tape_id, response }).await.is_err() {
                    return;
                }
            }
        }
        Message::PoolRemoveRequest { pool, tapes, .. } => {
            for tape_id in tapes {
                let response = match ctx.inv.pool_remove(&pool, &tape_id) {
                    Ok(()) => {
                        info!("tape {} removed from pool {}", tape_id, pool);
                        codes::OK
                    }
                    Err(e) => {
                        warn!("removing {} from pool {} failed: {}", tape_id, pool, e);
                        e.code()
                    }
                };
                if send(conn, Message::PoolResp { tape_id, response }).await.is_err() {
                    return;
                }
            }
        }
        Message::RetrieveRequest { .. } => {
            let error = match ctx.inv.inventorize().await {
                Ok(()) => {
                    let tapes: Vec<req_queue::TapeRecord> = ctx
                        .inv
                        .cartridges()
                        .iter()
                        .map(|c| req_queue::TapeRecord {
                            tape_id: c.id.clone(),
                            slot: c.slot,
                            total_cap: c.total_cap,
                            remaining_cap: c.remaining_cap,
                        })
                        .collect();
                    if let Err(e) = ctx.queue.record_tapes(&tapes) {
                        warn!("recording tape list failed: {}", e);
                    }
                    codes::OK
                }
                Err(e) => {
                    error!("inventorize failed: {}", e);
                    e.code()
                }
            };
            let _ = send(conn, Message::RetrieveResp { error }).await;
        }
        other => {
            error!("unknown command: {:?}", other);
        }
    }
}

async fn migration_message(
    ctx: &Arc<Ctx>,
    conn: &mut DmConnection,
    req_num: i64,
    pools_arg: String,
    target_state: TargetState,
) {
    let mut error = codes::OK;
    let mut pools: Vec<String> = Vec::new();

    if ctx.term.terminate() {
        error = codes::TERMINATING;
    } else {
        // duplicates collapse; replicas follow the sorted pool order
        let set: BTreeSet<String> = pools_arg
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let all_exist = ctx
            .inv
            .with_state(|inv| set.iter().all(|p| inv.pool(p).is_some()));
        if !all_exist {
            error = codes::NOT_ALL_POOLS_EXIST;
        } else if set.is_empty() || set.len() > 3 {
            error = codes::WRONG_POOLNUM;
        } else {
            pools = set.into_iter().collect();
        }
    }

    if send(conn, Message::MigRequestResp { error, req_num })
        .await
        .is_err()
        || error != codes::OK
    {
        return;
    }

    let fop = FileOperation::migration(ctx.clone(), req_num, target_state, pools);
    if !get_objects(ctx, conn, &fop).await {
        return;
    }
    if let Err(e) = fop.add_request() {
        error!("request {}: committing failed: {}", req_num, e);
        return;
    }
    req_status_message(ctx, conn, &fop).await;
}

async fn sel_recall_message(
    ctx: &Arc<Ctx>,
    conn: &mut DmConnection,
    req_num: i64,
    target_state: TargetState,
) {
    let error = if ctx.term.terminate() {
        codes::TERMINATING
    } else {
        codes::OK
    };

    if send(conn, Message::SelRecRequestResp { error, req_num })
        .await
        .is_err()
        || error != codes::OK
    {
        return;
    }

    let fop = FileOperation::sel_recall(ctx.clone(), req_num, target_state);
    if !get_objects(ctx, conn, &fop).await {
        return;
    }
    if let Err(e) = fop.add_request() {
        error!("request {}: committing failed: {}", req_num, e);
        return;
    }
    req_status_message(ctx, conn, &fop).await;
}

/// Stream file names from the client until an empty name. Per-file
/// errors are logged and do not abort the enumeration.
async fn get_objects(ctx: &Arc<Ctx>, conn: &mut DmConnection, fop: &FileOperation) -> bool {
    loop {
        if ctx.term.forced() {
            return false;
        }
        let msg = match conn.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                error!("receiving objects failed: {}", e);
                return false;
            }
        };
        let Message::SendObjects { file_names } = msg else {
            error!("expected object list");
            return false;
        };

        let mut finished = false;
        for file_name in &file_names {
            if ctx.term.terminate() {
                return false;
            }
            if file_name.is_empty() {
                finished = true;
                break;
            }
            match fop.add_job(file_name) {
                Ok(()) => {}
                Err(e) if e.is_duplicate_job() => {
                    warn!("{}: {} already scheduled in this request", MSG_DUPLICATE_FILE, file_name)
                }
                Err(e) => warn!("adding job for {} failed ({}): {}", file_name, e.code(), e),
            }
        }

        if send(conn, Message::SendObjectsResp {
            success: true,
            req_num: fop.req_num(),
        })
        .await
        .is_err()
        {
            return false;
        }
        if finished {
            return true;
        }
    }
}

/// Answer status polls until every row of the request completed.
async fn req_status_message(ctx: &Arc<Ctx>, conn: &mut DmConnection, fop: &FileOperation) {
    loop {
        let msg = match conn.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("status stream ended: {}", e);
                return;
            }
        };
        let Message::ReqStatusRequest { key, req_num } = msg else {
            error!("expected status request");
            return;
        };
        if key != ctx.key {
            warn!("status request with wrong key {}", key);
            return;
        }

        let (counts, done) = match fop.query_result() {
            Ok(result) => result,
            Err(e) => {
                error!("request {}: status query failed: {}", req_num, e);
                return;
            }
        };
        if send(conn, Message::ReqStatusResp {
            success: true,
            req_num,
            resident: counts.resident,
            premigrated: counts.premigrated,
            migrated: counts.migrated,
            failed: counts.failed,
            done,
        })
        .await
        .is_err()
            || done
        {
            return;
        }
    }
}

async fn add_message(
    ctx: &Arc<Ctx>,
    conn: &mut DmConnection,
    managed_fs: String,
    mount_point: String,
    fs_name: String,
) {
    let response = match std::fs::metadata(&managed_fs) {
        Ok(meta) if meta.is_dir() => {
            let fs = ManagedFs {
                fs_path: managed_fs.clone(),
                mount_point,
                fs_name,
                added_at: unix_timestamp(),
            };
            match ctx.queue.register_fs(&fs) {
                Ok(true) => {
                    info!("managing file system {}", managed_fs);
                    AddRespCode::Success
                }
                Ok(false) => {
                    warn!("file system {} already managed", managed_fs);
                    AddRespCode::AlreadyAdded
                }
                Err(e) => {
                    error!("adding file system {} failed: {}", managed_fs, e);
                    AddRespCode::Failed
                }
            }
        }
        _ => {
            error!(
                "file system check for {} failed ({})",
                managed_fs,
                codes::FS_CHECK_ERROR
            );
            AddRespCode::Failed
        }
    };
    let _ = send(conn, Message::AddResp { response }).await;
}

async fn info_requests_message(ctx: &Arc<Ctx>, conn: &mut DmConnection, req_num: i64) {
    let filter = if req_num == UNSET { None } else { Some(req_num) };
    let rows = match ctx.queue.requests(filter) {
        Ok(rows) => rows,
        Err(e) => {
            error!("reading request queue failed: {}", e);
            Vec::new()
        }
    };
    for row in rows {
        if send(conn, Message::InfoRequestsResp {
            operation: row.operation.as_str().to_string(),
            req_num: row.req_num,
            tape_id: row.tape_id,
            target_state: row.target_state.as_str().to_string(),
            state: row.state.as_str().to_string(),
        })
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = send(conn, Message::info_requests_sentinel()).await;
}

async fn info_jobs_message(ctx: &Arc<Ctx>, conn: &mut DmConnection, req_num: i64) {
    let filter = if req_num == UNSET { None } else { Some(req_num) };
    let rows = match ctx.queue.jobs(filter) {
        Ok(rows) => rows,
        Err(e) => {
            error!("reading job queue failed: {}", e);
            Vec::new()
        }
    };
    for row in rows {
        if send(conn, Message::InfoJobsResp {
            operation: row.operation.as_str().to_string(),
            file_name: row.file_name,
            req_num: row.req_num,
            repl_num: row.repl_num,
            file_size: row.file_size,
            tape_id: row.tape_id,
            state: row.file_state.as_str().to_string(),
        })
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = send(conn, Message::info_jobs_sentinel()).await;
}

async fn info_drives_message(ctx: &Arc<Ctx>, conn: &mut DmConnection) {
    for drive in ctx.inv.drives() {
        let status = if drive.busy { "in use" } else { "free" };
        if send(conn, Message::InfoDrivesResp {
            id: drive.id,
            slot: drive.slot as i64,
            status: status.to_string(),
            busy: drive.busy,
        })
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = send(conn, Message::info_drives_sentinel()).await;
}

async fn info_tapes_message(ctx: &Arc<Ctx>, conn: &mut DmConnection) {
    for cart in ctx.inv.cartridges() {
        if send(conn, Message::InfoTapesResp {
            id: cart.id,
            slot: cart.slot as i64,
            total_cap: cart.total_cap as i64,
            remaining_cap: cart.remaining_cap as i64,
            status: cart.status,
            state: cart.state.as_str().to_string(),
            pool: cart.pool,
        })
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = send(conn, Message::info_tapes_sentinel()).await;
}

async fn info_pools_message(ctx: &Arc<Ctx>, conn: &mut DmConnection) {
    let pools = ctx.inv.pools();
    let cartridges = ctx.inv.cartridges();
    for pool in pools {
        let mut total: i64 = 0;
        let mut free: i64 = 0;
        // unref capacity is reserved for future accounting
        let unref: i64 = 0;
        for tape_id in &pool.cartridges {
            if let Some(cart) = cartridges.iter().find(|c| &c.id == tape_id) {
                total += cart.total_cap as i64;
                free += cart.remaining_cap as i64;
            }
        }
        if send(conn, Message::InfoPoolsResp {
            name: pool.name,
            total,
            free,
            unref,
            num_tapes: pool.cartridges.len() as i64,
        })
        .await
        .is_err()
        {
            return;
        }
    }
    let _ = send(conn, Message::info_pools_sentinel()).await;
}

/// Stop: raise the termination flags, then answer polls with
/// success=false until the queue allows the server to go down, and
/// finally wake the scheduler and the accept loop.
async fn stop_message(
    ctx: &Arc<Ctx>,
    conn: &mut DmConnection,
    forced: bool,
    finish: bool,
    term_guard: Option<tokio::sync::MutexGuard<'_, ()>>,
) {
    info!(
        "stop request received (forced={}, finish={})",
        forced, finish
    );
    ctx.term.set_terminate();
    if forced {
        ctx.term.set_forced();
    }
    if finish {
        ctx.term.set_finish();
    }
    drop(term_guard);
    ctx.sched.notify_one();

    loop {
        let open_requests = if ctx.term.forced() {
            0
        } else if ctx.term.finish() {
            ctx.queue.open_request_count().unwrap_or(0)
        } else {
            ctx.queue.in_progress_count().unwrap_or(0)
        };

        if send(conn, Message::StopResp {
            success: open_requests == 0,
        })
        .await
        .is_err()
        {
            break;
        }
        if open_requests == 0 {
            break;
        }

        // the client polls once per second
        match conn.recv().await {
            Ok(Message::StopRequest { key, .. }) if key == ctx.key => {}
            Ok(_) | Err(_) => break,
        }
    }

    ctx.sched.notify_one();
    ctx.shutdown.notify_one();
}
