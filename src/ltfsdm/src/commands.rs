use std::path::Path;
use std::time::Duration;

use fs2::FileExt;
use ltfsdm_lib::{
    codes, describe_code, read_key, AddRespCode, AttrStore, DmConnection, DmError, DmResult,
    Message, ServerConfig, TargetState, UNSET,
};
use req_queue::QueueStore;

/// Files are streamed to the backend in batches of this size.
const OBJECT_BATCH: usize = 128;

struct Session {
    conn: DmConnection,
    key: i64,
    req_num: i64,
}

/// Connect, authenticate, and obtain a request number.
async fn connect(config: &ServerConfig) -> DmResult<Session> {
    let key = read_key(&config.key_file_path)?;
    let mut conn = DmConnection::connect(&config.socket_path).await?;
    conn.send(&Message::ReqNumber { key }).await?;
    match conn.recv().await? {
        Message::ReqNumberResp {
            success: true,
            req_num,
        } => Ok(Session { conn, key, req_num }),
        other => Err(DmError::Comm(format!("unexpected answer: {:?}", other))),
    }
}

fn report(e: &DmError) -> i32 {
    eprintln!("{}", e);
    let code = e.code();
    if code == codes::OK {
        codes::GENERAL_ERROR
    } else {
        code
    }
}

fn report_code(code: i32) -> i32 {
    eprintln!("{}", describe_code(code));
    code
}

pub async fn status(config: &ServerConfig) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(_) => {
            println!("the backend is not running");
            return codes::COMM_ERROR;
        }
    };
    let key = session.key;
    if let Err(e) = session.conn.send(&Message::StatusRequest { key }).await {
        return report(&e);
    }
    match session.conn.recv().await {
        Ok(Message::StatusResp { success: true, pid }) => {
            println!("the backend is running (pid {})", pid);
            codes::OK
        }
        Ok(_) => report_code(codes::COMM_ERROR),
        Err(e) => report(&e),
    }
}

pub async fn start(config: &ServerConfig, config_path: &Path) -> i32 {
    if connect(config).await.is_ok() {
        println!("the backend is already running");
        return codes::OK;
    }

    let spawned = std::process::Command::new("ltfsdmd")
        .arg("-c")
        .arg(config_path)
        .spawn();
    if let Err(e) = spawned {
        eprintln!("starting ltfsdmd failed: {}", e);
        return codes::GENERAL_ERROR;
    }

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if connect(config).await.is_ok() {
            println!("the backend has been started");
            return codes::OK;
        }
    }
    eprintln!("the backend did not come up");
    codes::COMM_ERROR
}

/// Poll the backend until it confirms the stop, then wait for the lock
/// file to become acquirable, which means the process is gone.
pub async fn stop(config: &ServerConfig, forced: bool, finish: bool) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    println!("the backend is terminating");

    loop {
        let msg = Message::StopRequest {
            key: session.key,
            req_num: session.req_num,
            forced,
            finish,
        };
        if let Err(e) = session.conn.send(&msg).await {
            return report(&e);
        }
        match session.conn.recv().await {
            Ok(Message::StopResp { success: true }) => break,
            Ok(Message::StopResp { success: false }) => {
                println!("waiting for in-progress requests");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }

    let lock_file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&config.lock_file_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("opening {} failed: {}", config.lock_file_path.display(), e);
            return codes::GENERAL_ERROR;
        }
    };
    while lock_file.try_lock_exclusive().is_err() {
        println!("waiting for the server to terminate");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let _ = FileExt::unlock(&lock_file);
    println!("the backend has terminated");
    codes::OK
}

pub async fn add(config: &ServerConfig, fs: &Path) -> i32 {
    let managed_fs = match fs.canonicalize() {
        Ok(path) => path.display().to_string(),
        Err(e) => {
            eprintln!("{}: {}", fs.display(), e);
            return codes::FS_CHECK_ERROR;
        }
    };
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let msg = Message::AddRequest {
        key: session.key,
        managed_fs: managed_fs.clone(),
        mount_point: managed_fs.clone(),
        fs_name: String::new(),
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    match session.conn.recv().await {
        Ok(Message::AddResp { response }) => match response {
            AddRespCode::Success => {
                println!("{} is now managed", managed_fs);
                codes::OK
            }
            AddRespCode::AlreadyAdded => {
                println!("{} is already managed", managed_fs);
                codes::OK
            }
            AddRespCode::Failed => report_code(codes::FS_ADD_ERROR),
        },
        Ok(_) => report_code(codes::COMM_ERROR),
        Err(e) => report(&e),
    }
}

fn migrate_target(state: &str) -> Option<TargetState> {
    match state {
        "r" => Some(TargetState::Resident),
        "p" => Some(TargetState::Premigrated),
        "m" => Some(TargetState::Migrated),
        _ => None,
    }
}

fn recall_target(state: &str) -> Option<TargetState> {
    match state {
        "r" => Some(TargetState::Resident),
        "p" => Some(TargetState::Premigrated),
        _ => None,
    }
}

pub async fn migrate(config: &ServerConfig, state: &str, pools: &str, paths: &[String]) -> i32 {
    let Some(target_state) = migrate_target(state) else {
        eprintln!("invalid target state '{}', use r, p, or m", state);
        return codes::GENERAL_ERROR;
    };
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };

    let msg = Message::MigRequest {
        key: session.key,
        req_num: session.req_num,
        pools: pools.to_string(),
        target_state,
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    match session.conn.recv().await {
        Ok(Message::MigRequestResp { error, .. }) if error == codes::OK => {}
        Ok(Message::MigRequestResp { error, .. }) => return report_code(error),
        Ok(_) => return report_code(codes::COMM_ERROR),
        Err(e) => return report(&e),
    }

    if let Err(e) = send_objects(&mut session, paths).await {
        return report(&e);
    }
    watch_request(&mut session).await
}

pub async fn recall(config: &ServerConfig, state: &str, paths: &[String]) -> i32 {
    let Some(target_state) = recall_target(state) else {
        eprintln!("invalid target state '{}', use r or p", state);
        return codes::GENERAL_ERROR;
    };
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };

    let msg = Message::SelRecRequest {
        key: session.key,
        req_num: session.req_num,
        target_state,
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    match session.conn.recv().await {
        Ok(Message::SelRecRequestResp { error, .. }) if error == codes::OK => {}
        Ok(Message::SelRecRequestResp { error, .. }) => return report_code(error),
        Ok(_) => return report_code(codes::COMM_ERROR),
        Err(e) => return report(&e),
    }

    if let Err(e) = send_objects(&mut session, paths).await {
        return report(&e);
    }
    watch_request(&mut session).await
}

/// Stream the file list in batches, closed by an empty name.
async fn send_objects(session: &mut Session, paths: &[String]) -> DmResult<()> {
    let canonical: Vec<String> = paths
        .iter()
        .map(|p| {
            Path::new(p)
                .canonicalize()
                .map(|c| c.display().to_string())
                .unwrap_or_else(|_| p.clone())
        })
        .collect();

    for batch in canonical.chunks(OBJECT_BATCH) {
        session
            .conn
            .send(&Message::SendObjects {
                file_names: batch.to_vec(),
            })
            .await?;
        match session.conn.recv().await? {
            Message::SendObjectsResp { success: true, .. } => {}
            other => {
                return Err(DmError::Comm(format!("unexpected answer: {:?}", other)));
            }
        }
    }

    session
        .conn
        .send(&Message::SendObjects {
            file_names: vec![String::new()],
        })
        .await?;
    match session.conn.recv().await? {
        Message::SendObjectsResp { success: true, .. } => Ok(()),
        other => Err(DmError::Comm(format!("unexpected answer: {:?}", other))),
    }
}

/// Poll the request status until it is done and print the counts.
async fn watch_request(session: &mut Session) -> i32 {
    loop {
        let msg = Message::ReqStatusRequest {
            key: session.key,
            req_num: session.req_num,
        };
        if let Err(e) = session.conn.send(&msg).await {
            return report(&e);
        }
        match session.conn.recv().await {
            Ok(Message::ReqStatusResp {
                resident,
                premigrated,
                migrated,
                failed,
                done,
                ..
            }) => {
                println!(
                    "resident: {}  premigrated: {}  migrated: {}  failed: {}",
                    resident, premigrated, migrated, failed
                );
                if done {
                    return if failed > 0 {
                        codes::GENERAL_ERROR
                    } else {
                        codes::OK
                    };
                }
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub async fn info_requests(config: &ServerConfig, req_num: Option<i64>) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let msg = Message::InfoRequestsRequest {
        key: session.key,
        req_num: req_num.unwrap_or(UNSET),
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    println!(
        "{:<20} {:<10} {:<10} {:<14} {:<12}",
        "operation", "request", "tape", "target state", "state"
    );
    loop {
        match session.conn.recv().await {
            Ok(Message::InfoRequestsResp {
                operation,
                req_num,
                tape_id,
                target_state,
                state,
            }) => {
                if operation.is_empty() {
                    return codes::OK;
                }
                println!(
                    "{:<20} {:<10} {:<10} {:<14} {:<12}",
                    operation, req_num, tape_id, target_state, state
                );
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
}

pub async fn info_jobs(config: &ServerConfig, req_num: Option<i64>) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let msg = Message::InfoJobsRequest {
        key: session.key,
        req_num: req_num.unwrap_or(UNSET),
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    println!(
        "{:<20} {:<10} {:<6} {:<12} {:<10} {:<14} file",
        "operation", "request", "repl", "size", "tape", "state"
    );
    loop {
        match session.conn.recv().await {
            Ok(Message::InfoJobsResp {
                operation,
                file_name,
                req_num,
                repl_num,
                file_size,
                tape_id,
                state,
            }) => {
                if operation.is_empty() {
                    return codes::OK;
                }
                println!(
                    "{:<20} {:<10} {:<6} {:<12} {:<10} {:<14} {}",
                    operation, req_num, repl_num, file_size, tape_id, state, file_name
                );
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
}

pub async fn info_drives(config: &ServerConfig) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let key = session.key;
    if let Err(e) = session.conn.send(&Message::InfoDrivesRequest { key }).await {
        return report(&e);
    }
    println!("{:<10} {:<8} {:<10} busy", "drive", "slot", "status");
    loop {
        match session.conn.recv().await {
            Ok(Message::InfoDrivesResp {
                id,
                slot,
                status,
                busy,
            }) => {
                if id.is_empty() {
                    return codes::OK;
                }
                println!("{:<10} {:<8} {:<10} {}", id, slot, status, busy);
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
}

pub async fn info_tapes(config: &ServerConfig) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let key = session.key;
    if let Err(e) = session.conn.send(&Message::InfoTapesRequest { key }).await {
        return report(&e);
    }
    println!(
        "{:<10} {:<8} {:<12} {:<12} {:<16} {:<12} pool",
        "tape", "slot", "total (MiB)", "free (MiB)", "status", "state"
    );
    loop {
        match session.conn.recv().await {
            Ok(Message::InfoTapesResp {
                id,
                slot,
                total_cap,
                remaining_cap,
                status,
                state,
                pool,
            }) => {
                if id.is_empty() {
                    return codes::OK;
                }
                println!(
                    "{:<10} {:<8} {:<12} {:<12} {:<16} {:<12} {}",
                    id, slot, total_cap, remaining_cap, status, state, pool
                );
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
}

pub async fn info_pools(config: &ServerConfig) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let key = session.key;
    if let Err(e) = session.conn.send(&Message::InfoPoolsRequest { key }).await {
        return report(&e);
    }
    println!(
        "{:<16} {:<12} {:<12} {:<12} tapes",
        "pool", "total (MiB)", "free (MiB)", "unref (MiB)"
    );
    loop {
        match session.conn.recv().await {
            Ok(Message::InfoPoolsResp {
                name,
                total,
                free,
                unref,
                num_tapes,
            }) => {
                if name.is_empty() {
                    return codes::OK;
                }
                println!(
                    "{:<16} {:<12} {:<12} {:<12} {}",
                    name, total, free, unref, num_tapes
                );
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
}

/// File states are read from the host-local attribute store.
pub fn info_files(config: &ServerConfig, paths: &[String]) -> i32 {
    let store = match AttrStore::open(config.attr_store_path.clone()) {
        Ok(store) => store,
        Err(e) => return report(&e),
    };
    println!("{:<14} {:<6} tapes  file", "state", "size");
    if paths.is_empty() {
        for (file_name, attrs) in store.entries() {
            println!(
                "{:<14} {:<6} {:<6} {}",
                attrs.state.as_str(),
                attrs.file_size,
                attrs.tape_ids.join(","),
                file_name
            );
        }
        return codes::OK;
    }
    for path in paths {
        let file_name = Path::new(path)
            .canonicalize()
            .map(|c| c.display().to_string())
            .unwrap_or_else(|_| path.clone());
        match store.get(&file_name) {
            Some(attrs) => println!(
                "{:<14} {:<6} {:<6} {}",
                attrs.state.as_str(),
                attrs.file_size,
                attrs.tape_ids.join(","),
                file_name
            ),
            None => println!("{:<14} {:<6} {:<6} {}", "resident", "-", "-", file_name),
        }
    }
    codes::OK
}

/// The managed file systems live in the backend database; list them
/// through a read-only store on the same file.
pub fn info_fs(config: &ServerConfig) -> i32 {
    let store = match QueueStore::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => return report(&e),
    };
    match store.managed_fs_list() {
        Ok(list) => {
            println!("{:<30} {:<30} name", "file system", "mount point");
            for fs in list {
                println!("{:<30} {:<30} {}", fs.fs_path, fs.mount_point, fs.fs_name);
            }
            codes::OK
        }
        Err(e) => report(&e),
    }
}

pub async fn retrieve(config: &ServerConfig) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let key = session.key;
    if let Err(e) = session.conn.send(&Message::RetrieveRequest { key }).await {
        return report(&e);
    }
    match session.conn.recv().await {
        Ok(Message::RetrieveResp { error }) if error == codes::OK => {
            println!("inventory refreshed");
            codes::OK
        }
        Ok(Message::RetrieveResp { error }) => report_code(error),
        Ok(_) => report_code(codes::COMM_ERROR),
        Err(e) => report(&e),
    }
}

async fn pool_response(session: &mut Session) -> i32 {
    match session.conn.recv().await {
        Ok(Message::PoolResp { response, .. }) if response == codes::OK => codes::OK,
        Ok(Message::PoolResp { response, .. }) => report_code(response),
        Ok(_) => report_code(codes::COMM_ERROR),
        Err(e) => report(&e),
    }
}

pub async fn pool_create(config: &ServerConfig, pool: &str) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let msg = Message::PoolCreateRequest {
        key: session.key,
        pool: pool.to_string(),
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    let code = pool_response(&mut session).await;
    if code == codes::OK {
        println!("pool {} created", pool);
    }
    code
}

pub async fn pool_delete(config: &ServerConfig, pool: &str) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let msg = Message::PoolDeleteRequest {
        key: session.key,
        pool: pool.to_string(),
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    let code = pool_response(&mut session).await;
    if code == codes::OK {
        println!("pool {} deleted", pool);
    }
    code
}

pub async fn pool_add(config: &ServerConfig, pool: &str, tapes: Vec<String>) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let count = tapes.len();
    let msg = Message::PoolAddRequest {
        key: session.key,
        pool: pool.to_string(),
        tapes,
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    let mut code = codes::OK;
    for _ in 0..count {
        match session.conn.recv().await {
            Ok(Message::PoolResp { tape_id, response }) if response == codes::OK => {
                println!("tape {} added to pool {}", tape_id, pool);
            }
            Ok(Message::PoolResp { tape_id, response }) => {
                eprintln!("tape {}: {}", tape_id, describe_code(response));
                code = response;
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
    code
}

pub async fn pool_remove(config: &ServerConfig, pool: &str, tapes: Vec<String>) -> i32 {
    let mut session = match connect(config).await {
        Ok(session) => session,
        Err(e) => return report(&e),
    };
    let count = tapes.len();
    let msg = Message::PoolRemoveRequest {
        key: session.key,
        pool: pool.to_string(),
        tapes,
    };
    if let Err(e) = session.conn.send(&msg).await {
        return report(&e);
    }
    let mut code = codes::OK;
    for _ in 0..count {
        match session.conn.recv().await {
            Ok(Message::PoolResp { tape_id, response }) if response == codes::OK => {
                println!("tape {} removed from pool {}", tape_id, pool);
            }
            Ok(Message::PoolResp { tape_id, response }) => {
                eprintln!("tape {}: {}", tape_id, describe_code(response));
                code = response;
            }
            Ok(_) => return report_code(codes::COMM_ERROR),
            Err(e) => return report(&e),
        }
    }
    code
}
