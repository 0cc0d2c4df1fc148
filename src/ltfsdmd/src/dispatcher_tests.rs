use std::sync::Arc;
use std::time::Duration;

use ltfsdm_lib::{
    codes, AddRespCode, CartridgeConfigEntry, DmConnection, DriveConfigEntry, FileState,
    LibraryConfig, Message, OpKind, ReqState, ServerConfig, TargetState,
};
use tempfile::TempDir;
use tokio::net::UnixStream;

use crate::daemon::Ctx;
use crate::dispatcher;
use crate::fileops::FileOperation;
use crate::recall;
use crate::scheduler::Scheduler;

const TEST_KEY: i64 = 4711;

struct TestServer {
    ctx: Arc<Ctx>,
    tmp: TempDir,
}

fn library(op_delay_ms: u64) -> LibraryConfig {
    LibraryConfig {
        drives: vec![DriveConfigEntry {
            id: "D1".to_string(),
            slot: 256,
        }],
        cartridges: vec![CartridgeConfigEntry {
            id: "T1".to_string(),
            slot: 4096,
            total_cap: 1000,
            remaining_cap: 1000,
            ..Default::default()
        }],
        op_delay_ms,
    }
}

async fn start_server(library: LibraryConfig) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = ServerConfig::default();
    config.db_path = tmp.path().join("queue.db");
    config.pool_conf_path = tmp.path().join("pools.json");
    config.attr_store_path = tmp.path().join("attrs.json");
    config.socket_path = tmp.path().join("ltfsdmd.sock");
    config.key_file_path = tmp.path().join("key");
    config.lock_file_path = tmp.path().join("lock");
    config.library = library;

    let (ctx, recall_rx) = Ctx::build(config, TEST_KEY).await.unwrap();
    tokio::spawn(Scheduler::new(ctx.clone()).run());
    tokio::spawn(recall::event_loop(ctx.clone(), recall_rx));
    TestServer { ctx, tmp }
}

fn create_file(tmp: &TempDir, name: &str, size: usize) -> String {
    let dir = tmp.path().join("data");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; size]).unwrap();
    path.display().to_string()
}

/// One client session: connect and run the request-number handshake.
async fn open_session(ctx: &Arc<Ctx>) -> (DmConnection, i64) {
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(dispatcher::handle_connection(ctx.clone(), server));
    let mut conn = DmConnection::new(client);
    conn.send(&Message::ReqNumber { key: TEST_KEY }).await.unwrap();
    match conn.recv().await.unwrap() {
        Message::ReqNumberResp {
            success: true,
            req_num,
        } => (conn, req_num),
        other => panic!("unexpected answer: {:?}", other),
    }
}

async fn send_object_list(conn: &mut DmConnection, files: &[&str]) {
    let mut names: Vec<String> = files.iter().map(|f| f.to_string()).collect();
    names.push(String::new());
    conn.send(&Message::SendObjects { file_names: names })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::SendObjectsResp { success: true, .. } => {}
        other => panic!("unexpected answer: {:?}", other),
    }
}

async fn wait_status_done(conn: &mut DmConnection, req_num: i64) -> (i64, i64, i64, i64) {
    for _ in 0..200 {
        conn.send(&Message::ReqStatusRequest {
            key: TEST_KEY,
            req_num,
        })
        .await
        .unwrap();
        match conn.recv().await.unwrap() {
            Message::ReqStatusResp {
                resident,
                premigrated,
                migrated,
                failed,
                done,
                ..
            } => {
                if done {
                    return (resident, premigrated, migrated, failed);
                }
            }
            other => panic!("unexpected answer: {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("request {} did not complete", req_num);
}

#[tokio::test]
async fn test_migration_session_over_wire() {
    let srv = start_server(library(0)).await;
    srv.ctx.inv.pool_create("archive").unwrap();
    srv.ctx.inv.pool_add("archive", "T1").unwrap();
    let file = create_file(&srv.tmp, "f1", 1024);

    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "archive".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::MigRequestResp { error, .. } => assert_eq!(error, codes::OK),
        other => panic!("unexpected answer: {:?}", other),
    }

    send_object_list(&mut conn, &[&file]).await;
    let (resident, premigrated, migrated, failed) = wait_status_done(&mut conn, req_num).await;
    assert_eq!((resident, premigrated, failed), (0, 0, 0));
    assert_eq!(migrated, 1);
    assert_eq!(srv.ctx.attrs.state_of(&file), FileState::Migrated);
}

#[tokio::test]
async fn test_pool_count_boundaries() {
    let srv = start_server(library(0)).await;
    for pool in ["p1", "p2", "p3", "p4"] {
        srv.ctx.inv.pool_create(pool).unwrap();
    }

    // unknown pool: no request row may appear
    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "p1,unknown".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::MigRequestResp { error, .. } => {
            assert_eq!(error, codes::NOT_ALL_POOLS_EXIST)
        }
        other => panic!("unexpected answer: {:?}", other),
    }
    assert!(srv.ctx.queue.requests(None).unwrap().is_empty());

    // zero pools
    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: String::new(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::MigRequestResp { error, .. } => assert_eq!(error, codes::WRONG_POOLNUM),
        other => panic!("unexpected answer: {:?}", other),
    }

    // four pools, all existing
    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "p1,p2,p3,p4".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::MigRequestResp { error, .. } => assert_eq!(error, codes::WRONG_POOLNUM),
        other => panic!("unexpected answer: {:?}", other),
    }
    assert!(srv.ctx.queue.requests(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_file_rejected_others_accepted() {
    let srv = start_server(library(0)).await;
    srv.ctx.inv.pool_create("archive").unwrap();
    srv.ctx.inv.pool_add("archive", "T1").unwrap();
    let file_a = create_file(&srv.tmp, "a", 512);
    let file_b = create_file(&srv.tmp, "b", 512);

    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "archive".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    let _ = conn.recv().await.unwrap();

    // the duplicate is refused per-file, the rest of the list sticks
    send_object_list(&mut conn, &[&file_a, &file_a, &file_b]).await;
    let jobs = srv.ctx.queue.jobs(Some(req_num)).unwrap();
    assert_eq!(jobs.len(), 2);

    let (_, _, migrated, failed) = wait_status_done(&mut conn, req_num).await;
    assert_eq!(migrated, 2);
    assert_eq!(failed, 0);
}

#[tokio::test]
async fn test_migrated_file_rejected_for_migration() {
    let srv = start_server(library(0)).await;
    srv.ctx.inv.pool_create("archive").unwrap();
    srv.ctx.inv.pool_add("archive", "T1").unwrap();
    let file = create_file(&srv.tmp, "old", 512);
    srv.ctx
        .attrs
        .set_state(&file, 512, FileState::Migrated)
        .unwrap();
    srv.ctx.attrs.add_copy(&file, 512, "T1").unwrap();

    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "archive".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    let _ = conn.recv().await.unwrap();

    send_object_list(&mut conn, &[&file]).await;
    assert!(srv.ctx.queue.jobs(Some(req_num)).unwrap().is_empty());
    let (resident, premigrated, migrated, failed) = wait_status_done(&mut conn, req_num).await;
    assert_eq!((resident, premigrated, migrated, failed), (0, 0, 0, 0));
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_progress() {
    let srv = start_server(library(100)).await;

    // a recall that takes a while
    let files: Vec<String> = (0..3)
        .map(|i| {
            let file = create_file(&srv.tmp, &format!("r{}", i), 256);
            srv.ctx
                .attrs
                .set_state(&file, 256, FileState::Migrated)
                .unwrap();
            srv.ctx.attrs.add_copy(&file, 256, "T1").unwrap();
            file
        })
        .collect();
    let rec_req = srv.ctx.next_req_num();
    let fop = FileOperation::sel_recall(srv.ctx.clone(), rec_req, TargetState::Resident);
    for file in &files {
        fop.add_job(file).unwrap();
    }
    fop.add_request().unwrap();

    for _ in 0..100 {
        if srv.ctx.queue.in_progress_count().unwrap() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(srv.ctx.queue.in_progress_count().unwrap() > 0);

    let (mut conn, req_num) = open_session(&srv.ctx).await;
    let mut saw_refusal = false;
    for _ in 0..100 {
        conn.send(&Message::StopRequest {
            key: TEST_KEY,
            req_num,
            forced: false,
            finish: false,
        })
        .await
        .unwrap();
        match conn.recv().await.unwrap() {
            Message::StopResp { success: true } => break,
            Message::StopResp { success: false } => {
                saw_refusal = true;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => panic!("unexpected answer: {:?}", other),
        }
    }
    assert!(saw_refusal, "stop must wait for the in-progress recall");
    assert!(srv.ctx.term.terminate());
    assert_eq!(srv.ctx.queue.in_progress_count().unwrap(), 0);

    // data-moving requests are refused while terminating
    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "archive".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::MigRequestResp { error, .. } => assert_eq!(error, codes::TERMINATING),
        other => panic!("unexpected answer: {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_key_closes_session() {
    let srv = start_server(library(0)).await;
    let (client, server) = UnixStream::pair().unwrap();
    tokio::spawn(dispatcher::handle_connection(srv.ctx.clone(), server));
    let mut conn = DmConnection::new(client);

    conn.send(&Message::ReqNumber { key: TEST_KEY + 1 })
        .await
        .unwrap();
    assert!(conn.recv().await.is_err());
}

#[tokio::test]
async fn test_pool_management_over_wire() {
    let srv = start_server(library(0)).await;

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::PoolCreateRequest {
        key: TEST_KEY,
        pool: "archive".to_string(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::PoolResp { response, .. } => assert_eq!(response, codes::OK),
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::PoolCreateRequest {
        key: TEST_KEY,
        pool: "archive".to_string(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::PoolResp { response, .. } => assert_eq!(response, codes::POOL_EXISTS),
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::PoolAddRequest {
        key: TEST_KEY,
        pool: "archive".to_string(),
        tapes: vec!["T1".to_string(), "T9".to_string()],
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::PoolResp { tape_id, response } => {
            assert_eq!(tape_id, "T1");
            assert_eq!(response, codes::OK);
        }
        other => panic!("unexpected answer: {:?}", other),
    }
    match conn.recv().await.unwrap() {
        Message::PoolResp { tape_id, response } => {
            assert_eq!(tape_id, "T9");
            assert_eq!(response, codes::TAPE_NOT_EXISTS);
        }
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::InfoPoolsRequest { key: TEST_KEY })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::InfoPoolsResp {
            name,
            total,
            free,
            unref,
            num_tapes,
        } => {
            assert_eq!(name, "archive");
            assert_eq!(total, 1000);
            assert_eq!(free, 1000);
            assert_eq!(unref, 0);
            assert_eq!(num_tapes, 1);
        }
        other => panic!("unexpected answer: {:?}", other),
    }
    match conn.recv().await.unwrap() {
        Message::InfoPoolsResp { name, .. } => assert!(name.is_empty(), "sentinel row"),
        other => panic!("unexpected answer: {:?}", other),
    }
}

#[tokio::test]
async fn test_add_file_system() {
    let srv = start_server(library(0)).await;
    let fs_dir = srv.tmp.path().join("managed");
    std::fs::create_dir_all(&fs_dir).unwrap();
    let fs_path = fs_dir.display().to_string();

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::AddRequest {
        key: TEST_KEY,
        managed_fs: fs_path.clone(),
        mount_point: fs_path.clone(),
        fs_name: "testfs".to_string(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::AddResp { response } => assert_eq!(response, AddRespCode::Success),
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::AddRequest {
        key: TEST_KEY,
        managed_fs: fs_path.clone(),
        mount_point: fs_path.clone(),
        fs_name: "testfs".to_string(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::AddResp { response } => assert_eq!(response, AddRespCode::AlreadyAdded),
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::AddRequest {
        key: TEST_KEY,
        managed_fs: "/does/not/exist".to_string(),
        mount_point: String::new(),
        fs_name: String::new(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        Message::AddResp { response } => assert_eq!(response, AddRespCode::Failed),
        other => panic!("unexpected answer: {:?}", other),
    }
}

#[tokio::test]
async fn test_info_lists_terminate_with_sentinel() {
    let srv = start_server(library(0)).await;

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::InfoDrivesRequest { key: TEST_KEY })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::InfoDrivesResp { id, busy, .. } => {
            assert_eq!(id, "D1");
            assert!(!busy);
        }
        other => panic!("unexpected answer: {:?}", other),
    }
    match conn.recv().await.unwrap() {
        Message::InfoDrivesResp { id, slot, .. } => {
            assert!(id.is_empty());
            assert_eq!(slot, ltfsdm_lib::UNSET);
        }
        other => panic!("unexpected answer: {:?}", other),
    }

    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::InfoTapesRequest { key: TEST_KEY })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::InfoTapesResp { id, state, .. } => {
            assert_eq!(id, "T1");
            assert_eq!(state, "unmounted");
        }
        other => panic!("unexpected answer: {:?}", other),
    }
    match conn.recv().await.unwrap() {
        Message::InfoTapesResp { id, .. } => assert!(id.is_empty()),
        other => panic!("unexpected answer: {:?}", other),
    }
}

#[tokio::test]
async fn test_retrieve_refreshes_inventory() {
    let srv = start_server(library(0)).await;
    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::RetrieveRequest { key: TEST_KEY })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::RetrieveResp { error } => assert_eq!(error, codes::OK),
        other => panic!("unexpected answer: {:?}", other),
    }
    assert_eq!(srv.ctx.inv.cartridges().len(), 1);
}

#[tokio::test]
async fn test_status_reports_pid() {
    let srv = start_server(library(0)).await;
    let (mut conn, _) = open_session(&srv.ctx).await;
    conn.send(&Message::StatusRequest { key: TEST_KEY })
        .await
        .unwrap();
    match conn.recv().await.unwrap() {
        Message::StatusResp { success, pid } => {
            assert!(success);
            assert_eq!(pid, std::process::id());
        }
        other => panic!("unexpected answer: {:?}", other),
    }
}

#[tokio::test]
async fn test_repeated_status_is_monotonic() {
    let srv = start_server(library(20)).await;
    srv.ctx.inv.pool_create("archive").unwrap();
    srv.ctx.inv.pool_add("archive", "T1").unwrap();
    let files: Vec<String> = (0..5)
        .map(|i| create_file(&srv.tmp, &format!("f{}", i), 1024))
        .collect();

    let (mut conn, req_num) = open_session(&srv.ctx).await;
    conn.send(&Message::MigRequest {
        key: TEST_KEY,
        req_num,
        pools: "archive".to_string(),
        target_state: TargetState::Migrated,
    })
    .await
    .unwrap();
    let _ = conn.recv().await.unwrap();
    let file_refs: Vec<&str> = files.iter().map(|s| s.as_str()).collect();
    send_object_list(&mut conn, &file_refs).await;

    let mut last_migrated = 0;
    let mut last_done = false;
    for _ in 0..200 {
        conn.send(&Message::ReqStatusRequest {
            key: TEST_KEY,
            req_num,
        })
        .await
        .unwrap();
        match conn.recv().await.unwrap() {
            Message::ReqStatusResp { migrated, done, .. } => {
                assert!(migrated >= last_migrated, "counts never decrease");
                assert!(!last_done || done, "done never reverts");
                last_migrated = migrated;
                last_done = done;
                if done {
                    break;
                }
            }
            other => panic!("unexpected answer: {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(last_done);
    assert_eq!(last_migrated, 5);

    // the request rows ended in the completed state
    let rows = srv.ctx.queue.requests(Some(req_num)).unwrap();
    assert!(rows.iter().all(|r| r.state == ReqState::Completed));
    assert!(rows.iter().all(|r| r.operation == OpKind::Migration));
}
