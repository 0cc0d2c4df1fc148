use serde::{Deserialize, Serialize};

use crate::{TargetState, UNSET};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddRespCode {
    Success,
    AlreadyAdded,
    Failed,
}

/// One wire message. Every request carries the 64-bit session key; the
/// server closes the connection on a mismatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum Message {
    ReqNumber {
        key: i64,
    },
    ReqNumberResp {
        success: bool,
        req_num: i64,
    },
    StopRequest {
        key: i64,
        req_num: i64,
        forced: bool,
        finish: bool,
    },
    StopResp {
        success: bool,
    },
    MigRequest {
        key: i64,
        req_num: i64,
        pools: String,
        target_state: TargetState,
    },
    MigRequestResp {
        error: i32,
        req_num: i64,
    },
    SelRecRequest {
        key: i64,
        req_num: i64,
        target_state: TargetState,
    },
    SelRecRequestResp {
        error: i32,
        req_num: i64,
    },
    /// Streamed file names; an empty name terminates the enumeration.
    SendObjects {
        file_names: Vec<String>,
    },
    SendObjectsResp {
        success: bool,
        req_num: i64,
    },
    ReqStatusRequest {
        key: i64,
        req_num: i64,
    },
    ReqStatusResp {
        success: bool,
        req_num: i64,
        resident: i64,
        premigrated: i64,
        migrated: i64,
        failed: i64,
        done: bool,
    },
    StatusRequest {
        key: i64,
    },
    StatusResp {
        success: bool,
        pid: u32,
    },
    AddRequest {
        key: i64,
        managed_fs: String,
        mount_point: String,
        fs_name: String,
    },
    AddResp {
        response: AddRespCode,
    },
    InfoRequestsRequest {
        key: i64,
        req_num: i64,
    },
    InfoRequestsResp {
        operation: String,
        req_num: i64,
        tape_id: String,
        target_state: String,
        state: String,
    },
    InfoJobsRequest {
        key: i64,
        req_num: i64,
    },
    InfoJobsResp {
        operation: String,
        file_name: String,
        req_num: i64,
        repl_num: i64,
        file_size: i64,
        tape_id: String,
        state: String,
    },
    InfoDrivesRequest {
        key: i64,
    },
    InfoDrivesResp {
        id: String,
        slot: i64,
        status: String,
        busy: bool,
    },
    InfoTapesRequest {
        key: i64,
    },
    InfoTapesResp {
        id: String,
        slot: i64,
        total_cap: i64,
        remaining_cap: i64,
        status: String,
        state: String,
        pool: String,
    },
    PoolCreateRequest {
        key: i64,
        pool: String,
    },
    PoolDeleteRequest {
        key: i64,
        pool: String,
    },
    PoolAddRequest {
        key: i64,
        pool: String,
        tapes: Vec<String>,
    },
    PoolRemoveRequest {
        key: i64,
        pool: String,
        tapes: Vec<String>,
    },
    PoolResp {
        tape_id: String,
        response: i32,
    },
    InfoPoolsRequest {
        key: i64,
    },
    InfoPoolsResp {
        name: String,
        total: i64,
        free: i64,
        unref: i64,
        num_tapes: i64,
    },
    RetrieveRequest {
        key: i64,
    },
    RetrieveResp {
        error: i32,
    },
}

impl Message {
    /// Authentication key of a request message; responses carry none.
    pub fn key(&self) -> Option<i64> {
        match self {
            Message::ReqNumber { key }
            | Message::StopRequest { key, .. }
            | Message::MigRequest { key, .. }
            | Message::SelRecRequest { key, .. }
            | Message::ReqStatusRequest { key, .. }
            | Message::StatusRequest { key }
            | Message::AddRequest { key, .. }
            | Message::InfoRequestsRequest { key, .. }
            | Message::InfoJobsRequest { key, .. }
            | Message::InfoDrivesRequest { key }
            | Message::InfoTapesRequest { key }
            | Message::PoolCreateRequest { key, .. }
            | Message::PoolDeleteRequest { key, .. }
            | Message::PoolAddRequest { key, .. }
            | Message::PoolRemoveRequest { key, .. }
            | Message::InfoPoolsRequest { key }
            | Message::RetrieveRequest { key } => Some(*key),
            _ => None,
        }
    }

    /// Sentinel row closing an info list.
    pub fn info_requests_sentinel() -> Message {
        Message::InfoRequestsResp {
            operation: String::new(),
            req_num: UNSET,
            tape_id: String::new(),
            target_state: String::new(),
            state: String::new(),
        }
    }

    pub fn info_jobs_sentinel() -> Message {
        Message::InfoJobsResp {
            operation: String::new(),
            file_name: String::new(),
            req_num: UNSET,
            repl_num: UNSET,
            file_size: UNSET,
            tape_id: String::new(),
            state: String::new(),
        }
    }

    pub fn info_drives_sentinel() -> Message {
        Message::InfoDrivesResp {
            id: String::new(),
            slot: UNSET,
            status: String::new(),
            busy: false,
        }
    }

    pub fn info_tapes_sentinel() -> Message {
        Message::InfoTapesResp {
            id: String::new(),
            slot: UNSET,
            total_cap: UNSET,
            remaining_cap: UNSET,
            status: String::new(),
            state: String::new(),
            pool: String::new(),
        }
    }

    pub fn info_pools_sentinel() -> Message {
        Message::InfoPoolsResp {
            name: String::new(),
            total: UNSET,
            free: UNSET,
            unref: UNSET,
            num_tapes: UNSET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_round_trip() {
        let msg = Message::MigRequest {
            key: 42,
            req_num: 7,
            pools: "pool1,pool2".to_string(),
            target_state: TargetState::Migrated,
        };
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            Message::MigRequest {
                key,
                req_num,
                pools,
                target_state,
            } => {
                assert_eq!(key, 42);
                assert_eq!(req_num, 7);
                assert_eq!(pools, "pool1,pool2");
                assert_eq!(target_state, TargetState::Migrated);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_key_accessor() {
        assert_eq!(Message::StatusRequest { key: 9 }.key(), Some(9));
        assert_eq!(
            Message::StatusResp {
                success: true,
                pid: 1
            }
            .key(),
            None
        );
    }

    #[test]
    fn test_sentinel_rows_are_empty() {
        match Message::info_tapes_sentinel() {
            Message::InfoTapesResp { id, slot, pool, .. } => {
                assert!(id.is_empty());
                assert!(pool.is_empty());
                assert_eq!(slot, UNSET);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
