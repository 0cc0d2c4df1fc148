use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use ltfsdm_lib::{DmError, DmResult, OpKind};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{CartridgeInfo, DriveInfo, TapeLibrary, STATUS_INACCESSIBLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartridgeState {
    Unmounted,
    Mounted,
    Moving,
    InUse,
    Invalid,
    Unknown,
}

impl CartridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            CartridgeState::Unmounted => "unmounted",
            CartridgeState::Mounted => "mounted",
            CartridgeState::Moving => "moving",
            CartridgeState::InUse => "in use",
            CartridgeState::Invalid => "invalid",
            CartridgeState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Drive {
    pub id: String,
    pub slot: u64,
    pub busy: bool,
    /// Request that claimed this drive for a pending tape move.
    pub move_req: Option<(i64, String)>,
    /// Operation whose pre-emption request this drive has honored.
    pub to_unblock: Option<OpKind>,
}

impl Drive {
    /// A pre-emptor must outrank whatever already asked for this drive.
    pub fn unblock_priority(&self) -> i32 {
        self.to_unblock.map(|op| op.priority()).unwrap_or(i32::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub id: String,
    pub slot: u64,
    pub home_slot: u64,
    /// Pool membership; empty when unassigned.
    pub pool: String,
    /// Capacities in MiB.
    pub total_cap: u64,
    pub remaining_cap: u64,
    pub status: String,
    pub state: CartridgeState,
    /// A higher-priority operation has asked the current holder to
    /// release this cartridge.
    pub requested: bool,
    /// Per-cartridge condition: signalled on mount completion, on
    /// release, and at scheduler drain.
    pub notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    /// Configuration order; pool scans preserve it.
    pub cartridges: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PoolConfFile {
    pools: Vec<PoolConfEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolConfEntry {
    name: String,
    cartridges: Vec<String>,
}

/// Everything the process knows about drives, cartridges and pools.
/// Owned for the process lifetime; all state transitions happen while
/// the inventory mutex is held.
pub struct InvState {
    pub drives: Vec<Drive>,
    pub cartridges: Vec<Cartridge>,
    pub pools: Vec<Pool>,
}

impl InvState {
    pub fn drive(&self, id: &str) -> Option<&Drive> {
        self.drives.iter().find(|d| d.id == id)
    }

    pub fn drive_mut(&mut self, id: &str) -> Option<&mut Drive> {
        self.drives.iter_mut().find(|d| d.id == id)
    }

    pub fn cartridge(&self, id: &str) -> Option<&Cartridge> {
        self.cartridges.iter().find(|c| c.id == id)
    }

    pub fn cartridge_mut(&mut self, id: &str) -> Option<&mut Cartridge> {
        self.cartridges.iter_mut().find(|c| c.id == id)
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn pool_mut(&mut self, name: &str) -> Option<&mut Pool> {
        self.pools.iter_mut().find(|p| p.name == name)
    }

    /// Commit point of a scheduling decision: the drive goes busy and
    /// the cartridge into use, atomically for any observer of the lock.
    pub fn make_use(&mut self, drive_id: &str, tape_id: &str) -> DmResult<()> {
        let drive = self
            .drive_mut(drive_id)
            .ok_or_else(|| DmError::Internal(format!("unknown drive {}", drive_id)))?;
        drive.busy = true;
        let cart = self
            .cartridge_mut(tape_id)
            .ok_or_else(|| DmError::TapeNotExists(tape_id.to_string()))?;
        cart.state = CartridgeState::InUse;
        cart.requested = false;
        Ok(())
    }

    /// A tape move for this request is already pending on some drive.
    pub fn request_exists(&self, req_num: i64, pool: &str) -> bool {
        self.drives
            .iter()
            .any(|d| matches!(&d.move_req, Some((rn, p)) if *rn == req_num && p == pool))
    }
}

fn cartridge_from_info(info: &CartridgeInfo, drives: &[DriveInfo]) -> Cartridge {
    let in_drive = drives.iter().any(|d| d.slot == info.slot);
    let state = if info.status == STATUS_INACCESSIBLE {
        CartridgeState::Invalid
    } else if in_drive {
        CartridgeState::Mounted
    } else {
        CartridgeState::Unmounted
    };
    Cartridge {
        id: info.id.clone(),
        slot: info.slot,
        home_slot: info.slot,
        pool: String::new(),
        total_cap: info.total_cap,
        remaining_cap: info.remaining_cap,
        status: info.status.clone(),
        state,
        requested: false,
        notify: Arc::new(Notify::new()),
    }
}

pub struct Inventory {
    state: Mutex<InvState>,
    pool_conf_path: PathBuf,
    library: Arc<dyn TapeLibrary>,
}

impl Inventory {
    pub async fn build(
        library: Arc<dyn TapeLibrary>,
        pool_conf_path: PathBuf,
    ) -> DmResult<Inventory> {
        let drive_infos = library.load_drives().await?;
        let cart_infos = library.load_cartridges().await?;

        let drives = drive_infos
            .iter()
            .map(|d| Drive {
                id: d.id.clone(),
                slot: d.slot,
                busy: false,
                move_req: None,
                to_unblock: None,
            })
            .collect::<Vec<_>>();
        let cartridges = cart_infos
            .iter()
            .map(|c| cartridge_from_info(c, &drive_infos))
            .collect::<Vec<_>>();

        let inventory = Inventory {
            state: Mutex::new(InvState {
                drives,
                cartridges,
                pools: Vec::new(),
            }),
            pool_conf_path,
            library,
        };
        inventory.load_pools()?;
        Ok(inventory)
    }

    /// Run a closure under the inventory lock. The scheduler evaluates a
    /// whole request under one acquisition so observers see either the
    /// pre-claim or the post-claim configuration.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut InvState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn load_pools(&self) -> DmResult<()> {
        if !self.pool_conf_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.pool_conf_path)?;
        let conf: PoolConfFile = serde_json::from_str(&content).map_err(|e| {
            DmError::Config(format!("{}: {}", self.pool_conf_path.display(), e))
        })?;

        let mut state = self.state.lock().unwrap();
        state.pools.clear();
        for cart in state.cartridges.iter_mut() {
            cart.pool.clear();
        }
        for entry in conf.pools {
            let mut members = Vec::new();
            for tape_id in entry.cartridges {
                match state.cartridge_mut(&tape_id) {
                    Some(cart) if cart.pool.is_empty() => {
                        cart.pool = entry.name.clone();
                        members.push(tape_id);
                    }
                    Some(_) => {
                        warn!("tape {} already assigned, dropped from pool {}", tape_id, entry.name)
                    }
                    None => warn!("tape {} not found, dropped from pool {}", tape_id, entry.name),
                }
            }
            state.pools.push(Pool {
                name: entry.name,
                cartridges: members,
            });
        }
        Ok(())
    }

    fn write_pools_locked(&self, state: &InvState) -> DmResult<()> {
        let conf = PoolConfFile {
            pools: state
                .pools
                .iter()
                .map(|p| PoolConfEntry {
                    name: p.name.clone(),
                    cartridges: p.cartridges.clone(),
                })
                .collect(),
        };
        if let Some(parent) = self.pool_conf_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&conf)
            .map_err(|e| DmError::Config(e.to_string()))?;
        std::fs::write(&self.pool_conf_path, content)?;
        Ok(())
    }

    pub fn pool_create(&self, name: &str) -> DmResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.pool(name).is_some() {
            return Err(DmError::PoolExists(name.to_string()));
        }
        state.pools.push(Pool {
            name: name.to_string(),
            cartridges: Vec::new(),
        });
        self.write_pools_locked(&state)
    }

    pub fn pool_delete(&self, name: &str) -> DmResult<()> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .pools
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| DmError::PoolNotExists(name.to_string()))?;
        if !state.pools[pos].cartridges.is_empty() {
            return Err(DmError::PoolNotEmpty(name.to_string()));
        }
        state.pools.remove(pos);
        self.write_pools_locked(&state)
    }

    pub fn pool_add(&self, name: &str, tape_id: &str) -> DmResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.pool(name).is_none() {
            return Err(DmError::PoolNotExists(name.to_string()));
        }
        let cart = state
            .cartridge_mut(tape_id)
            .ok_or_else(|| DmError::TapeNotExists(tape_id.to_string()))?;
        if !cart.pool.is_empty() {
            return Err(DmError::TapeExistsInPool(tape_id.to_string()));
        }
        cart.pool = name.to_string();
        state
            .pool_mut(name)
            .ok_or_else(|| DmError::PoolNotExists(name.to_string()))?
            .cartridges
            .push(tape_id.to_string());
        self.write_pools_locked(&state)
    }

    pub fn pool_remove(&self, name: &str, tape_id: &str) -> DmResult<()> {
        let mut state = self.state.lock().unwrap();
        let pool = state
            .pool_mut(name)
            .ok_or_else(|| DmError::PoolNotExists(name.to_string()))?;
        let pos = pool
            .cartridges
            .iter()
            .position(|t| t == tape_id)
            .ok_or_else(|| DmError::TapeNotExistsInPool(tape_id.to_string()))?;
        pool.cartridges.remove(pos);
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.pool.clear();
        }
        self.write_pools_locked(&state)
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.state.lock().unwrap().pools.clone()
    }

    pub fn get_pool(&self, name: &str) -> Option<Pool> {
        self.state.lock().unwrap().pool(name).cloned()
    }

    pub fn drives(&self) -> Vec<Drive> {
        self.state.lock().unwrap().drives.clone()
    }

    pub fn cartridges(&self) -> Vec<Cartridge> {
        self.state.lock().unwrap().cartridges.clone()
    }

    pub fn get_cartridge(&self, tape_id: &str) -> Option<Cartridge> {
        self.state.lock().unwrap().cartridge(tape_id).cloned()
    }

    pub fn get_drive(&self, drive_id: &str) -> Option<Drive> {
        self.state.lock().unwrap().drive(drive_id).cloned()
    }

    pub fn request_exists(&self, req_num: i64, pool: &str) -> bool {
        self.state.lock().unwrap().request_exists(req_num, pool)
    }

    /// Re-read the physical library. Claims held by running workers are
    /// preserved; pool membership is re-applied and members no longer
    /// present in the library are dropped.
    pub async fn inventorize(&self) -> DmResult<()> {
        let drive_infos = self.library.load_drives().await?;
        let cart_infos = self.library.load_cartridges().await?;

        let mut state = self.state.lock().unwrap();

        let mut drives = Vec::with_capacity(drive_infos.len());
        for info in &drive_infos {
            match state.drive(&info.id) {
                Some(old) => {
                    let mut drive = old.clone();
                    drive.slot = info.slot;
                    drives.push(drive);
                }
                None => drives.push(Drive {
                    id: info.id.clone(),
                    slot: info.slot,
                    busy: false,
                    move_req: None,
                    to_unblock: None,
                }),
            }
        }
        for old in &state.drives {
            if old.busy && !drives.iter().any(|d| d.id == old.id) {
                warn!("drive {} disappeared while busy, keeping it", old.id);
                drives.push(old.clone());
            }
        }

        let mut cartridges = Vec::with_capacity(cart_infos.len());
        for info in &cart_infos {
            match state.cartridge(&info.id) {
                Some(old)
                    if matches!(old.state, CartridgeState::InUse | CartridgeState::Moving) =>
                {
                    // a worker holds it; trust the in-memory state
                    let mut cart = old.clone();
                    cart.total_cap = info.total_cap;
                    cartridges.push(cart);
                }
                Some(old) => {
                    let mut cart = cartridge_from_info(info, &drive_infos);
                    cart.pool = old.pool.clone();
                    cart.home_slot = old.home_slot;
                    cart.notify = old.notify.clone();
                    cartridges.push(cart);
                }
                None => cartridges.push(cartridge_from_info(info, &drive_infos)),
            }
        }

        state.drives = drives;
        state.cartridges = cartridges;

        let mut changed = false;
        for pool in state.pools.iter_mut() {
            let before = pool.cartridges.len();
            pool.cartridges
                .retain(|t| cart_infos.iter().any(|c| &c.id == t));
            if pool.cartridges.len() != before {
                changed = true;
            }
        }
        if changed {
            self.write_pools_locked(&state)?;
        }
        info!(
            "inventory refreshed: {} drives, {} cartridges",
            state.drives.len(),
            state.cartridges.len()
        );
        Ok(())
    }

    // ==================== worker-facing transitions ====================

    pub fn set_cartridge_state(&self, tape_id: &str, new_state: CartridgeState) {
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.state = new_state;
        }
    }

    /// Mount or move finished: the cartridge sits in the drive.
    pub fn finish_mount(&self, drive_id: &str, tape_id: &str) {
        let mut state = self.state.lock().unwrap();
        let slot = state.drive(drive_id).map(|d| d.slot);
        if let Some(cart) = state.cartridge_mut(tape_id) {
            if let Some(slot) = slot {
                cart.slot = slot;
            }
            cart.state = CartridgeState::Mounted;
            cart.notify.notify_waiters();
        }
        if let Some(drive) = state.drive_mut(drive_id) {
            drive.busy = false;
            drive.move_req = None;
        }
    }

    /// Unmount finished: the cartridge is back in its home slot.
    pub fn finish_unmount(&self, drive_id: &str, tape_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.slot = cart.home_slot;
            cart.state = CartridgeState::Unmounted;
            cart.notify.notify_waiters();
        }
        if let Some(drive) = state.drive_mut(drive_id) {
            drive.busy = false;
            drive.move_req = None;
        }
    }

    /// A failed move restores the prior cartridge state.
    pub fn fail_move(&self, drive_id: &str, tape_id: &str, prior: CartridgeState) {
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.state = prior;
            cart.notify.notify_waiters();
        }
        if let Some(drive) = state.drive_mut(drive_id) {
            drive.busy = false;
            drive.move_req = None;
        }
    }

    /// Worker hands its resources back: drive idle again, cartridge
    /// stays mounted for the next request.
    pub fn release_resources(&self, drive_id: &str, tape_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(drive) = state.drive_mut(drive_id) {
            drive.busy = false;
            drive.to_unblock = None;
        }
        if let Some(cart) = state.cartridge_mut(tape_id) {
            if cart.state == CartridgeState::InUse {
                cart.state = CartridgeState::Mounted;
            }
            cart.notify.notify_waiters();
        }
    }

    /// A fresh format restores the full capacity.
    pub fn refresh_after_format(&self, tape_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.remaining_cap = cart.total_cap;
            cart.status = crate::STATUS_OK.to_string();
        }
    }

    pub fn drive_to_unblock(&self, drive_id: &str) -> Option<OpKind> {
        let state = self.state.lock().unwrap();
        state.drive(drive_id).and_then(|d| d.to_unblock)
    }

    pub fn consume_capacity(&self, tape_id: &str, file_size: u64) {
        let mib = file_size.div_ceil(1024 * 1024);
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridge_mut(tape_id) {
            cart.remaining_cap = cart.remaining_cap.saturating_sub(mib);
        }
    }

    pub fn cartridge_notify(&self, tape_id: &str) -> Option<Arc<Notify>> {
        let state = self.state.lock().unwrap();
        state.cartridge(tape_id).map(|c| c.notify.clone())
    }

    /// Scheduler drain: wake every worker parked on a cartridge.
    pub fn notify_all_cartridges(&self) {
        let state = self.state.lock().unwrap();
        for cart in &state.cartridges {
            cart.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimLibrary;
    use ltfsdm_lib::{CartridgeConfigEntry, DriveConfigEntry, LibraryConfig};
    use tempfile::TempDir;

    fn library_config() -> LibraryConfig {
        LibraryConfig {
            drives: vec![
                DriveConfigEntry {
                    id: "D1".to_string(),
                    slot: 256,
                },
                DriveConfigEntry {
                    id: "D2".to_string(),
                    slot: 257,
                },
            ],
            cartridges: vec![
                CartridgeConfigEntry {
                    id: "T1".to_string(),
                    slot: 4096,
                    total_cap: 1000,
                    remaining_cap: 1000,
                    ..Default::default()
                },
                CartridgeConfigEntry {
                    id: "T2".to_string(),
                    slot: 4097,
                    total_cap: 1000,
                    remaining_cap: 500,
                    ..Default::default()
                },
            ],
            op_delay_ms: 0,
        }
    }

    async fn build_inventory(tmp: &TempDir) -> Inventory {
        let library = Arc::new(SimLibrary::new(&library_config()));
        Inventory::build(library, tmp.path().join("pools.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pool_create_delete_round_trip() {
        let tmp = TempDir::new().unwrap();
        let inv = build_inventory(&tmp).await;

        inv.pool_create("archive").unwrap();
        match inv.pool_create("archive") {
            Err(DmError::PoolExists(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        inv.pool_delete("archive").unwrap();
        assert!(inv.pools().is_empty());
        match inv.pool_delete("archive") {
            Err(DmError::PoolNotExists(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_add_remove_identity() {
        let tmp = TempDir::new().unwrap();
        let inv = build_inventory(&tmp).await;
        inv.pool_create("archive").unwrap();

        inv.pool_add("archive", "T1").unwrap();
        match inv.pool_add("archive", "T1") {
            Err(DmError::TapeExistsInPool(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match inv.pool_add("archive", "T9") {
            Err(DmError::TapeNotExists(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match inv.pool_delete("archive") {
            Err(DmError::PoolNotEmpty(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        inv.pool_remove("archive", "T1").unwrap();
        assert!(inv.get_cartridge("T1").unwrap().pool.is_empty());
        match inv.pool_remove("archive", "T1") {
            Err(DmError::TapeNotExistsInPool(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_membership_persisted() {
        let tmp = TempDir::new().unwrap();
        let library = Arc::new(SimLibrary::new(&library_config()));

        {
            let inv = Inventory::build(library.clone(), tmp.path().join("pools.json"))
                .await
                .unwrap();
            inv.pool_create("archive").unwrap();
            inv.pool_add("archive", "T2").unwrap();
            inv.pool_add("archive", "T1").unwrap();
        }

        let inv = Inventory::build(library, tmp.path().join("pools.json"))
            .await
            .unwrap();
        let pools = inv.pools();
        assert_eq!(pools.len(), 1);
        // configuration order preserved
        assert_eq!(pools[0].cartridges, vec!["T2".to_string(), "T1".to_string()]);
        assert_eq!(inv.get_cartridge("T1").unwrap().pool, "archive");
    }

    #[tokio::test]
    async fn test_make_use_claims_drive_and_cartridge() {
        let tmp = TempDir::new().unwrap();
        let inv = build_inventory(&tmp).await;

        inv.with_state(|state| {
            state.cartridge_mut("T1").unwrap().state = CartridgeState::Mounted;
            state.make_use("D1", "T1").unwrap();
        });
        assert!(inv.get_drive("D1").unwrap().busy);
        assert_eq!(inv.get_cartridge("T1").unwrap().state, CartridgeState::InUse);

        inv.release_resources("D1", "T1");
        assert!(!inv.get_drive("D1").unwrap().busy);
        assert_eq!(
            inv.get_cartridge("T1").unwrap().state,
            CartridgeState::Mounted
        );
    }

    #[tokio::test]
    async fn test_request_exists_matches_move_req() {
        let tmp = TempDir::new().unwrap();
        let inv = build_inventory(&tmp).await;

        assert!(!inv.request_exists(7, "archive"));
        inv.with_state(|state| {
            state.drive_mut("D1").unwrap().move_req = Some((7, "archive".to_string()));
        });
        assert!(inv.request_exists(7, "archive"));
        assert!(!inv.request_exists(7, "other"));
        assert!(!inv.request_exists(8, "archive"));
    }

    #[tokio::test]
    async fn test_inventorize_preserves_claims_and_pools() {
        let tmp = TempDir::new().unwrap();
        let inv = build_inventory(&tmp).await;
        inv.pool_create("archive").unwrap();
        inv.pool_add("archive", "T1").unwrap();

        inv.with_state(|state| {
            state.cartridge_mut("T1").unwrap().state = CartridgeState::InUse;
            state.drive_mut("D1").unwrap().busy = true;
        });

        inv.inventorize().await.unwrap();

        assert_eq!(inv.get_cartridge("T1").unwrap().state, CartridgeState::InUse);
        assert_eq!(inv.get_cartridge("T1").unwrap().pool, "archive");
        assert!(inv.get_drive("D1").unwrap().busy);
        assert_eq!(
            inv.get_cartridge("T2").unwrap().state,
            CartridgeState::Unmounted
        );
    }
}
