use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ltfsdm_lib::{CartridgeConfigEntry, DmError, DmResult, LibraryConfig};

pub const STATUS_OK: &str = "ok";
pub const STATUS_UNFORMATTED: &str = "unformatted";
pub const STATUS_WRITE_PROTECTED: &str = "write protected";
pub const STATUS_INACCESSIBLE: &str = "not accessible";

#[derive(Debug, Clone)]
pub struct DriveInfo {
    pub id: String,
    pub slot: u64,
}

#[derive(Debug, Clone)]
pub struct CartridgeInfo {
    pub id: String,
    pub slot: u64,
    /// Capacities in MiB.
    pub total_cap: u64,
    pub remaining_cap: u64,
    pub status: String,
}

/// The physical library and drive interface the core schedules against.
/// Moving media and transferring data happen behind this boundary; the
/// scheduler only sees slots, capacities and errors.
#[async_trait]
pub trait TapeLibrary: Send + Sync {
    async fn load_drives(&self) -> DmResult<Vec<DriveInfo>>;
    async fn load_cartridges(&self) -> DmResult<Vec<CartridgeInfo>>;

    /// Move a cartridge into a drive and mount its volume.
    async fn mount(&self, drive_id: &str, tape_id: &str) -> DmResult<()>;
    /// Unmount the volume and move the cartridge back to its home slot.
    async fn unmount(&self, drive_id: &str, tape_id: &str) -> DmResult<()>;
    /// Move a cartridge into a drive without mounting the volume, for
    /// format and check operations.
    async fn move_to_drive(&self, drive_id: &str, tape_id: &str) -> DmResult<()>;

    async fn format(&self, drive_id: &str, tape_id: &str) -> DmResult<()>;
    async fn check(&self, drive_id: &str, tape_id: &str) -> DmResult<()>;

    /// Transfer one file to the mounted cartridge.
    async fn write_file(
        &self,
        drive_id: &str,
        tape_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> DmResult<()>;
    /// Transfer one file back from the mounted cartridge.
    async fn read_file(
        &self,
        drive_id: &str,
        tape_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> DmResult<()>;
}

struct SimCartridge {
    entry: CartridgeConfigEntry,
    home_slot: u64,
    cur_slot: u64,
}

impl SimCartridge {
    fn status(&self) -> &'static str {
        if !self.entry.accessible {
            STATUS_INACCESSIBLE
        } else if self.entry.write_protected {
            STATUS_WRITE_PROTECTED
        } else if !self.entry.formatted {
            STATUS_UNFORMATTED
        } else {
            STATUS_OK
        }
    }
}

struct SimState {
    drives: Vec<DriveInfo>,
    cartridges: Vec<SimCartridge>,
}

/// In-memory library used for development and tests. Behaves like a
/// small changer: slots are authoritative, operations take an optional
/// configured delay, and error states come from the config flags.
pub struct SimLibrary {
    state: Mutex<SimState>,
    op_delay: Duration,
}

impl SimLibrary {
    pub fn new(config: &LibraryConfig) -> SimLibrary {
        let drives = config
            .drives
            .iter()
            .map(|d| DriveInfo {
                id: d.id.clone(),
                slot: d.slot,
            })
            .collect();
        let cartridges = config
            .cartridges
            .iter()
            .map(|c| SimCartridge {
                entry: c.clone(),
                home_slot: c.slot,
                cur_slot: c.slot,
            })
            .collect();
        SimLibrary {
            state: Mutex::new(SimState { drives, cartridges }),
            op_delay: Duration::from_millis(config.op_delay_ms),
        }
    }

    async fn delay(&self) {
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
    }

    fn with_cartridge<R>(
        &self,
        tape_id: &str,
        f: impl FnOnce(&mut SimCartridge, &[DriveInfo]) -> DmResult<R>,
    ) -> DmResult<R> {
        let mut state = self.state.lock().unwrap();
        let SimState { drives, cartridges } = &mut *state;
        let cart = cartridges
            .iter_mut()
            .find(|c| c.entry.id == tape_id)
            .ok_or_else(|| DmError::TapeNotExists(tape_id.to_string()))?;
        f(cart, drives)
    }

    fn drive_slot(drives: &[DriveInfo], drive_id: &str) -> DmResult<u64> {
        drives
            .iter()
            .find(|d| d.id == drive_id)
            .map(|d| d.slot)
            .ok_or_else(|| DmError::Internal(format!("unknown drive {}", drive_id)))
    }

    /// Test hook: flip the accessibility of a cartridge.
    pub fn set_accessible(&self, tape_id: &str, accessible: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(cart) = state.cartridges.iter_mut().find(|c| c.entry.id == tape_id) {
            cart.entry.accessible = accessible;
        }
    }
}

#[async_trait]
impl TapeLibrary for SimLibrary {
    async fn load_drives(&self) -> DmResult<Vec<DriveInfo>> {
        Ok(self.state.lock().unwrap().drives.clone())
    }

    async fn load_cartridges(&self) -> DmResult<Vec<CartridgeInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .cartridges
            .iter()
            .map(|c| CartridgeInfo {
                id: c.entry.id.clone(),
                slot: c.cur_slot,
                total_cap: c.entry.total_cap,
                remaining_cap: c.entry.remaining_cap,
                status: c.status().to_string(),
            })
            .collect())
    }

    async fn mount(&self, drive_id: &str, tape_id: &str) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, drives| {
            if !cart.entry.accessible {
                return Err(DmError::Inaccessible(tape_id.to_string()));
            }
            cart.cur_slot = Self::drive_slot(drives, drive_id)?;
            Ok(())
        })
    }

    async fn unmount(&self, drive_id: &str, tape_id: &str) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, drives| {
            let slot = Self::drive_slot(drives, drive_id)?;
            if cart.cur_slot != slot {
                return Err(DmError::TapeStateErr(format!(
                    "{} not in drive {}",
                    tape_id, drive_id
                )));
            }
            cart.cur_slot = cart.home_slot;
            Ok(())
        })
    }

    async fn move_to_drive(&self, drive_id: &str, tape_id: &str) -> DmResult<()> {
        self.mount(drive_id, tape_id).await
    }

    async fn format(&self, _drive_id: &str, tape_id: &str) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, _| {
            if !cart.entry.accessible {
                return Err(DmError::Inaccessible(tape_id.to_string()));
            }
            if cart.entry.write_protected {
                return Err(DmError::WriteProtected(tape_id.to_string()));
            }
            if cart.entry.formatted {
                return Err(DmError::AlreadyFormatted(tape_id.to_string()));
            }
            cart.entry.formatted = true;
            cart.entry.remaining_cap = cart.entry.total_cap;
            Ok(())
        })
    }

    async fn check(&self, _drive_id: &str, tape_id: &str) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, _| {
            if !cart.entry.accessible {
                return Err(DmError::Inaccessible(tape_id.to_string()));
            }
            if !cart.entry.formatted {
                return Err(DmError::TapeStateErr(format!("{} is unformatted", tape_id)));
            }
            Ok(())
        })
    }

    async fn write_file(
        &self,
        drive_id: &str,
        tape_id: &str,
        _file_name: &str,
        file_size: u64,
    ) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, drives| {
            let slot = Self::drive_slot(drives, drive_id)?;
            if cart.cur_slot != slot {
                return Err(DmError::TapeStateErr(format!(
                    "{} not in drive {}",
                    tape_id, drive_id
                )));
            }
            if !cart.entry.accessible {
                return Err(DmError::Inaccessible(tape_id.to_string()));
            }
            if cart.entry.write_protected {
                return Err(DmError::WriteProtected(tape_id.to_string()));
            }
            let mib = file_size.div_ceil(1024 * 1024);
            cart.entry.remaining_cap = cart.entry.remaining_cap.saturating_sub(mib);
            Ok(())
        })
    }

    async fn read_file(
        &self,
        drive_id: &str,
        tape_id: &str,
        _file_name: &str,
        _file_size: u64,
    ) -> DmResult<()> {
        self.delay().await;
        self.with_cartridge(tape_id, |cart, drives| {
            let slot = Self::drive_slot(drives, drive_id)?;
            if cart.cur_slot != slot {
                return Err(DmError::TapeStateErr(format!(
                    "{} not in drive {}",
                    tape_id, drive_id
                )));
            }
            if !cart.entry.accessible {
                return Err(DmError::Inaccessible(tape_id.to_string()));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltfsdm_lib::{CartridgeConfigEntry, DriveConfigEntry};

    fn small_library() -> SimLibrary {
        SimLibrary::new(&LibraryConfig {
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
            op_delay_ms: 0,
        })
    }

    #[tokio::test]
    async fn test_mount_moves_cartridge_to_drive_slot() {
        let lib = small_library();
        lib.mount("D1", "T1").await.unwrap();
        let carts = lib.load_cartridges().await.unwrap();
        assert_eq!(carts[0].slot, 256);

        lib.unmount("D1", "T1").await.unwrap();
        let carts = lib.load_cartridges().await.unwrap();
        assert_eq!(carts[0].slot, 4096);
    }

    #[tokio::test]
    async fn test_write_requires_mounted_cartridge() {
        let lib = small_library();
        assert!(lib.write_file("D1", "T1", "/data/a", 1024).await.is_err());

        lib.mount("D1", "T1").await.unwrap();
        lib.write_file("D1", "T1", "/data/a", 10 * 1024 * 1024)
            .await
            .unwrap();
        let carts = lib.load_cartridges().await.unwrap();
        assert_eq!(carts[0].remaining_cap, 990);
    }

    #[tokio::test]
    async fn test_format_errors() {
        let lib = small_library();
        match lib.format("D1", "T1").await {
            Err(DmError::AlreadyFormatted(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        lib.set_accessible("T1", false);
        match lib.mount("D1", "T1").await {
            Err(DmError::Inaccessible(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
