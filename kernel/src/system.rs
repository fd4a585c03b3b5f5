use crate::block::block_core::{BlockDriver, BlockManager, BlockType};
use crate::config::SystemConfig;
use crate::drivers::ram_disk::RamDisk;
use crate::fs::{self, FileSystem};
use crate::mem::address_space::AddressSpace;
use crate::mem::frame_allocator::PagePool;
use crate::mem::VirtualMemory;
use crate::swapping::SwapStore;
use alloc::{boxed::Box, sync::Arc};
use log::info;
use once_cell::race::OnceBox;
use thiserror::Error;
use vmstore_shared::mem::SECTORS_PER_PAGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("file system: {0}")]
    Fs(#[from] fs::Error),
}

/// Everything the storage and VM engines share, created once at boot.
pub struct SystemState {
    pub block_manager: BlockManager,
    pub filesystem: FileSystem,
    pub vm: Arc<VirtualMemory>,
    config: SystemConfig,
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

impl SystemState {
    /// Creates the filesystem and swap devices, formats the filesystem and sets up the
    /// VM engine.
    pub fn boot(config: &SystemConfig) -> Result<Self, BootError> {
        if config.user_frames == 0 {
            return Err(BootError::Config("no user frames"));
        }
        if (config.swap_sectors as usize) < SECTORS_PER_PAGE {
            return Err(BootError::Config("swap device smaller than a page"));
        }

        let mut block_manager = BlockManager::new();
        let fs_device = block_manager.register_block(
            BlockType::FileSystem,
            "hda",
            BlockDriver::Ram(RamDisk::new(config.fs_sectors)),
        );
        let swap_device = block_manager.register_block(
            BlockType::Swap,
            "hdb",
            BlockDriver::Ram(RamDisk::new(config.swap_sectors)),
        );

        let filesystem = FileSystem::format(fs_device)?;
        let pages = Arc::new(PagePool::new(
            config.user_frames,
            config.placement.algorithm(),
        ));
        let vm = Arc::new(VirtualMemory::new(
            pages,
            Arc::new(SwapStore::new(swap_device)),
            config.eviction.policy(config.eviction_seed),
        ));
        info!(
            "Booted with {} user frames, {:?} placement, {:?} eviction",
            config.user_frames, config.placement, config.eviction
        );

        Ok(Self {
            block_manager,
            filesystem,
            vm,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn new_address_space(&self) -> AddressSpace {
        AddressSpace::new(self.vm.clone())
    }

    /// Logs device and memory statistics.
    pub fn shutdown(&self) {
        info!("{}", self.block_manager);
        info!(
            "{} of {} user frames free, {} of {} swap slots free",
            self.vm.page_pool().free_frames(),
            self.vm.page_pool().frame_count(),
            self.vm.swap().free_slots(),
            self.vm.swap().slot_count()
        );
    }
}

/// Boots the system once; later calls return the running system.
pub fn init(config: &SystemConfig) -> Result<&'static SystemState, BootError> {
    SYSTEM.get_or_try_init(|| SystemState::boot(config).map(Box::new))
}

pub fn system() -> Option<&'static SystemState> {
    SYSTEM.get()
}

pub fn unwrap_system() -> &'static SystemState {
    system().expect("System not initialized.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionPolicy;

    fn small() -> SystemConfig {
        SystemConfig {
            fs_sectors: 2048,
            swap_sectors: 64,
            user_frames: 4,
            eviction: EvictionPolicy::Clock,
            ..SystemConfig::default()
        }
    }

    #[test]
    fn boot_registers_one_device_per_role() {
        let state = SystemState::boot(&small()).unwrap();
        let fs = state.block_manager.by_role(BlockType::FileSystem).unwrap();
        let swap = state.block_manager.by_role(BlockType::Swap).unwrap();
        assert_eq!(fs.get_size(), 2048);
        assert_eq!(swap.get_size(), 64);
        assert_eq!(state.vm.swap().slot_count(), 8);
        assert_eq!(state.vm.page_pool().frame_count(), 4);
        assert_eq!(state.config().eviction, EvictionPolicy::Clock);
    }

    #[test]
    fn files_map_into_address_spaces() {
        let state = SystemState::boot(&small()).unwrap();
        let fs = &state.filesystem;
        let inode = fs.open(fs.create_inode(0, false, fs.root()).unwrap()).unwrap();
        inode.write_at(b"\x7fELF", 0);

        let space = state.new_address_space();
        space
            .load_segment(&inode, 0, 0x0804_8000, 4, 4092, false)
            .unwrap();
        let mut magic = [0u8; 4];
        space.read_user(0x0804_8000, &mut magic).unwrap();
        assert_eq!(&magic, b"\x7fELF");
        state.shutdown();
    }

    #[test]
    fn bad_configurations_are_rejected() {
        let config = SystemConfig {
            user_frames: 0,
            ..small()
        };
        assert!(matches!(
            SystemState::boot(&config),
            Err(BootError::Config(_))
        ));
        let config = SystemConfig {
            fs_sectors: 1,
            ..small()
        };
        assert!(matches!(
            SystemState::boot(&config),
            Err(BootError::Fs(fs::Error::DeviceTooSmall(1)))
        ));
    }

    #[test]
    fn global_system_boots_once() {
        let first = init(&small()).unwrap();
        let second = init(&SystemConfig::default()).unwrap();
        assert!(core::ptr::eq(first, second));
        assert_eq!(unwrap_system().config().user_frames, 4);
        assert!(system().is_some());
    }
}
