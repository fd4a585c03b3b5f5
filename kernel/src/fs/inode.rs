use super::extent::Extent;
use super::free_map::FreeMap;
use super::layout::{bytes_to_sectors, DiskInode, IndexBlock, SectorPosition, MAX_FILE_SIZE};
use super::{Error, Result, Volume};
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};
use log::{debug, info, warn};
use zerocopy::{AsBytes, FromZeroes};

/// In-memory state of an open inode.
struct InodeState {
    open_count: usize,
    /// Reclaim the inode when the last opener closes it.
    removed: bool,
    /// Writes are refused while this is non-zero.
    deny_write_count: usize,
    disk: DiskInode,
    index_cache: BTreeMap<BlockSector, IndexBlock>,
}

impl InodeState {
    fn extent<'a>(&'a mut self, device: &'a Block) -> Extent<'a> {
        Extent {
            disk: &mut self.disk,
            cache: &mut self.index_cache,
            device,
        }
    }
}

/// An open inode. Every opener of the same sector shares one `Inode`.
pub struct Inode {
    sector: BlockSector,
    volume: Arc<Volume>,
    state: Mutex<InodeState>,
}

impl Inode {
    /// The sector holding this inode's record.
    pub fn inumber(&self) -> BlockSector {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.state.lock().disk.length as usize
    }

    pub fn is_directory(&self) -> bool {
        self.state.lock().disk.is_directory != 0
    }

    pub fn parent(&self) -> BlockSector {
        self.state.lock().disk.parent
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Finds the device sector holding byte `offset`.
    ///
    /// Without `allocate`, offsets at or past the end of the file and unallocated sectors
    /// are [`Error::OutOfRange`]. With it, a missing sector is allocated and zeroed and
    /// the index is persisted before returning. The file length never changes.
    pub fn locate(&self, offset: usize, allocate: bool) -> Result<BlockSector> {
        let index = offset / BLOCK_SECTOR_SIZE;
        SectorPosition::of(index)?;

        let mut state = self.state.lock();
        if !allocate {
            if offset >= state.disk.length as usize {
                return Err(Error::OutOfRange);
            }
            return state
                .extent(&self.volume.device)
                .find(index)?
                .ok_or(Error::OutOfRange);
        }

        let mut free_map = self.volume.free_map.lock();
        let located = state.extent(&self.volume.device).find_or_allocate(
            index,
            &mut free_map,
            Some(self.sector),
        )?;
        Ok(located.sector)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short at end of file or when the device
    /// fails.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let mut state = self.state.lock();
        let length = state.disk.length as usize;
        let mut extent = state.extent(&self.volume.device);
        let mut bounce = [0u8; BLOCK_SECTOR_SIZE];
        let mut read = 0;

        while read < buf.len() {
            let pos = offset + read;
            if pos >= length {
                break;
            }
            let sector_ofs = pos % BLOCK_SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(length - pos)
                .min(BLOCK_SECTOR_SIZE - sector_ofs);

            let sector = match extent.find(pos / BLOCK_SECTOR_SIZE) {
                Ok(Some(sector)) => sector,
                Ok(None) => {
                    warn!("inode {}: hole at byte {pos} below length {length}", self.sector);
                    break;
                }
                Err(err) => {
                    warn!("inode {}: read stopped at byte {pos}: {err}", self.sector);
                    break;
                }
            };

            let result = if chunk == BLOCK_SECTOR_SIZE {
                self.volume.device.read(sector, &mut buf[read..read + chunk])
            } else {
                self.volume.device.read(sector, &mut bounce).map(|()| {
                    buf[read..read + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
                })
            };
            if let Err(err) = result {
                warn!("inode {}: read stopped at byte {pos}: {err}", self.sector);
                break;
            }
            read += chunk;
        }
        read
    }

    /// Writes `buf` starting at `offset`, growing the file as needed.
    ///
    /// Sectors between the old end of file and `offset` are allocated and zeroed first.
    /// Returns the number of bytes written: zero while writes are denied, and short when
    /// the device is full or the file reaches its maximum size.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut state = self.state.lock();
        if state.deny_write_count > 0 {
            return 0;
        }
        let end = offset.saturating_add(buf.len()).min(MAX_FILE_SIZE);
        if offset >= end {
            if !buf.is_empty() {
                warn!("inode {}: write at {offset} is past the maximum file size", self.sector);
            }
            return 0;
        }

        let old_length = state.disk.length as usize;
        let sector = self.sector;
        let device = &self.volume.device;
        let mut extent = state.extent(device);

        // fill the gap so reads below the new length never see stale data
        let first_touched = offset / BLOCK_SECTOR_SIZE;
        for index in bytes_to_sectors(old_length)..first_touched {
            let mut free_map = self.volume.free_map.lock();
            if let Err(err) = extent.find_or_allocate(index, &mut free_map, Some(sector)) {
                warn!("inode {sector}: could not extend to byte {offset}: {err}");
                return 0;
            }
        }

        let mut bounce = [0u8; BLOCK_SECTOR_SIZE];
        let mut written = 0;
        while offset + written < end {
            let pos = offset + written;
            let sector_ofs = pos % BLOCK_SECTOR_SIZE;
            let chunk = (end - pos).min(BLOCK_SECTOR_SIZE - sector_ofs);

            let located = {
                let mut free_map = self.volume.free_map.lock();
                extent.find_or_allocate(pos / BLOCK_SECTOR_SIZE, &mut free_map, Some(sector))
            };
            let located = match located {
                Ok(located) => located,
                Err(err) => {
                    warn!("inode {sector}: write stopped at byte {pos}: {err}");
                    break;
                }
            };

            let result = if chunk == BLOCK_SECTOR_SIZE {
                device.write(located.sector, &buf[written..written + chunk])
            } else {
                // a fresh sector is already zero on disk
                let staged = if located.fresh {
                    bounce.fill(0);
                    Ok(())
                } else {
                    device.read(located.sector, &mut bounce)
                };
                staged.and_then(|()| {
                    bounce[sector_ofs..sector_ofs + chunk]
                        .copy_from_slice(&buf[written..written + chunk]);
                    device.write(located.sector, &bounce)
                })
            };
            if let Err(err) = result {
                warn!("inode {sector}: write stopped at byte {pos}: {err}");
                break;
            }
            written += chunk;
        }

        if offset + written > old_length {
            extent.disk.length = (offset + written) as u32;
            if let Err(err) = device.write(sector, extent.disk.as_bytes()) {
                warn!("inode {sector}: could not store new length: {err}");
            }
        }
        written
    }

    /// Refuses writes until a matching [`Inode::allow_write`].
    ///
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_count += 1;
        assert!(state.deny_write_count <= state.open_count);
    }

    /// Undoes one [`Inode::deny_write`]. Each opener that denied writes must call this
    /// before closing the inode.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_count > 0);
        assert!(state.deny_write_count <= state.open_count);
        state.deny_write_count -= 1;
    }
}

/// A mounted filesystem: the volume plus the table of open inodes.
pub struct FileSystem {
    volume: Arc<Volume>,
    open_inodes: Mutex<BTreeMap<BlockSector, Arc<Inode>>>,
}

impl FileSystem {
    /// Sector of the root directory inode on a device of `device_sectors` sectors.
    pub fn root_dir_sector(device_sectors: BlockSector) -> BlockSector {
        FreeMap::map_sectors(device_sectors)
    }

    /// Writes an empty filesystem to `device`: the free map followed by an empty root
    /// directory.
    pub fn format(device: Arc<Block>) -> Result<Self> {
        info!("Formatting file system on \"{}\"", device.get_name());
        let mut free_map = FreeMap::format(device.clone())?;
        let root = free_map.allocate(1)?;
        debug_assert_eq!(root, Self::root_dir_sector(device.get_size()));
        device.write(root, DiskInode::new(0, true, root).as_bytes())?;

        Ok(Self::with_free_map(device, free_map))
    }

    /// Opens the filesystem already on `device`.
    pub fn mount(device: Arc<Block>) -> Result<Self> {
        let free_map = FreeMap::load(device.clone())?;
        let root = Self::root_dir_sector(device.get_size());
        if !Self::read_record(&device, root)?.is_valid() {
            return Err(Error::BadMagic(root));
        }
        info!(
            "Mounted file system on \"{}\", {} sectors free",
            device.get_name(),
            free_map.free_count()
        );
        Ok(Self::with_free_map(device, free_map))
    }

    fn with_free_map(device: Arc<Block>, free_map: FreeMap) -> Self {
        Self {
            volume: Arc::new(Volume {
                device,
                free_map: Mutex::new(free_map),
            }),
            open_inodes: Mutex::new(BTreeMap::new()),
        }
    }

    fn read_record(device: &Block, sector: BlockSector) -> Result<DiskInode> {
        let mut disk = DiskInode::new_zeroed();
        device.read(sector, disk.as_bytes_mut())?;
        Ok(disk)
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn root(&self) -> BlockSector {
        Self::root_dir_sector(self.volume.device.get_size())
    }

    /// Writes a new inode of `length` zero bytes to `sector`, whose parent is the root
    /// directory.
    pub fn create(&self, sector: BlockSector, length: usize, is_directory: bool) -> Result<()> {
        self.create_with_parent(sector, length, is_directory, self.root())
    }

    /// Allocates a sector for a new inode, writes the inode there, and returns the sector.
    ///
    /// On failure nothing stays allocated.
    pub fn create_inode(
        &self,
        length: usize,
        is_directory: bool,
        parent: BlockSector,
    ) -> Result<BlockSector> {
        let sector = self.volume.free_map.lock().allocate(1)?;
        if let Err(err) = self.create_with_parent(sector, length, is_directory, parent) {
            if let Err(release_err) = self.volume.free_map.lock().release(sector, 1) {
                warn!("could not release inode sector {sector}: {release_err}");
            }
            return Err(err);
        }
        Ok(sector)
    }

    fn create_with_parent(
        &self,
        sector: BlockSector,
        length: usize,
        is_directory: bool,
        parent: BlockSector,
    ) -> Result<()> {
        if length > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }
        let mut disk = DiskInode::new(0, is_directory, parent);
        let mut cache = BTreeMap::new();
        let mut extent = Extent {
            disk: &mut disk,
            cache: &mut cache,
            device: &self.volume.device,
        };

        let mut free_map = self.volume.free_map.lock();
        for index in 0..bytes_to_sectors(length) {
            if let Err(err) = extent.find_or_allocate(index, &mut free_map, None) {
                if let Err(reclaim_err) = extent.reclaim(&mut free_map) {
                    warn!("could not roll back inode {sector}: {reclaim_err}");
                }
                return Err(err);
            }
        }
        drop(free_map);

        disk.length = length as u32;
        if let Err(err) = self.volume.device.write(sector, disk.as_bytes()) {
            let mut free_map = self.volume.free_map.lock();
            let mut extent = Extent {
                disk: &mut disk,
                cache: &mut cache,
                device: &self.volume.device,
            };
            if let Err(reclaim_err) = extent.reclaim(&mut free_map) {
                warn!("could not roll back inode {sector}: {reclaim_err}");
            }
            return Err(err.into());
        }
        debug!("created inode {sector} of {length} bytes");
        Ok(())
    }

    /// Opens the inode stored at `sector`, sharing the handle with earlier openers.
    pub fn open(&self, sector: BlockSector) -> Result<Arc<Inode>> {
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.get(&sector) {
            inode.state.lock().open_count += 1;
            return Ok(inode.clone());
        }

        let disk = Self::read_record(&self.volume.device, sector)?;
        if !disk.is_valid() {
            return Err(Error::BadMagic(sector));
        }
        let inode = Arc::new(Inode {
            sector,
            volume: self.volume.clone(),
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk,
                index_cache: BTreeMap::new(),
            }),
        });
        open_inodes.insert(sector, inode.clone());
        Ok(inode)
    }

    /// Opens `inode` once more.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _open_inodes = self.open_inodes.lock();
        inode.state.lock().open_count += 1;
        inode.clone()
    }

    /// Closes one opener of `inode`. The last close of a removed inode gives every sector
    /// it owns, its own included, back to the free map.
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        let mut open_inodes = self.open_inodes.lock();
        let mut state = inode.state.lock();
        assert!(state.open_count > 0);
        state.open_count -= 1;
        if state.open_count > 0 {
            return Ok(());
        }
        open_inodes.remove(&inode.sector);

        // the registry stays locked so no opener can read the record before it is erased
        if state.removed {
            self.volume
                .device
                .write(inode.sector, DiskInode::new_zeroed().as_bytes())?;
            let mut free_map = self.volume.free_map.lock();
            let released = state
                .extent(&self.volume.device)
                .reclaim(&mut free_map)?;
            free_map.release(inode.sector, 1)?;
            debug!(
                "reclaimed inode {} and {released} sector(s)",
                inode.sector
            );
        }
        Ok(())
    }

    /// Marks `inode` for deletion once its last opener closes it.
    pub fn remove(&self, inode: &Inode) {
        inode.state.lock().removed = true;
    }

    /// Number of distinct inodes currently open.
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }
}
