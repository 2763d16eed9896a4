use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{MachineError, MachineResult};
use crate::interrupt::Machine;
use crate::pending::InterruptKind;
use crate::stats::{Tick, TickParams};
use crate::storage::SectorStorage;

/// Magic prefix of a disk image, so a useful host file is unlikely to be
/// mistaken for one and trashed.
pub const DISK_MAGIC: u32 = 0x456789AB;
const MAGIC_SIZE: u64 = 4;

/// Single-surface disk layout: tracks of equal-size sectors, addressed by a
/// flat sector number `track * sectors_per_track + offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub sector_size: u32,
    pub sectors_per_track: u32,
    pub num_tracks: u32,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self {
            sector_size: 128,
            sectors_per_track: 32,
            num_tracks: 32,
        }
    }
}

impl DiskGeometry {
    pub const fn num_sectors(&self) -> u32 {
        self.sectors_per_track * self.num_tracks
    }

    const fn image_len(&self) -> u64 {
        MAGIC_SIZE + self.num_sectors() as u64 * self.sector_size as u64
    }

    fn track(&self, sector: u32) -> u32 {
        sector / self.sectors_per_track
    }

    /// Sectors of rotational delay from the head position `from` (a sector
    /// index, possibly on another track) to the target sector `to`. Always in
    /// `[0, sectors_per_track)`.
    pub fn modulo_diff(&self, to: u32, from: u64) -> u32 {
        let spt = self.sectors_per_track;
        let to_offset = to % spt;
        let from_offset = (from % u64::from(spt)) as u32;
        (to_offset + spt - from_offset) % spt
    }

    /// Seek cost plus the rotation needed to reach the next sector boundary
    /// once the seek lands, from `last_sector` to `new_sector` starting at
    /// `now`.
    fn seek_rotation(&self, params: &TickParams, now: Tick, last_sector: u32, new_sector: u32) -> (Tick, Tick) {
        let tracks = self.track(new_sector).abs_diff(self.track(last_sector));
        let seek = Tick::from(tracks) * params.seek_time;
        let over = (now + seek) % params.rotation_time;
        let rotation = if over > 0 {
            params.rotation_time - over
        } else {
            0
        };
        (seek, rotation)
    }

    /// How long a request issued at `now` takes: seek time, rotational
    /// latency until the target sector passes under the head, and one
    /// rotation time to transfer it.
    ///
    /// With `track_buffer` set, a read on the current track whose sector the
    /// head has already swept past (since the buffer started filling at
    /// `buffer_init`) is served from the track buffer in one transfer time.
    #[allow(clippy::too_many_arguments)]
    pub fn request_latency(
        &self,
        params: &TickParams,
        now: Tick,
        last_sector: u32,
        buffer_init: Tick,
        new_sector: u32,
        writing: bool,
        track_buffer: bool,
    ) -> Tick {
        let (seek, mut rotation) = self.seek_rotation(params, now, last_sector, new_sector);
        let time_after = now + seek + rotation;

        if track_buffer
            && !writing
            && seek == 0
            && time_after.saturating_sub(buffer_init) / params.rotation_time
                > Tick::from(self.modulo_diff(new_sector, buffer_init / params.rotation_time))
        {
            return params.rotation_time;
        }

        rotation +=
            Tick::from(self.modulo_diff(new_sector, time_after / params.rotation_time)) * params.rotation_time;
        seek + rotation + params.rotation_time
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DiskConfig {
    pub geometry: DiskGeometry,
    /// Serve re-reads of the current track from a simulated track buffer.
    pub track_buffer: bool,
}

struct DiskState {
    storage: Box<dyn SectorStorage>,
    /// Is a request outstanding? The device accepts one at a time.
    active: bool,
    last_sector: u32,
    /// When the track buffer started filling after the most recent seek.
    buffer_init: Tick,
}

/// Asynchronous single-sector disk device.
///
/// A request transfers against the backing store immediately and completes
/// later in simulated time: the supplied handler is invoked, with interrupts
/// disabled, once the modelled seek + rotation + transfer latency elapses.
/// Only then may the next request be issued.
pub struct Disk {
    machine: Arc<Machine>,
    config: DiskConfig,
    handler: Box<dyn Fn() + Send + Sync>,
    state: Mutex<DiskState>,
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk").field("config", &self.config).finish()
    }
}

impl Disk {
    /// Opens (or creates, zero-filled) the disk image held by `storage` and
    /// returns the device. `handler` runs every time a request completes.
    pub fn open(
        machine: Arc<Machine>,
        config: DiskConfig,
        mut storage: Box<dyn SectorStorage>,
        handler: impl Fn() + Send + Sync + 'static,
    ) -> MachineResult<Arc<Self>> {
        debug!("initializing the disk");
        if storage.is_empty()? {
            storage.write_at(0, &DISK_MAGIC.to_be_bytes())?;
            storage.set_len(config.geometry.image_len())?;
            storage.flush()?;
        } else {
            let mut magic = [0u8; MAGIC_SIZE as usize];
            storage.read_at(0, &mut magic)?;
            let found = u32::from_be_bytes(magic);
            if found != DISK_MAGIC {
                return Err(MachineError::BadDiskImage {
                    found,
                    expected: DISK_MAGIC,
                });
            }
        }

        Ok(Arc::new(Self {
            machine,
            config,
            handler: Box::new(handler),
            state: Mutex::new(DiskState {
                storage,
                active: false,
                last_sector: 0,
                buffer_init: 0,
            }),
        }))
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.config.geometry
    }

    /// Is a request outstanding?
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Reads `sector` into `buf` and schedules the completion interrupt.
    ///
    /// # Panics
    ///
    /// Panics if a request is already outstanding, if `sector` is out of
    /// range, if `buf` is not exactly one sector, or if the backing store
    /// fails (the simulation cannot continue without its disk).
    pub fn read_request(self: &Arc<Self>, sector: u32, buf: &mut [u8]) {
        debug!(sector, "disk read request");
        assert_eq!(
            buf.len(),
            self.config.geometry.sector_size as usize,
            "disk transfers are whole sectors"
        );
        let latency = self.start_request(sector, false, |storage, offset| {
            storage.read_at(offset, buf)
        });
        self.machine.with_stats(|stats| stats.num_disk_reads += 1);
        self.schedule_completion(latency);
    }

    /// Writes `buf` to `sector` and schedules the completion interrupt.
    ///
    /// # Panics
    ///
    /// As for [`read_request`](Self::read_request).
    pub fn write_request(self: &Arc<Self>, sector: u32, buf: &[u8]) {
        debug!(sector, "disk write request");
        assert_eq!(
            buf.len(),
            self.config.geometry.sector_size as usize,
            "disk transfers are whole sectors"
        );
        let latency = self.start_request(sector, true, |storage, offset| {
            storage.write_at(offset, buf)
        });
        self.machine.with_stats(|stats| stats.num_disk_writes += 1);
        self.schedule_completion(latency);
    }

    fn start_request(
        &self,
        sector: u32,
        writing: bool,
        transfer: impl FnOnce(&mut dyn SectorStorage, u64) -> MachineResult<()>,
    ) -> Tick {
        let geometry = self.config.geometry;
        assert!(
            sector < geometry.num_sectors(),
            "disk sector {sector} out of range"
        );

        let mut st = self.state.lock().unwrap();
        assert!(!st.active, "disk request while another is outstanding");

        let now = self.machine.now();
        let params = self.machine.params();
        let latency = geometry.request_latency(
            params,
            now,
            st.last_sector,
            st.buffer_init,
            sector,
            writing,
            self.config.track_buffer,
        );

        let offset = MAGIC_SIZE + u64::from(sector) * u64::from(geometry.sector_size);
        if let Err(err) = transfer(st.storage.as_mut(), offset) {
            panic!("disk backing store transfer failed: {err}");
        }

        st.active = true;
        let (seek, rotation) = geometry.seek_rotation(params, now, st.last_sector, sector);
        if seek != 0 {
            st.buffer_init = now + seek + rotation;
        }
        st.last_sector = sector;
        latency
    }

    fn schedule_completion(self: &Arc<Self>, latency: Tick) {
        debug!(latency, "disk request latency");
        let weak = Arc::downgrade(self);
        self.machine
            .schedule(latency, InterruptKind::Disk, move || {
                if let Some(disk) = weak.upgrade() {
                    disk.complete();
                }
            });
    }

    fn complete(&self) {
        self.state.lock().unwrap().active = false;
        (self.handler)();
    }
}
