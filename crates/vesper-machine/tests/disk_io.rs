use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use vesper_machine::{
    Disk, DiskConfig, DiskGeometry, FileBackend, Machine, MachineConfig, MachineError, MemBackend,
    SectorStorage,
};

fn machine() -> Arc<Machine> {
    let machine = Machine::new(MachineConfig::default());
    machine.enable();
    machine
}

fn drive_until_set(machine: &Machine, flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        machine.one_tick();
    }
    flag.store(false, Ordering::Relaxed);
}

fn open_mem_disk(machine: &Arc<Machine>) -> (Arc<Disk>, Arc<AtomicBool>) {
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let disk = Disk::open(
        Arc::clone(machine),
        DiskConfig::default(),
        Box::new(MemBackend::new()),
        move || flag.store(true, Ordering::Relaxed),
    )
    .unwrap();
    (disk, done)
}

#[test]
fn write_then_read_round_trips_a_sector() {
    let machine = machine();
    let (disk, done) = open_mem_disk(&machine);
    let geometry = disk.geometry();
    let params = *machine.params();

    let pattern: Vec<u8> = (0..geometry.sector_size).map(|i| i as u8).collect();
    let issued_at = machine.now();
    let write_latency =
        geometry.request_latency(&params, issued_at, 0, 0, 5, true, false);

    disk.write_request(5, &pattern);
    assert!(disk.is_active());
    drive_until_set(&machine, &done);
    assert!(!disk.is_active());
    assert!(machine.now() >= issued_at + write_latency);

    let mut buf = vec![0u8; geometry.sector_size as usize];
    disk.read_request(5, &mut buf);
    drive_until_set(&machine, &done);
    assert_eq!(buf, pattern);

    let stats = machine.stats();
    assert_eq!(stats.num_disk_reads, 1);
    assert_eq!(stats.num_disk_writes, 1);
}

#[test]
fn round_trip_survives_intervening_seeks() {
    let machine = machine();
    let (disk, done) = open_mem_disk(&machine);
    let sector_size = disk.geometry().sector_size as usize;

    let pattern = vec![0x5Au8; sector_size];
    disk.write_request(9, &pattern);
    drive_until_set(&machine, &done);

    // Drag the head across the disk before re-reading.
    let mut scratch = vec![0u8; sector_size];
    for sector in [1000, 33, 512] {
        disk.read_request(sector, &mut scratch);
        drive_until_set(&machine, &done);
    }

    let mut buf = vec![0u8; sector_size];
    disk.read_request(9, &mut buf);
    drive_until_set(&machine, &done);
    assert_eq!(buf, pattern);
}

#[test]
fn fresh_image_reads_zero_filled_sectors() {
    let machine = machine();
    let (disk, done) = open_mem_disk(&machine);
    let sector_size = disk.geometry().sector_size as usize;

    let mut buf = vec![0xFFu8; sector_size];
    disk.read_request(77, &mut buf);
    drive_until_set(&machine, &done);
    assert_eq!(buf, vec![0u8; sector_size]);
}

#[test]
fn image_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let geometry = DiskGeometry::default();
    let pattern = vec![0xC3u8; geometry.sector_size as usize];

    {
        let machine = machine();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let disk = Disk::open(
            Arc::clone(&machine),
            DiskConfig::default(),
            Box::new(FileBackend::open(&path).unwrap()),
            move || flag.store(true, Ordering::Relaxed),
        )
        .unwrap();
        disk.write_request(12, &pattern);
        drive_until_set(&machine, &done);
    }

    // The image is magic-prefixed and fully sized on creation.
    let expected_len = 4 + u64::from(geometry.num_sectors()) * u64::from(geometry.sector_size);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len);

    let machine = machine();
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let disk = Disk::open(
        Arc::clone(&machine),
        DiskConfig::default(),
        Box::new(FileBackend::open(&path).unwrap()),
        move || flag.store(true, Ordering::Relaxed),
    )
    .unwrap();
    let mut buf = vec![0u8; geometry.sector_size as usize];
    disk.read_request(12, &mut buf);
    drive_until_set(&machine, &done);
    assert_eq!(buf, pattern);
}

#[test]
fn foreign_file_is_rejected_by_magic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-disk.img");
    std::fs::write(&path, b"definitely not a disk image").unwrap();

    let err = Disk::open(
        machine(),
        DiskConfig::default(),
        Box::new(FileBackend::open(&path).unwrap()),
        || {},
    )
    .unwrap_err();
    assert!(matches!(err, MachineError::BadDiskImage { .. }));
}

#[test]
fn completion_order_of_stats_and_handler_is_consistent() {
    let machine = machine();
    let observed = Arc::new(Mutex::new(None));
    let observed_in_handler = Arc::clone(&observed);
    let stats_machine = Arc::clone(&machine);
    let disk = Disk::open(
        Arc::clone(&machine),
        DiskConfig::default(),
        Box::new(MemBackend::new()),
        move || {
            *observed_in_handler.lock().unwrap() =
                Some(stats_machine.stats().num_disk_writes);
        },
    )
    .unwrap();

    let pattern = vec![0u8; disk.geometry().sector_size as usize];
    disk.write_request(0, &pattern);
    while observed.lock().unwrap().is_none() {
        machine.one_tick();
    }
    // The write was already counted when its completion handler ran.
    assert_eq!(observed.lock().unwrap().unwrap(), 1);
}

#[test]
#[should_panic(expected = "another is outstanding")]
fn overlapping_requests_are_a_kernel_bug() {
    let machine = machine();
    let (disk, _done) = open_mem_disk(&machine);
    let pattern = vec![0u8; disk.geometry().sector_size as usize];
    disk.write_request(0, &pattern);
    disk.write_request(1, &pattern);
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_sector_is_a_kernel_bug() {
    let machine = machine();
    let (disk, _done) = open_mem_disk(&machine);
    let sectors = disk.geometry().num_sectors();
    let mut buf = vec![0u8; disk.geometry().sector_size as usize];
    disk.read_request(sectors, &mut buf);
}

#[test]
fn mem_backend_contents_reflect_writes() {
    let mut backend = MemBackend::new();
    backend.write_at(0, &[1, 2, 3]).unwrap();
    assert_eq!(&backend.as_slice()[..3], &[1, 2, 3]);
}
