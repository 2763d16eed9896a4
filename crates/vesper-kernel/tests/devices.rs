use std::sync::Arc;

use pretty_assertions::assert_eq;
use vesper_kernel::{Kernel, KernelConfig, Semaphore};
use vesper_machine::{
    Console, Disk, DiskConfig, HaltMode, HaltSignal, MachineError, MemBackend, ScriptedSource,
    SharedSink,
};

fn kernel() -> Arc<Kernel> {
    Kernel::new(KernelConfig {
        halt: HaltMode::Signal(HaltSignal::new()),
        ..KernelConfig::default()
    })
}

#[test]
fn synchronous_disk_round_trip_through_a_semaphore() {
    let kernel = kernel();
    kernel.adopt_main();

    // The classic synchronous-disk pattern: the completion handler Vs a
    // semaphore the requesting thread Ps.
    let done = Semaphore::new("disk-done", &kernel, 0);
    let completion = Arc::clone(&done);
    let disk = Disk::open(
        Arc::clone(kernel.machine()),
        DiskConfig::default(),
        Box::new(MemBackend::new()),
        move || completion.v(),
    )
    .unwrap();

    let geometry = disk.geometry();
    let params = *kernel.machine().params();
    let pattern: Vec<u8> = (0..geometry.sector_size).map(|i| (i * 3) as u8).collect();

    let issued_at = kernel.machine().now();
    let write_latency = geometry.request_latency(&params, issued_at, 0, 0, 5, true, false);
    disk.write_request(5, &pattern);
    done.p();
    assert!(kernel.machine().now() >= issued_at + write_latency);

    let mut buf = vec![0u8; geometry.sector_size as usize];
    disk.read_request(5, &mut buf);
    done.p();
    assert_eq!(buf, pattern);

    let stats = kernel.stats();
    assert_eq!(stats.num_disk_reads, 1);
    assert_eq!(stats.num_disk_writes, 1);
    assert_eq!(
        stats.system_ticks + stats.user_ticks + stats.idle_ticks,
        stats.total_ticks
    );
    // The waits were covered by idling forward to the completion interrupts.
    assert!(stats.idle_ticks > 0);
}

#[test]
fn console_echo_through_semaphores() {
    let kernel = kernel();
    kernel.adopt_main();

    let readable = Semaphore::new("console-readable", &kernel, 0);
    let written = Semaphore::new("console-written", &kernel, 0);
    let on_read = Arc::clone(&readable);
    let on_write = Arc::clone(&written);

    let source = ScriptedSource::new(b"hi");
    let sink = SharedSink::new();
    let console = Console::new(
        Arc::clone(kernel.machine()),
        Box::new(source.clone()),
        Box::new(sink.clone()),
        move || on_read.v(),
        move || on_write.v(),
    );

    let mut echoed = Vec::new();
    for _ in 0..2 {
        readable.p();
        let byte = console.get_char().unwrap();
        echoed.push(byte);
        console.put_char(byte).unwrap();
        written.p();
    }

    assert_eq!(echoed, b"hi");
    assert_eq!(sink.contents(), b"hi");

    let stats = kernel.stats();
    assert_eq!(stats.num_console_chars_read, 2);
    assert_eq!(stats.num_console_chars_written, 2);
}

#[test]
fn console_misuse_is_reported_not_fatal() {
    let kernel = kernel();
    kernel.adopt_main();

    let console = Console::new(
        Arc::clone(kernel.machine()),
        Box::new(ScriptedSource::new(b"")),
        Box::new(SharedSink::new()),
        || {},
        || {},
    );

    assert!(matches!(
        console.get_char(),
        Err(MachineError::NoInputBuffered)
    ));
    console.put_char(b'x').unwrap();
    assert!(matches!(
        console.put_char(b'y'),
        Err(MachineError::ConsoleBusy)
    ));
}
