//! Scenario: a pipe with a high-priority writer and a default-priority
//! reader, both always ready. In any single iteration at most one of the
//! two dispatches (priority tightening picks the single smallest-priority
//! source), but over many iterations neither starves: every byte written
//! is eventually read.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use eventcore::source::{DispatchAction, PRIORITY_HIGH};
use eventcore::sources::DescriptorSource;
use eventcore::ready::Ready;
use eventcore::Context;

mod util;
use util::init;

const TOTAL_BYTES: usize = 1 << 20; // 1 MiB: representative without being slow.
const CHUNK: usize = 4096;

#[test]
fn writer_and_reader_alternate_without_starvation() {
    init();

    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd): (RawFd, RawFd) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(read_fd, libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(write_fd, libc::F_SETFL, libc::O_NONBLOCK);
    }

    let ctx = Context::new().unwrap();

    let written = Arc::new(AtomicUsize::new(0));
    let read = Arc::new(AtomicUsize::new(0));
    let dispatch_log = Arc::new(Mutex::new(Vec::new()));

    let written2 = written.clone();
    let log_w = dispatch_log.clone();
    let writer = DescriptorSource::new(write_fd, Ready::writable(), move |_ready| {
        log_w.lock().unwrap().push("w");
        let already = written2.load(Ordering::SeqCst);
        if already >= TOTAL_BYTES {
            return DispatchAction::Remove;
        }
        let buf = vec![0u8; CHUNK.min(TOTAL_BYTES - already)];
        let n = unsafe { libc::write(write_fd, buf.as_ptr() as *const _, buf.len()) };
        if n > 0 {
            written2.fetch_add(n as usize, Ordering::SeqCst);
        }
        if written2.load(Ordering::SeqCst) >= TOTAL_BYTES {
            DispatchAction::Remove
        } else {
            DispatchAction::Continue
        }
    });
    writer.set_priority(PRIORITY_HIGH);
    writer.attach(&ctx);

    let read2 = read.clone();
    let log_r = dispatch_log.clone();
    let reader = DescriptorSource::new(read_fd, Ready::readable(), move |_ready| {
        log_r.lock().unwrap().push("r");
        let mut buf = [0u8; CHUNK];
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n > 0 {
            read2.fetch_add(n as usize, Ordering::SeqCst);
        }
        if read2.load(Ordering::SeqCst) >= TOTAL_BYTES {
            DispatchAction::Remove
        } else {
            DispatchAction::Continue
        }
    });
    reader.attach(&ctx);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while read.load(Ordering::SeqCst) < TOTAL_BYTES && std::time::Instant::now() < deadline {
        ctx.iteration(true);
    }

    assert_eq!(written.load(Ordering::SeqCst), TOTAL_BYTES);
    assert_eq!(read.load(Ordering::SeqCst), TOTAL_BYTES);

    let log = dispatch_log.lock().unwrap();
    assert!(log.contains(&"r"), "reader should have dispatched at least once");
    assert!(log.contains(&"w"), "writer should have dispatched at least once");

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
