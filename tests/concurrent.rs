//! Concurrent-read discipline: NFS-style worker threads sharing a single
//! open handle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fixture, payload};

const CHUNK: u64 = 3072;
const CAP: usize = 2048;

#[test]
fn interleaved_readers_switch_to_queue_mode() {
    let fs = fixture(CHUNK);
    let size = CAP * 16;
    let data = payload(size, 7);

    fs.fuse.mknod("/proj/shared", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/shared").unwrap();
    fh.write(0, &data).unwrap();
    fh.flush().unwrap();
    fh.release();

    let fh = fs.fuse.open_read("/proj/shared").unwrap();
    let far_offset = (CAP * 8) as u64;
    let barrier = Arc::new(std::sync::Barrier::new(2));

    // Prime the stream so the far request below is unambiguously
    // discontiguous against an open stream.
    let mut back = vec![0u8; far_offset as usize];
    let step = CAP;
    let mut done = 0;
    let n = fh.read(0, &mut back[..step]).unwrap();
    assert_eq!(n, step);
    done += n;

    // Thread B asks for a far offset while thread A walks the file
    // sequentially. B's wait must observe A advancing the stream, flip
    // the handle into multi-thread mode, and be released once A's cursor
    // reaches it.
    let reader_b = {
        let fh = Arc::clone(&fh);
        let barrier = Arc::clone(&barrier);
        let expect = data[far_offset as usize..far_offset as usize + 4096].to_vec();
        std::thread::spawn(move || {
            barrier.wait();
            let mut buf = vec![0u8; 4096];
            let mut done = 0;
            while done < buf.len() {
                let n = fh.read(far_offset + done as u64, &mut buf[done..]).unwrap();
                if n == 0 {
                    break;
                }
                done += n;
            }
            assert_eq!(done, buf.len());
            assert_eq!(buf, expect);
        })
    };

    barrier.wait();
    while done < back.len() {
        let n = fh.read(done as u64, &mut back[done..done + step]).unwrap();
        assert!(n > 0);
        done += n;
        // Stay slower than B's detection window.
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(back, data[..far_offset as usize].to_vec());

    reader_b.join().unwrap();
    assert!(fh.is_multi_thread());
}

#[test]
fn two_offsets_both_return_correct_bytes() {
    let fs = fixture(CHUNK);
    let size = CAP * 10;
    let data = payload(size, 8);

    fs.fuse.mknod("/proj/both", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/both").unwrap();
    fh.write(0, &data).unwrap();
    fh.flush().unwrap();
    fh.release();

    let fh = fs.fuse.open_read("/proj/both").unwrap();
    let offsets = [0u64, (CAP * 5) as u64];
    let mut threads = Vec::new();
    for &offset in &offsets {
        let fh = Arc::clone(&fh);
        let expect = data[offset as usize..offset as usize + 4096].to_vec();
        threads.push(std::thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            let mut done = 0;
            while done < buf.len() {
                let n = fh.read(offset + done as u64, &mut buf[done..]).unwrap();
                if n == 0 {
                    break;
                }
                done += n;
            }
            assert_eq!(buf, expect);
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn release_wakes_pending_reader() {
    let fs = fixture(CHUNK);
    let data = payload(CAP * 8, 9);

    fs.fuse.mknod("/proj/bail", 0o100644).unwrap();
    let fh = fs.fuse.open_write("/proj/bail").unwrap();
    fh.write(0, &data).unwrap();
    fh.flush().unwrap();
    fh.release();

    let fh = fs.fuse.open_read("/proj/bail").unwrap();
    // Prime the stream so a later far read is discontiguous.
    let mut buf = vec![0u8; 1024];
    fh.read(0, &mut buf).unwrap();

    let waiter = {
        let fh = Arc::clone(&fh);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; 1024];
            // Parks in the discontiguous-read wait; release must hand
            // back a clean zero-byte result.
            fh.read((CAP * 6) as u64, &mut buf).unwrap()
        })
    };

    std::thread::sleep(Duration::from_millis(30));
    fh.release();
    assert_eq!(waiter.join().unwrap(), 0);
}
