use std::fs::File;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::ensure;

use dbm::ioctl::*;

/// Run the test on the DRM device opened as `file`, issuing the ioctls directly.
pub fn run(
    file: &File,
    width: u32,
    height: u32,
    lets_quit: Arc<AtomicBool>,
    stop_after: Option<usize>,
) -> anyhow::Result<()> {
    let version = version(file)?;
    println!(
        "Opened device: {} {}.{}.{} ({}, {})",
        version.name, version.major, version.minor, version.patchlevel, version.desc, version.date
    );

    let start_time = Instant::now();
    let mut iterations = 0usize;

    while !lets_quit.load(Ordering::SeqCst) {
        if let Some(max) = stop_after {
            if iterations >= max {
                break;
            }
        }
        let seed = iterations as u8;

        let dumb = create_dumb(file, width, height, 32)?;
        let len = dumb.size as usize;
        let offset = map_dumb(file, dumb.handle)?;
        // Safe because the mapping is released before the handle is closed, and not used after.
        unsafe {
            let data = mmap(file, offset, len)?;
            std::ptr::write_bytes(data.as_ptr(), seed, len);
            munmap(data, len)?;
        }

        let name = gem_flink(file, dumb.handle)?;
        // GEM_OPEN hands out a new handle on every call.
        let opened = gem_open(file, name)?;
        ensure!(opened.size == dumb.size, "GEM_OPEN reported a different size");
        let offset = map_dumb(file, opened.handle)?;
        // Safe because the mapping covers the object and is released right away.
        let same_content = unsafe {
            let data = mmap(file, offset, len)?;
            let ok = std::slice::from_raw_parts(data.as_ptr(), len)
                .iter()
                .all(|b| *b == seed);
            munmap(data, len)?;
            ok
        };
        ensure!(same_content, "opened buffer content differs");

        let dmabuf: OwnedFd = prime_handle_to_fd(file, dumb.handle, PrimeFlags::CLOEXEC)?;
        let imported = prime_fd_to_handle(file, &dmabuf)?;
        ensure!(imported == dumb.handle, "PRIME import gave a different handle");

        if opened.handle != dumb.handle {
            gem_close(file, opened.handle)?;
        }
        gem_close(file, dumb.handle)?;

        iterations += 1;
        let elapsed = start_time.elapsed();
        let rate = iterations as f64 / elapsed.as_secs_f64();
        print!("\rIteration {} - {:.2} iterations per second", iterations, rate);
        std::io::Write::flush(&mut std::io::stdout())?;
    }

    println!();
    Ok(())
}
