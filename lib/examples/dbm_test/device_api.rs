use std::fs::File;
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, ensure, Context};

use dbm::format::fourcc;
use dbm::{bpp_from_pixel_format, BoFormat, Device, DeviceConfig, UsageFlags};

fn fill(data: &mut [u8], seed: u8) {
    for (i, b) in data.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
}

fn check(data: &[u8], seed: u8) -> bool {
    data.iter()
        .enumerate()
        .all(|(i, b)| *b == seed.wrapping_add(i as u8))
}

/// Run the test on the DRM device opened as `file`. `lets_quit` will turn to true when Ctrl+C
/// is pressed.
pub fn run(
    file: &File,
    driver: Option<String>,
    width: u32,
    height: u32,
    lets_quit: Arc<AtomicBool>,
    stop_after: Option<usize>,
) -> anyhow::Result<()> {
    let config = match driver.as_deref() {
        None => DeviceConfig::new(),
        Some("any") => DeviceConfig::new().any_driver(),
        Some(name) => DeviceConfig::new().driver_name(name),
    };
    let device = Device::with_config(file.as_fd(), config).context("cannot create device")?;

    let format = fourcc::XRGB8888;
    if !device.supports(format, BoFormat::Xrgb8888, UsageFlags::SCANOUT) {
        bail!("device does not support {} for scanout", format);
    }
    let bpp = bpp_from_pixel_format(format).context("unknown pixel format")?;
    let (stride, size) =
        device.query_stride_and_size(width, height, bpp, UsageFlags::SCANOUT)?;
    println!(
        "{}x{} {}: stride {}, size {} bytes",
        width, height, format, stride, size
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

        let mut buffer = device.allocate_buffer(size, UsageFlags::SCANOUT | UsageFlags::WRITE)?;
        buffer.begin_cpu_access(false, true)?;
        if let Some(data) = buffer.mapping_mut() {
            fill(data, seed);
        }
        buffer.end_cpu_access();

        let name = buffer.export_name()?;
        // Opening a name may give a new handle on the same object.
        let mut by_name = device.import_by_name(name, size)?;

        let dmabuf = buffer.export_fd()?;
        let by_fd = device.import_by_fd(dmabuf.as_fd())?;
        ensure!(by_fd.size() >= size, "DMABUF is smaller than the buffer");
        ensure!(
            by_fd.handle() == buffer.handle(),
            "DMABUF import gave handle {} instead of {}",
            by_fd.handle(),
            buffer.handle()
        );
        let expected = if by_name.handle() == buffer.handle() { 3 } else { 2 };
        ensure!(
            device.handle_refcount(buffer.handle()) == expected,
            "unexpected reference count"
        );

        by_name.begin_cpu_access(true, false)?;
        let ok = by_name.mapping_mut().map_or(false, |data| check(data, seed));
        by_name.end_cpu_access();
        ensure!(ok, "imported buffer content differs");

        by_fd.destroy()?;
        by_name.destroy()?;
        buffer.destroy()?;
        ensure!(device.num_live_handles() == 0, "GEM handles leaked");

        iterations += 1;
        let elapsed = start_time.elapsed();
        let rate = iterations as f64 / elapsed.as_secs_f64();
        print!("\rIteration {} - {:.2} iterations per second", iterations, rate);
        std::io::Write::flush(&mut std::io::stdout())?;
    }

    println!();
    Ok(())
}
