//! This example program exercises a DRM device by repeatedly allocating a buffer, filling it
//! through a CPU mapping, sharing it by global name and DMABUF, and checking that the imported
//! buffers see the same content.
//!
//! There are two variants doing the same thing: one using the higher-level `Device`
//! abstraction (used by default), the other using the low-level `ioctl` abstraction (used if
//! `--use_ioctl` is specified).
mod device_api;
mod ioctl_api;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, Command};

fn main() {
    env_logger::init();

    let matches = Command::new("dbm test")
        .arg(
            Arg::new("use_ioctl")
                .long("use_ioctl")
                .help("Use the lower-level ioctl interface"),
        )
        .arg(
            Arg::new("num_frames")
                .long("stop_after")
                .takes_value(true)
                .help("Stop after this number of iterations"),
        )
        .arg(
            Arg::new("driver")
                .long("driver")
                .takes_value(true)
                .help("Expected DRM driver (omapdrm by default, \"any\" to accept all)"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .takes_value(true)
                .default_value("640"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .takes_value(true)
                .default_value("480"),
        )
        .arg(
            Arg::new("device")
                .default_value("/dev/dri/card0")
                .help("Path to the DRM device file"),
        )
        .get_matches();

    let device_path = matches.value_of("device").unwrap_or("/dev/dri/card0");
    let use_ioctl = matches.is_present("use_ioctl");
    let stop_after = matches
        .value_of("num_frames")
        .map(|v| v.parse::<usize>().expect("Invalid value for stop_after"));
    let driver = matches.value_of("driver").map(String::from);
    let width: u32 = matches
        .value_of("width")
        .unwrap_or("640")
        .parse()
        .expect("Invalid width");
    let height: u32 = matches
        .value_of("height")
        .unwrap_or("480")
        .parse()
        .expect("Invalid height");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(Path::new(device_path))
        .unwrap_or_else(|e| panic!("Cannot open {}: {}", device_path, e));

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set Ctrl-C handler.");
    }

    let res = if use_ioctl {
        println!("Using ioctl interface");
        ioctl_api::run(&file, width, height, lets_quit, stop_after)
    } else {
        println!("Using device interface");
        device_api::run(&file, driver, width, height, lets_quit, stop_after)
    };

    if let Err(e) = res {
        eprintln!("Test failed: {:#}", e);
        std::process::exit(1);
    }
}
