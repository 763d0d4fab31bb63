use std::ffi::OsString;

use clap::Parser;
use concatfs::concat::DEFAULT_MARKER;
use concatfs::passthrough::ConcatFs;
use concatfs::server::{mount_privileged, mount_unprivileged};
use log::info;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mirror a directory, materializing -concat- descriptor files")]
struct Args {
    /// Source directory to expose
    rootdir: String,
    /// Path to an empty mount point
    mountpoint: String,
    /// Substring of a file name that marks a descriptor file
    #[arg(long, default_value = DEFAULT_MARKER)]
    marker: String,
    /// Use a privileged mount instead of fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if unsafe { libc::getuid() } == 0 || unsafe { libc::geteuid() } == 0 {
        eprintln!(
            "WARNING! concatfs does no file access checking \
             and is dangerous to run as root."
        );
    }

    let fs = match ConcatFs::new(&args.rootdir, &args.marker) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("cannot use source root {}: {e}", args.rootdir);
            std::process::exit(1);
        }
    };

    info!(
        "mounting {} at {} (marker {:?})",
        fs.root().display(),
        args.mountpoint,
        args.marker
    );

    let mountpoint = OsString::from(&args.mountpoint);
    let mount = if args.privileged {
        mount_privileged(fs, &mountpoint).await
    } else {
        mount_unprivileged(fs, &mountpoint).await
    };
    let mut handle = match mount {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!(
                "mount failed: {e}\nHint: unprivileged mounts need fusermount3 in PATH."
            );
            std::process::exit(1);
        }
    };

    let session = &mut handle;
    tokio::select! {
        res = session => {
            if let Err(e) = res {
                eprintln!("session ended with error: {e}");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            if let Err(e) = handle.unmount().await {
                eprintln!("unmount error: {e}");
            }
        }
    }
}
