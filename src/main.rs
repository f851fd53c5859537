use clap::Parser;
use imagefs::fuse::ImageFs;
use imagefs::fuse::mount::{mount_imagefs, mount_imagefs_unprivileged};
use imagefs::image::Image;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Expose a raw disk image as a single FUSE-backed file")]
struct Args {
    /// Path to the backing disk image
    #[arg(long)]
    image: String,
    /// Empty directory to mount on
    #[arg(long)]
    mountpoint: String,
    /// Name of the exported file inside the mount
    #[arg(long, default_value = "image")]
    name: String,
    /// Report this size in bytes instead of the image length
    #[arg(long)]
    size: Option<u64>,
    /// Use a privileged mount instead of fusermount3
    #[arg(long)]
    privileged: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let image = match Image::open(&args.image, args.size).await {
        Ok(img) => img,
        Err(e) => {
            eprintln!("open image {} failed: {e}", args.image);
            std::process::exit(1);
        }
    };
    let size = image.size();
    let fs = ImageFs::new(image, &args.name);

    // Ensure mount point exists
    if let Err(e) = std::fs::create_dir_all(&args.mountpoint) {
        eprintln!("create mount point failed: {e}");
        std::process::exit(1);
    }

    println!(
        "Mounting {} as {}/{} ({size} bytes)...",
        args.image, args.mountpoint, args.name
    );
    println!("Press Ctrl+C to unmount and exit.");

    let mount = if args.privileged {
        mount_imagefs(fs, &args.mountpoint).await
    } else {
        mount_imagefs_unprivileged(fs, &args.mountpoint).await
    };
    let mut mount_handle = match mount {
        Ok(h) => h,
        Err(e) => {
            eprintln!(
                "mount failed: {e}\n\nHint: ensure you are on Linux with FUSE (fusermount3) available."
            );
            std::process::exit(1);
        }
    };

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => {
            if let Err(e) = res {
                eprintln!("fuse session error: {e}");
            }
        }
        _ = signal::ctrl_c() => {
            println!("Unmounting...");
            if let Err(e) = mount_handle.unmount().await {
                eprintln!("unmount error: {e}");
            }
        }
    }
}
