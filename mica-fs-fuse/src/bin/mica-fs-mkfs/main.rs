mod cli;

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use clap::Parser;
use cli::Cli;
use mica_fs::{AccessFlag, BlockDevice, Ctx, DescriptorKind, Volume, BLOCK_SIZE};
use mica_fs_fuse::{BlockFile, SystemClock};

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nimage={:?}", cli.source, cli.image);

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)?;
    fd.set_len((cli.blocks * BLOCK_SIZE) as u64)?;

    let device: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd)?);
    let clock = Arc::new(SystemClock);
    let ctx = Ctx {
        uid: 0,
        gid: 0,
        pid: std::process::id(),
        umask: 0o022,
    };

    Volume::format(device.clone(), &*clock, &ctx, cli.blocks).map_err(io::Error::other)?;
    let mut volume = Volume::mount(device, clock).map_err(io::Error::other)?;
    let root = volume
        .open(&ctx, "/", AccessFlag::Read | AccessFlag::Write)
        .map_err(io::Error::other)?;

    for entry in fs::read_dir(&cli.source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| io::Error::other(format!("unusable file name {name:?}")))?;
        let bytes = fs::read(entry.path())?;

        let path = format!("/{name}");
        volume
            .create(&ctx, &path, DescriptorKind::File)
            .map_err(io::Error::other)?;
        let handle = volume
            .open(&ctx, &path, AccessFlag::Write.into())
            .map_err(io::Error::other)?;
        volume.write(&ctx, handle, &bytes).map_err(io::Error::other)?;
        volume.close(&ctx, handle).map_err(io::Error::other)?;
        log::info!("packed {name}: {} bytes", bytes.len());
    }

    volume.close(&ctx, root).map_err(io::Error::other)?;
    volume.unmount().map_err(io::Error::other)?;
    Ok(())
}
