use clap::Parser;
use std::path::PathBuf;

/// Formats a mica-fs volume image and packs a host directory into it.
#[derive(Parser)]
pub struct Cli {
    /// Directory whose regular files are copied into the volume root
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image path
    #[arg(long, short = 'O')]
    pub image: PathBuf,

    /// Volume size in blocks
    #[arg(long, short, default_value_t = 4096)]
    pub blocks: usize,
}
