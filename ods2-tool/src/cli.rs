use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ODS-2 磁盘镜像的打包与查看工具
#[derive(Parser)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create and initialize an image
    Format {
        image: PathBuf,

        /// Image size in MiB
        #[arg(long, short, default_value_t = 10)]
        size_mib: u64,

        /// Volume label
        #[arg(long, short, default_value = "ODS2")]
        label: String,

        /// Blocks per cluster
        #[arg(long, short, default_value_t = 1)]
        cluster: u16,

        /// Preallocated file headers
        #[arg(long, default_value_t = 64)]
        headers: u32,
    },

    /// List the master directory
    Dir {
        image: PathBuf,

        #[arg(default_value = "*.*;*")]
        pattern: String,
    },

    /// Copy a host file into the image
    Put {
        image: PathBuf,

        source: PathBuf,

        /// Name on the volume, defaults to the host file name
        name: Option<String>,
    },

    /// Copy a file out of the image
    Get {
        image: PathBuf,

        name: String,

        target: PathBuf,
    },

    /// Remove a file from the image
    Delete { image: PathBuf, name: String },
}
