use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub mod daemon;
pub mod ops;

#[derive(Parser)]
#[command(name = "gkfs")]
#[command(author, version, about = "Distributed burst-buffer file system", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "gkfs.toml")]
        path: PathBuf,
    },
    /// Run a daemon and register it in the hosts file
    Daemon {
        #[arg(short, long)]
        config: PathBuf,
        /// Override daemon.listen
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Override daemon.rootdir
        #[arg(long)]
        rootdir: Option<PathBuf>,
        /// Override daemon.hosts_file
        #[arg(long)]
        hosts_file: Option<PathBuf>,
    },
    /// Write a local file, or stdin, into the file system
    Write {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
        /// Local file to copy from. Reads stdin when omitted.
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long, default_value_t = 0, conflicts_with = "append")]
        offset: u64,
        /// Append to the end of the file
        #[arg(long)]
        append: bool,
    },
    /// Read a file to stdout or a local file
    Read {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
        /// Local file to write to. Writes stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read. Defaults to the rest of the file.
        #[arg(long)]
        length: Option<u64>,
    },
    /// Show the metadata of a path
    Stat {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
    },
    /// List a directory
    Ls {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        /// Show sizes and change times
        #[arg(short, long)]
        long: bool,
    },
    /// Create a directory
    Mkdir {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
    },
    /// Remove a file or an empty directory
    Rm {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
    },
    /// Shrink a file
    Truncate {
        #[arg(short, long)]
        config: PathBuf,
        path: String,
        size: u64,
    },
    /// Show storage capacity of the cluster
    Df {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show daemon statistics
    Stats {
        #[arg(short, long)]
        config: PathBuf,
        /// Only this host. All hosts when omitted.
        #[arg(long)]
        host: Option<u64>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
