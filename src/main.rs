use std::{path::PathBuf, process};

use clap::{Parser, Subcommand};

use bitleech::{
    conf::Conf,
    engine,
    error::Result,
    metainfo::Metainfo,
};

#[derive(Parser)]
#[command(name = "bitleech", version, about = "A leech-only BitTorrent client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a torrent's content into a destination directory.
    Download {
        /// Path of the .torrent metainfo file.
        metainfo: PathBuf,
        /// Directory the content is downloaded into.
        destination: PathBuf,
    },
    /// Verify a previously downloaded torrent against its metainfo by
    /// hashing the destination's content.
    Test {
        /// Path of the .torrent metainfo file.
        metainfo: PathBuf,
        /// Directory holding the downloaded content.
        destination: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Download {
            metainfo,
            destination,
        } => {
            let metainfo = load_metainfo(&metainfo)?;
            engine::download(Conf::new(destination), metainfo, Vec::new())
                .await
        }
        Command::Test {
            metainfo,
            destination,
        } => {
            let metainfo = load_metainfo(&metainfo)?;
            let conf = Conf::new(destination);
            let (complete, total) = engine::verify(&conf, &metainfo).await?;
            println!("{}/{} pieces verified", complete, total);
            if complete != total {
                process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_metainfo(path: &PathBuf) -> Result<Metainfo> {
    let buf = std::fs::read(path)?;
    Metainfo::from_bytes(&buf)
}
