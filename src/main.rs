use clap::{Parser, Subcommand};
use eyre::{eyre, Context, Result};
use std::path::PathBuf;
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tinyfat::{
    fs::{CLUSTER_SIZE, MIN_SECTORS},
    DiskImage, FileSystem, OpenMode,
};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new volume image and format it
    Create {
        #[arg(index = 1)]
        image: PathBuf,
        /// Capacity in sectors of 512 bytes
        #[arg(short = 's', long, default_value_t = 4096)]
        sectors: usize,
    },
    /// Re-format an existing volume, discarding all files
    Format {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// List the files on a volume
    Ls {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Print the free space of a volume
    Df {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Copy a local file onto the volume
    Put {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        source: PathBuf,
        /// Name on the volume, defaults to the source file name
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Copy a file off the volume
    Get {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
        #[arg(index = 3)]
        dest: PathBuf,
    },
    /// Remove a file from the volume
    Rm {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
}

fn mounted(image: &PathBuf) -> Result<FileSystem<DiskImage>> {
    let device = DiskImage::open(image)?;
    FileSystem::mount(device).wrap_err("Failed to mount volume")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up tinyfat cli");
    match cli.command {
        Command::Create { image, sectors } => {
            if sectors < MIN_SECTORS {
                println!("a volume needs at least {MIN_SECTORS} sectors");
                std::process::exit(1);
            }
            DiskImage::create(&image, sectors).wrap_err("Failed to create volume image")?;
            let mut fs = mounted(&image)?;
            fs.format();
        }
        Command::Format { image } => {
            let mut fs = mounted(&image)?;
            fs.format();
        }
        Command::Ls { image } => {
            let fs = mounted(&image)?;
            for (name, size) in fs.list()? {
                println!("{name}\t\t{size}");
            }
        }
        Command::Df { image } => {
            let fs = mounted(&image)?;
            let free = fs.free_space();
            println!("{free} bytes free ({} clusters)", free / CLUSTER_SIZE as u64);
        }
        Command::Put {
            image,
            source,
            name,
        } => {
            let data = std::fs::read(&source).wrap_err("Failed to read source file")?;
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_owned)
                    .ok_or_else(|| eyre!("source path has no usable file name"))?,
            };
            let mut fs = mounted(&image)?;
            let handle = fs.open(&name, OpenMode::Write)?;
            fs.write(handle, &data)?;
            fs.close(handle)?;
        }
        Command::Get { image, name, dest } => {
            let mut fs = mounted(&image)?;
            let handle = fs.open(&name, OpenMode::Read)?;
            let mut data = Vec::new();
            let mut chunk = [0u8; CLUSTER_SIZE];
            loop {
                let n = fs.read(handle, &mut chunk)?;
                data.extend_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    break;
                }
            }
            fs.close(handle)?;
            std::fs::write(&dest, &data).wrap_err("Failed to write destination file")?;
        }
        Command::Rm { image, name } => {
            let mut fs = mounted(&image)?;
            fs.remove(&name)?;
        }
    }
    Ok(())
}
