//! BlockVault CLI
//!
//! Inspect store files and move blobs in and out of them.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use blockvault::block::block_id_to_address;
use blockvault::{AllocType, Config, Database, Inode, Result};

/// BlockVault CLI
#[derive(Parser, Debug)]
#[command(name = "blockvault-cli")]
#[command(about = "Inspect and edit BlockVault store files")]
#[command(version)]
struct Args {
    /// Data directory holding the store files
    #[arg(short, long, default_value = "./blockvault_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty store
    Create {
        /// Store name
        store: String,
    },

    /// Print block counts and fragment usage
    Info {
        /// Store name
        store: String,
    },

    /// List the blocks of one allocation type
    Scan {
        /// Store name
        store: String,

        /// row, used, fragment, index or mini-fragment
        #[arg(short, long, default_value = "row")]
        kind: AllocType,
    },

    /// Store a file as a blob; prints the block holding its inode
    PutBlob {
        /// Store name
        store: String,

        /// File to store
        file: PathBuf,
    },

    /// Write a blob to a file or stdout
    GetBlob {
        /// Store name
        store: String,

        /// Block printed by put-blob
        block: u64,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Free a blob and the block holding its inode
    RemoveBlob {
        /// Store name
        store: String,

        /// Block printed by put-blob
        block: u64,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,blockvault=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder().data_dir(&args.data_dir).build();
    let db = Database::open(config)?;

    match args.command {
        Commands::Create { store } => {
            let store = db.create_store(&store)?;
            println!("created {} ({} blocks)", store.path().display(), store.block_count());
        }

        Commands::Info { store } => {
            let store = db.open_store(&store)?;
            let c = store.counters();
            println!("store:                 {}", store.name());
            println!("path:                  {}", store.path().display());
            println!("file size:             {}", c.file_size);
            println!("blocks:                {}", c.block_count);
            println!("  free:                {}", c.free_blocks);
            println!("  row:                 {}", c.row_blocks);
            println!("  used:                {}", c.used_blocks);
            println!("  fragment:            {}", c.fragment_blocks);
            println!("  index:               {}", c.index_blocks);
            println!("  mini-fragment:       {}", c.mini_fragment_blocks);
            println!("fragments in use:      {}", c.fragments_in_use);
            println!("fragment bytes:        {}", c.fragment_bytes);
            println!("mini-fragments in use: {}", c.mini_fragments_in_use);
        }

        Commands::Scan { store, kind } => {
            let store = db.open_store(&store)?;
            for block_id in store.blocks(kind) {
                println!("{}", block_id_to_address(block_id));
            }
        }

        Commands::PutBlob { store, file } => {
            let store = db.open_or_create_store(&store)?;
            let data = fs::read(&file)?;

            let mut xa = db.begin();
            xa.lock_read_and_write(store.lock())?;

            let row = store.allocate_row()?;
            let address = row.address();
            xa.add_update_block(row)?;

            let mut inode = Inode::new(store.clone());
            inode.append(&mut xa, &data)?;
            inode.save(&mut xa, address, 0)?;
            xa.commit()?;

            println!("{}", address);
        }

        Commands::GetBlob { store, block, out } => {
            let store = db.open_store(&store)?;
            let inode = Inode::load(store, block, 0)?;
            match out {
                Some(path) => {
                    let mut writer = BufWriter::new(File::create(&path)?);
                    inode.write_to(&mut writer)?;
                    writer.flush()?;
                }
                None => {
                    let stdout = io::stdout();
                    let mut writer = stdout.lock();
                    inode.write_to(&mut writer)?;
                    writer.flush()?;
                }
            }
        }

        Commands::RemoveBlob { store, block } => {
            let store = db.open_store(&store)?;
            let inode = Inode::load(store.clone(), block, 0)?;
            let length = inode.length();

            let mut xa = db.begin();
            xa.lock_read_and_write(store.lock())?;
            xa.delete_inode(inode);
            xa.deallocate_block(&store, block);
            xa.commit()?;

            println!("removed {} bytes", length);
        }
    }

    db.close()
}
