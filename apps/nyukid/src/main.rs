use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nyuki_bus::MemoryHub;
use nyuki_kernel::{CliOverrides, ConfigStore, Nyuki, logging};
use tracing::info;

mod messages;

use messages::MessageBoard;

#[derive(Debug, Parser)]
#[command(name = "nyukid")]
#[command(about = "Sample nyuki agent serving a message board")]
struct Cli {
    /// JSON configuration file, merged over the defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    jid: Option<String>,
    #[arg(short, long)]
    password: Option<String>,
    /// Bus server, `host[:port]`.
    #[arg(short, long)]
    server: Option<String>,
    /// API address, `host[:port]`.
    #[arg(short, long)]
    api: Option<String>,
    /// Log filter, e.g. `debug` or `nyuki_bus=debug,info`.
    #[arg(short, long)]
    logging: Option<String>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            jid: self.jid.clone(),
            password: self.password.clone(),
            server: self.server.clone(),
            api: self.api.clone(),
            logging: self.logging.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = ConfigStore::load(cli.config.as_deref(), &cli.overrides())
        .context("invalid configuration")?;
    let log = logging::init(&store.log_config()?).context("could not set up logging")?;

    // No chat server is bundled; the bus runs on an in-process switch.
    let hub = MemoryHub::new();
    let board = MessageBoard::new();
    let nyuki = Nyuki::builder(store, hub.transport())
        .capabilities(board.capabilities()?)
        .logging(log)
        .build()?;

    info!(name = %nyuki.handle().name(), "starting nyuki");
    nyuki.start()
}
