use c3flash::{
    cli::{self, ConnectArgs, FlashArgs},
    logging::initialize_logger,
};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use miette::Result;

/// Main CLI parser.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash a firmware image to a connected ESP32-C3
    ///
    /// Accepts either a single binary (offset inferred from the filename)
    /// or a build directory with bootloader.bin, partitions.bin and
    /// firmware.bin at their canonical offsets.
    Flash(FlashArgs),
    /// List available USB serial ports
    ListPorts,
    /// Reset the target device into its application
    Reset(ConnectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();

    match cli.subcommand {
        Commands::Flash(args) => cli::flash(args),
        Commands::ListPorts => cli::list_ports(),
        Commands::Reset(args) => cli::reset(args),
    }
}
