use std::{fs, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu::sim::Faults;
use error::CliError;
use flash::*;
use list::*;
use simulate::*;

mod error;
mod flash;
mod list;
mod simulate;
mod usb;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list accelerators in DFU mode
    List {
        /// vendor ID (ex: "1a6e")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "089a")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// flash, verify and detach the accelerator
    Flash {
        /// raw firmware image
        file: PathBuf,
        /// block size, overrides the device's transfer size (ex: 0x100)
        #[clap(short, long, value_parser=maybe_hex::<u16>)]
        chunk_size: Option<u16>,
        /// seconds to wait for the transfer to finish
        #[clap(short, long, default_value_t = 60)]
        timeout: u64,
    },
    /// run the DFU sequence against a simulated accelerator
    Simulate {
        /// raw firmware image
        file: Option<PathBuf>,
        /// generate a test image of this size instead (ex: 4K, 1MB)
        #[clap(long, value_parser=parse_length)]
        pattern: Option<usize>,
        /// block size (ex: 0x100)
        #[clap(short, long, value_parser=maybe_hex::<u16>)]
        chunk_size: Option<u16>,
        /// stall the DNLOAD of this block
        #[clap(long, value_parser=maybe_hex::<u16>)]
        fail_block: Option<u16>,
        /// flip the read-back byte at this offset
        #[clap(long, value_parser=maybe_hex::<usize>)]
        corrupt_offset: Option<usize>,
        /// deliver completions after the issuing call returns
        #[clap(long)]
        defer: bool,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<usize, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

/// The controller borrows the image for the life of the process.
fn load_image(
    file: Option<&PathBuf>,
    pattern: Option<usize>,
) -> Result<&'static [u8], CliError> {
    let data = match (file, pattern) {
        (Some(file), _) => fs::read(file)?,
        (None, Some(len)) => (0..len).map(|i| (i % 251) as u8).collect(),
        (None, None) => return Err(CliError::NoImage),
    };
    Ok(Box::leak(data.into_boxed_slice()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => list_dfu_devices(vendor, product),
        Commands::Flash {
            file,
            chunk_size,
            timeout,
        } => flash_file(&file, chunk_size, timeout),
        Commands::Simulate {
            file,
            pattern,
            chunk_size,
            fail_block,
            corrupt_offset,
            defer,
        } => load_image(file.as_ref(), pattern).and_then(|image| {
            simulate(
                image,
                SimOptions {
                    faults: Faults {
                        fail_dnload_block: fail_block,
                        corrupt_upload_offset: corrupt_offset,
                        ..Default::default()
                    },
                    defer,
                    chunk_size,
                },
            )
        }),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn flash_file(
    file: &PathBuf,
    chunk_size: Option<u16>,
    timeout: u64,
) -> Result<(), CliError> {
    let image = load_image(Some(file), None)?;
    flash(image, chunk_size, Duration::from_secs(timeout))
}
