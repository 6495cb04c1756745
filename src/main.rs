use std::{fs::File, io::BufWriter, io::Write, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use picoflash::{
    Flashing, ImageFormat, Protocol, SerialConnector, SessionConfig, format,
    transport::Baudrate,
};

/// Parse `0x`-prefixed hex, `0b`-prefixed binary, or decimal.
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (hex, 16)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (s, 10)
    };
    u32::from_str_radix(digits, radix).map_err(|e| format!("'{}' is not a number: {}", s, e))
}

#[derive(clap::Parser)]
#[command(
    name = "picoflash",
    version,
    about = "Flash firmware to an RP2040 over its serial bootloader"
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Serial baudrate
    #[arg(long, global = true, value_enum, default_value_t = Baudrate::default())]
    baudrate: Baudrate,

    /// Hide progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct PortArg {
    /// Name of the serial port (i.e. 'COM3'), autodetect if not specified
    #[arg(short, long)]
    port: Option<String>,
}

#[derive(clap::Args)]
struct ImageArgs {
    /// Name of the input file
    #[arg(short = 'i', long = "in")]
    input: PathBuf,
    /// Load address, required for .bin files
    #[arg(short, long, value_parser = parse_number)]
    addr: Option<u32>,
    /// Image format, guessed from the file extension if not specified
    #[arg(long, value_enum)]
    format: Option<ImageFormat>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Find an RP2040 in bootloader mode
    Sync {
        #[command(flatten)]
        port: PortArg,
    },
    /// Show the bootloader's memory map
    Info {
        #[command(flatten)]
        port: PortArg,
    },
    /// Download flash contents to a file
    Read {
        #[command(flatten)]
        port: PortArg,
        /// Starting address, flash start if not specified
        #[arg(short, long, value_parser = parse_number)]
        addr: Option<u32>,
        /// Number of bytes to read, full flash range if not specified
        #[arg(short = 'l', long = "len", value_parser = parse_number)]
        len: Option<u32>,
        /// Name of the output file
        #[arg(short, long = "out", default_value = "out.bin")]
        out: PathBuf,
    },
    /// Erase flash sectors
    Erase {
        #[command(flatten)]
        port: PortArg,
        /// Starting address, erase start if not specified
        #[arg(short, long, value_parser = parse_number)]
        addr: Option<u32>,
        /// Number of bytes to erase, up to the end of flash if not specified
        #[arg(short = 'l', long = "len", value_parser = parse_number)]
        len: Option<u32>,
    },
    /// Write an image without erasing
    Write {
        #[command(flatten)]
        port: PortArg,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Erase, write and seal an image
    Flash {
        #[command(flatten)]
        port: PortArg,
        #[command(flatten)]
        image: ImageArgs,
        /// Jump to the image when done
        #[arg(short, long)]
        boot: bool,
    },
    /// Compare flash contents with an image
    Verify {
        #[command(flatten)]
        port: PortArg,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Jump to an address
    Boot {
        #[command(flatten)]
        port: PortArg,
        /// Jump address, flash start if not specified
        #[arg(short, long, value_parser = parse_number)]
        addr: Option<u32>,
    },
}

fn load(flashing: &Flashing<SerialConnector>, args: &ImageArgs) -> Result<picoflash::Image> {
    log::info!("Loading image {}", args.input.display());
    let image =
        format::read_image_from_file(&args.input, args.format, flashing.device(), args.addr)
            .with_context(|| format!("failed to load {}", args.input.display()))?;
    log::info!("Firmware size: {:#x}", image.data.len());
    Ok(image)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let connector = SerialConnector::new(cli.baudrate);
    let config = SessionConfig {
        progress: !cli.no_progress,
        ..SessionConfig::default()
    };
    let connect = |port: &PortArg| {
        Flashing::connect(connector.clone(), port.port.as_deref(), config.clone())
    };

    match cli.command {
        Commands::Sync { port } => {
            let protocol =
                Protocol::discover(connector.clone(), port.port.as_deref(), config.clone())?;
            println!("{}", protocol.port());
        }
        Commands::Info { port } => {
            let flashing = connect(&port)?;
            flashing.dump_info();
        }
        Commands::Read {
            port,
            addr,
            len,
            out,
        } => {
            let flashing = connect(&port)?;
            log::info!(
                "Downloading image from port {} to {}",
                flashing.port(),
                out.display()
            );
            let file =
                File::create(&out).with_context(|| format!("cannot create {}", out.display()))?;
            let mut writer = BufWriter::new(file);
            let result = flashing.read(addr, len, &mut writer);
            writer.flush()?;
            result?;
        }
        Commands::Erase { port, addr, len } => {
            let flashing = connect(&port)?;
            flashing.erase(addr, len)?;
        }
        Commands::Write { port, image } => {
            let flashing = connect(&port)?;
            let image = load(&flashing, &image)?;
            flashing.write(&image)?;
        }
        Commands::Flash { port, image, boot } => {
            let flashing = connect(&port)?;
            let image = load(&flashing, &image)?;
            flashing.flash(&image, boot)?;
        }
        Commands::Verify { port, image } => {
            let flashing = connect(&port)?;
            let image = load(&flashing, &image)?;
            flashing.verify(&image)?;
        }
        Commands::Boot { port, addr } => {
            let flashing = connect(&port)?;
            flashing.boot(addr)?;
        }
    }

    Ok(())
}
