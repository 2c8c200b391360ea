use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use avrisp::{
    Catalog, Payload, Prescaler, Programmer, ProgrammingConfig,
    transport::SerialBridge,
};

#[derive(Parser)]
#[command(
    name = "avrisp",
    about = "Stand-alone in-system programmer for AVR microcontrollers"
)]
struct Cli {
    /// Serial port of the ISP bridge, the first port found when omitted
    #[arg(long, short, global = true)]
    port: Option<String>,
    /// Programming clock divisor, overrides the config file
    #[arg(long, short, global = true, value_enum)]
    speed: Option<Prescaler>,
    /// Device catalog (YAML), the built-in catalog when omitted
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Programming policy (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the firmware images named in the catalog
    #[arg(long, global = true, default_value = ".")]
    images: PathBuf,
    /// More output, repeat for protocol traces
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the images of the catalog
    List {},
    /// Get signature and fuses of the connected target
    Info {},
    /// Erase, flash and configure the target with a catalog image
    Flash {
        /// Catalog image name
        name: String,
        /// Skip reading back the written flash
        #[arg(long)]
        no_verify: bool,
    },
    /// Compare flash content with a catalog image
    Verify { name: String },
    /// Write one fuse set of a catalog image
    Fuses {
        name: String,
        /// Write the normal fuses instead of the programming fuses
        #[arg(long)]
        normal: bool,
    },
    /// Hexdump flash content
    Dump {
        /// Byte address, decimal or 0x hex
        #[arg(long, default_value = "0", value_parser = avrisp::device::parse_u32)]
        start: u32,
        #[arg(long, default_value = "256", value_parser = avrisp::device::parse_u32)]
        len: u32,
    },
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

    let catalog = match &cli.catalog {
        Some(path) => Catalog::load(path)?,
        None => Catalog::builtin()?,
    };
    let mut config = match &cli.config {
        Some(path) => ProgrammingConfig::load(path)?,
        None => ProgrammingConfig::default(),
    };
    if let Some(speed) = cli.speed {
        config.prescaler = speed;
    }

    match &cli.command {
        Commands::List {} => {
            for device in catalog.iter() {
                log::info!(
                    "{}: page {} words, program fuses [{}], normal fuses [{}]",
                    device,
                    device.page_size,
                    device.programming_fuses,
                    device.normal_fuses
                );
            }
        }
        Commands::Info {} => {
            let mut programmer = open_programmer(&cli, config)?;
            let signature = programmer.identify()?;
            log::info!("Signature: {}", hex::encode(signature));
            let known = u16::from_be_bytes([signature[1], signature[2]]);
            match catalog.find_by_signature(known) {
                Some(device) => log::info!("Catalog image: {}", device.name),
                None => log::warn!("No catalog image for this target"),
            }
            log::info!("Fuses: {}", programmer.read_fuses()?);
            programmer.release()?;
        }
        Commands::Flash { name, no_verify } => {
            let device = catalog.select_image(name)?;
            let verify = config.verify && !no_verify;
            let pb = ProgressBar::new(0).with_style(ProgressStyle::with_template(
                "{spinner} [{bar:40}] {pos}/{len} pages",
            )?);
            let mut programmer = open_programmer(&cli, config)?.with_progress(pb);
            let result = programmer.run(device, verify);
            log::info!("{}", result);
            result.into_result()?;
        }
        Commands::Verify { name } => {
            let device = catalog.select_image(name)?;
            let payload = Payload::load(&device.payload, &cli.images)?;
            open_programmer(&cli, config)?.verify_image(device, &payload)?;
            log::info!("Verified!");
        }
        Commands::Fuses { name, normal } => {
            let device = catalog.select_image(name)?;
            open_programmer(&cli, config)?.write_fuses(device, *normal)?;
            log::info!("Fuses written");
        }
        Commands::Dump { start, len } => {
            let mut programmer = open_programmer(&cli, config)?;
            programmer.identify()?;
            let data = programmer.read_flash(*start, *len)?;
            programmer.release()?;
            let mut out = Vec::new();
            hxdmp::hexdump(&data, &mut out)?;
            println!("{}", String::from_utf8_lossy(&out));
        }
    }

    Ok(())
}

fn open_programmer(cli: &Cli, config: ProgrammingConfig) -> Result<Programmer<SerialBridge>> {
    let bridge = match &cli.port {
        Some(port) => SerialBridge::open(port)?,
        None => {
            log::debug!("Serial ports: {:?}", SerialBridge::scan_ports()?);
            SerialBridge::open_any()?
        }
    };
    Ok(Programmer::new(bridge, config).with_image_dir(&cli.images))
}
