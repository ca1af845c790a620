mod btle;
mod console;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use grdfu_core::ble::mock::MOCK_DEVICE_ID;
use grdfu_core::ble::{BlePlatform, BlockingBle, MockPlatform, Peripheral, ScanFilter};
use grdfu_core::events::{LogLevel, Logger, TracingSink};
use grdfu_core::sim::{FastDevice, SIM_DEVICE_NAME, StandardDevice};
use grdfu_core::{
    DfuSession, EngineKind, FirmwareBlob, Outcome, SessionConfig, ThreadExecutor,
};
use tracing::{error, info};

use crate::btle::{BtlePlatform, DEFAULT_MTU};
use crate::console::ConsoleListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "Goodix GR5xxx BLE DFU Tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List advertising devices
    Scan {
        /// Scan window in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        /// Only show devices whose name contains this text
        #[arg(long)]
        name: Option<String>,
    },
    /// Update firmware or a resource on a device
    Update(UpdateArgs),
    /// Show what the bootloader would see in a file
    Inspect {
        file: PathBuf,
    },
    /// Write or show a session configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration
    Init { path: PathBuf },
    /// Print a configuration file
    Show { path: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Engine {
    Standard,
    Fast,
}

impl From<Engine> for EngineKind {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Standard => EngineKind::Standard,
            Engine::Fast => EngineKind::Fast,
        }
    }
}

#[derive(clap::Args, Debug)]
struct UpdateArgs {
    /// Firmware image or resource file
    file: PathBuf,

    /// Device id or advertised name
    #[arg(short, long, required_unless_present = "simulate")]
    device: Option<String>,

    #[arg(long, value_enum, default_value_t = Engine::Standard)]
    engine: Engine,

    /// Standard engine: stream the image in one write instead of framed chunks
    #[arg(long)]
    fast_mode: bool,

    /// Stage the firmware at this address and let the bootloader copy it
    #[arg(long, value_parser = parse_address, conflicts_with = "resource")]
    copy_address: Option<u32>,

    /// Write the file as a resource at this address
    #[arg(long, value_parser = parse_address)]
    resource: Option<u32>,

    /// Resource goes to external flash
    #[arg(long, requires = "resource")]
    external: bool,

    /// Device runs its application; send the enter signal first
    #[arg(long)]
    boot_entry: bool,

    /// Session configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against a simulated device instead of a Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    /// ATT MTU assumed for the link
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: usize,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    let outcome = match args.command {
        Command::Scan { seconds, name } => scan(Duration::from_secs(seconds), name),
        Command::Update(update_args) => update(&update_args, args.verbose),
        Command::Inspect { file } => inspect(&file),
        Command::Config { action } => config(action),
    };

    if let Err(e) = outcome {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn core_logger() -> Logger {
    Logger::new(Arc::new(TracingSink))
}

fn scan(window: Duration, name: Option<String>) -> Result<()> {
    let platform = Arc::new(BtlePlatform::new(DEFAULT_MTU)?);
    let ble = BlockingBle::new(platform, core_logger(), &SessionConfig::default());
    ble.wait_powered_on()?;

    let seen: Arc<Mutex<Vec<(Peripheral, i16)>>> = Arc::default();
    let collector = seen.clone();
    let filter: Arc<ScanFilter> = Arc::new(move |p: &Peripheral, rssi| {
        let wanted = match (&name, &p.name) {
            (Some(needle), Some(n)) => n.contains(needle.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if wanted {
            let mut seen = collector.lock().unwrap_or_else(|e| e.into_inner());
            match seen.iter_mut().find(|(q, _)| q.id == p.id) {
                Some(entry) => *entry = (p.clone(), rssi),
                None => seen.push((p.clone(), rssi)),
            }
        }
        false
    });
    info!("Scanning for {} s...", window.as_secs());
    ble.scan_best(filter, window)?;

    let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner()).clone();
    seen.sort_by(|a, b| b.1.cmp(&a.1));
    for (peripheral, rssi) in &seen {
        println!("{:>5} dBm  {}", rssi, peripheral);
    }
    info!("{} device(s) found", seen.len());
    Ok(())
}

fn load_config(args: &UpdateArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if args.fast_mode {
        config.fast_mode = true;
    }
    Ok(config)
}

fn update(args: &UpdateArgs, verbose: bool) -> Result<()> {
    let data = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let config = load_config(args)?;

    if args.simulate {
        info!("Using a simulated {} device", EngineKind::from(args.engine));
        let platform = match args.engine {
            Engine::Standard => {
                let mut device = StandardDevice::extended();
                if args.boot_entry {
                    device = device.in_application();
                }
                MockPlatform::with_device(device)
            }
            Engine::Fast => {
                let mut device = FastDevice::new(3);
                if args.boot_entry {
                    device = device.in_application();
                }
                MockPlatform::with_device(device)
            }
        };
        let target = Peripheral::new(MOCK_DEVICE_ID, Some(SIM_DEVICE_NAME));
        return run_update(Arc::new(platform), target, data, args, config, verbose);
    }

    let wanted = args.device.clone().unwrap_or_default();
    let platform = Arc::new(BtlePlatform::new(args.mtu)?);
    let target = {
        let ble = BlockingBle::new(platform.clone(), core_logger(), &config);
        ble.wait_powered_on()?;
        let filter: Arc<ScanFilter> = Arc::new(move |p: &Peripheral, _rssi| {
            p.id == wanted || p.name.as_deref() == Some(wanted.as_str())
        });
        info!("Looking for {}...", args.device.as_deref().unwrap_or_default());
        ble.scan(filter, config.timeouts.scan())?
    };
    let Some(target) = target else {
        bail!(
            "device {} not found",
            args.device.as_deref().unwrap_or_default()
        );
    };
    info!("Found {}", target);
    run_update(platform, target, data, args, config, verbose)
}

fn run_update<P: BlePlatform + 'static>(
    platform: Arc<P>,
    target: Peripheral,
    data: Vec<u8>,
    args: &UpdateArgs,
    config: SessionConfig,
    verbose: bool,
) -> Result<()> {
    let executor = ThreadExecutor::new("dfuListener").context("failed to start listener thread")?;
    let mut session = DfuSession::with_config(platform, config)
        .with_engine(args.engine.into())
        .with_listener(Arc::new(ConsoleListener::default()))
        .with_executor(Arc::new(executor))
        .with_log_level(if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });

    match (args.resource, args.copy_address) {
        (Some(address), _) => session.start_resource_update(target, data, args.external, address)?,
        (None, Some(copy_address)) => session.start_dfu_in_copy_mode(target, data, copy_address)?,
        (None, None) if args.boot_entry => session.start_dfu_with_boot_entry(target, data)?,
        (None, None) => session.start_dfu(target, data)?,
    }

    match session.join() {
        Ok(Outcome::Completed) => Ok(()),
        Ok(Outcome::Cancelled { percent }) => bail!("update cancelled at {}%", percent),
        Err(e) => {
            for line in session.take_log() {
                eprintln!("{}", line);
            }
            Err(e.into())
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let blob = FirmwareBlob::classify(data);

    println!("File:       {}", path.display());
    println!("Size:       {} bytes", blob.len());
    println!("Checksum:   0x{:08X}", blob.checksum());
    match blob.image() {
        Some(image) => {
            println!("Kind:       firmware ({})", blob.encryption());
            println!("Comment:    {}", image.comment_str());
            println!("Version:    {}", image.version);
            println!("Load addr:  0x{:08X}", image.load_addr);
            println!("Run addr:   0x{:08X}", image.run_addr);
            println!("App size:   {} bytes", image.app_size);
            println!("Image sum:  0x{:08X}", image.checksum);
            let area = image.area("image");
            println!("Footprint:  {}", area);
        }
        None => println!("Kind:       resource (no image info)"),
    }
    Ok(())
}

fn config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path } => {
            SessionConfig::default().save_to_file(&path)?;
            info!("Wrote {}", path.display());
        }
        ConfigAction::Show { path } => {
            let config = SessionConfig::load_from_file(&path)?;
            println!("{:#?}", config);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x01040000"), Ok(0x0104_0000));
        assert_eq!(parse_address("0x0108_0000"), Ok(0x0108_0000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xZZ").is_err());
    }

    #[test]
    fn test_update_args_conflicts() {
        let args = Args::try_parse_from([
            "grdfu", "update", "fw.bin", "--simulate", "--resource", "0x01100000",
            "--external",
        ])
        .unwrap();
        match args.command {
            Command::Update(u) => {
                assert_eq!(u.resource, Some(0x0110_0000));
                assert!(u.external && u.simulate && u.device.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(Args::try_parse_from(["grdfu", "update", "fw.bin"]).is_err());
        assert!(
            Args::try_parse_from([
                "grdfu", "update", "fw.bin", "-d", "dev", "--resource", "0x0", "--copy-address",
                "0x0",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_simulated_update_runs_to_completion() {
        let dir = std::env::temp_dir().join(format!("grdfu-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("fw.bin");
        std::fs::write(
            &file,
            grdfu_core::sim::demo_firmware(grdfu_core::sim::SIM_APP_ADDR, 3000),
        )
        .unwrap();

        let mut config = SessionConfig {
            delays: grdfu_core::SettleDelays::none(),
            ..Default::default()
        };
        config.timeouts.scan_ms = 200;
        let config_path = dir.join("session.toml");
        config.save_to_file(&config_path).unwrap();

        let args = Args::try_parse_from([
            "grdfu",
            "update",
            file.to_str().unwrap(),
            "--simulate",
            "--engine",
            "fast",
            "--config",
            config_path.to_str().unwrap(),
        ])
        .unwrap();
        let Command::Update(update_args) = args.command else {
            panic!("expected update");
        };
        update(&update_args, false).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
