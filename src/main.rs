use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use nrfdfu_secure::manager::DfuManager;
use nrfdfu_secure::package::{FwType, Package};
use nrfdfu_secure::transport_btleplug::BtleplugClient;

/// Update firmware on nRF52 Secure DFU targets
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the update package zip file
    pkg_path: PathBuf,

    /// BLE advertising name of the DFU target
    #[arg(long, default_value = "DfuTarg")]
    target: String,

    /// Update type (L: legacy, O: open, S: secure, B: buttonless)
    #[arg(long, value_enum, default_value = "S")]
    mode: Mode,

    /// Path to the log file
    #[arg(long, default_value = "dfu.log")]
    log: PathBuf,

    /// Print the parsed init packets of the given image types and exit
    #[arg(long, value_name = "TYPE", num_args = 1..)]
    print_init: Option<Vec<FwType>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    #[value(name = "L")]
    Legacy,
    #[value(name = "O")]
    Open,
    #[value(name = "S")]
    Secure,
    #[value(name = "B")]
    Buttonless,
}

/// Writes log output to the log file and mirrors it to stderr.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        io::stderr().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        io::stderr().flush()
    }
}

/// Rotate the log name by appending `-N` before the extension until the
/// path is unused.
fn unique_log_path(base: &Path) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dfu")
        .to_owned();
    let ext = base.extension().and_then(|s| s.to_str());
    let mut idx = 0;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem}-{idx}.{ext}"),
            None => format!("{stem}-{idx}"),
        };
        let path = base.with_file_name(name);
        if !path.exists() {
            return path;
        }
        idx += 1;
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_path = unique_log_path(&args.log);
    let file = File::create(&log_path)
        .with_context(|| format!("cannot create log file {}", log_path.display()))?;
    // Info and higher by default, overridable via `RUST_LOG`.
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .init();

    let package = Package::load(&args.pkg_path)
        .map_err(|e| anyhow!("{} (code {}): {}", e, e.code(), args.pkg_path.display()))?;

    if let Some(types) = &args.print_init {
        for fw_type in types {
            let image = package
                .image(*fw_type)
                .ok_or_else(|| anyhow!("package does not contain a {fw_type} image"))?;
            println!("{fw_type}: {:#?}", image.init_packet);
            if let Some(hash) = package
                .firmware_hash(*fw_type)
                .map_err(|e| anyhow!("{e} (code {})", e.code()))?
            {
                println!("{fw_type} firmware hash: {}", hex(&hash));
            }
        }
        return Ok(());
    }

    if args.mode != Mode::Secure {
        bail!("mode not supported");
    }

    log::info!("starting dfu with pkg {}", args.pkg_path.display());

    let client = BtleplugClient::new()
        .await
        .map_err(|e| anyhow!("{} (code {})", e, e.code()))?;
    let mut manager = DfuManager::new(client, args.target, package);
    match manager.run().await {
        Ok(()) => {
            log::info!("firmware update finished");
            Ok(())
        }
        Err(e) => {
            log::error!("dfu failed: {e} (code {})", e.code());
            Err(anyhow!("{} (code {})", e, e.code()))
        }
    }
}
