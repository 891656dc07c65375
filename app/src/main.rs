use std::{error::Error, fs, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use common::{Flags, Opcode};
use rom::RomImages;
use sim::bridge::{self, BridgeConfig};
use sim::Images;

type AppResult = Result<(), Box<dyn Error>>;

#[derive(Parser, Debug)]
#[command(name = "lutcpu", version, about = "ROM builder and emulator for the LUT computer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and self-test the ROM images, then write them with the assembler rules.
    Build {
        /// Boot program embedded in the ALU image.
        #[arg(short, long)]
        boot: Option<PathBuf>,

        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        #[arg(short, long, default_value = "lutcpu")]
        prefix: String,
    },

    /// Print the customasm rules.
    Rules,

    /// Print the control ROM trace, or the microprograms of one opcode.
    Ucode {
        #[arg(long)]
        opcode: Option<Opcode>,
    },

    /// Print the ALU ROM trace.
    Alu,

    /// Prepend the length header to a program, writing `<path>.sized`.
    Size { path: PathBuf },

    /// Power on the emulator and bridge its UART to one TCP client.
    Run {
        /// Boot program to build images from.
        #[arg(short, long, conflicts_with = "images")]
        boot: Option<PathBuf>,

        /// Directory holding previously written images.
        #[arg(short, long)]
        images: Option<PathBuf>,

        #[arg(long, default_value = "lutcpu")]
        prefix: String,

        #[arg(long, default_value_t = 2323)]
        port: u16,

        /// Sleep in microseconds inserted every 128 cycles.
        #[arg(long, default_value_t = 9)]
        pause_us: u64,
    },
}

fn read_boot(boot: Option<PathBuf>) -> Result<Vec<u8>, Box<dyn Error>> {
    match boot {
        Some(path) => {
            let bytes = fs::read(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
            info!("boot image {} is {} bytes", path.display(), bytes.len());
            Ok(bytes)
        }
        None => Ok(Vec::new()),
    }
}

fn build(boot: Option<PathBuf>, out: PathBuf, prefix: String) -> AppResult {
    let boot = read_boot(boot)?;
    let images = RomImages::build(&boot)?;

    let burned = rom::read_burned(&out, &prefix)?;
    let stale = rom::compare_burned(&images, &burned);
    if !burned.is_empty() && stale.is_empty() {
        info!("all {} burned images match", burned.len());
    }

    images.write(&out, &prefix)?;

    let rules = out.join(format!("{}.inc", prefix));
    fs::write(&rules, ucode::asm_rules()).map_err(|e| format!("{}: {}", rules.display(), e))?;
    info!("wrote {}", rules.display());

    for chip in stale {
        warn!("{} must be re-burned from {}", chip, out.join(chip.file_name(&prefix)).display());
    }
    Ok(())
}

fn print_ucode(opcode: Option<Opcode>) {
    match opcode {
        None => {
            rom::control_image(true);
        }
        Some(opcode) => {
            for flags in (0..16u8).map(Flags::from_bits_truncate).filter(|f| f.contains(Flags::INIT)) {
                println!("# {:?} flags:[{:?}]", opcode, flags);
                ucode::microprogram(opcode, flags).print();
            }
        }
    }
}

fn run(boot: Option<PathBuf>, images: Option<PathBuf>, prefix: String, port: u16, pause_us: u64) -> AppResult {
    let roms = match images {
        Some(dir) => RomImages::read(&dir, &prefix)?,
        None => RomImages::build(&read_boot(boot)?)?,
    };

    let config = BridgeConfig {
        port,
        pause: Duration::from_micros(pause_us),
        ..BridgeConfig::default()
    };
    bridge::serve(Images::from(&roms), config)?;
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Build { boot, out, prefix } => build(boot, out, prefix),
        Command::Rules => {
            print!("{}", ucode::asm_rules());
            Ok(())
        }
        Command::Ucode { opcode } => {
            print_ucode(opcode);
            Ok(())
        }
        Command::Alu => {
            alu::alu(true);
            Ok(())
        }
        Command::Size { path } => rom::write_sized(&path).map(|_| ()).map_err(Into::into),
        Command::Run {
            boot,
            images,
            prefix,
            port,
            pause_us,
        } => run(boot, images, prefix, port, pause_us),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
