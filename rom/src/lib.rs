extern crate strum;
#[macro_use]
extern crate strum_macros;

use std::{
    fs,
    path::{Path, PathBuf},
};

use itertools::{EitherOrBoth, Itertools};
use log::{info, warn};
use strum::IntoEnumIterator;
use thiserror::Error;

use common::*;
use ucode::{program, Microprogram};

#[derive(Debug, Error)]
pub enum RomError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is {actual} bytes, expected {expected}", .path.display())]
    WrongSize {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("boot image is {0} bytes, at most {max} fit", max = BOOT_ROM_SIZE)]
    BootTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, RomError>;

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| RomError::Io {
        path: path.to_owned(),
        source,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|source| RomError::Io {
        path: path.to_owned(),
        source,
    })
}

fn read_exact_size(path: &Path, expected: usize) -> Result<Vec<u8>> {
    let bytes = read_file(path)?;
    if bytes.len() != expected {
        return Err(RomError::WrongSize {
            path: path.to_owned(),
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Flattens the microcode over every control ROM address.
///
/// Words are stored active-low adjusted, low byte in the half with the top
/// address bit clear and high byte in the other.
pub fn control_image(print: bool) -> Vec<u8> {
    if print {
        println!("v2.0 raw");
    }

    let programs: Vec<Microprogram> = (0..16u8)
        .flat_map(|flags| (0..=255u8).map(move |opcode| program(opcode, Flags::from_bits_truncate(flags))))
        .collect();

    let mut out_bytes = Vec::with_capacity(CONTROL_ROM_SIZE);
    for index in 0..CONTROL_ROM_SIZE as u32 {
        let address = ControlAddress::unpack_lsb(index);
        let p = &programs[((*address.flags as usize) << 8) | address.opcode as usize];
        let step = *address.step;
        let word = p.signals(step).to_rom();
        let out = if address.high { (word >> 8) as u8 } else { word as u8 };

        if print {
            let opcode = Opcode::iter().find(|o| *o as u8 == address.opcode);
            match p.source(step) {
                Some((file, line)) => println!(
                    "#  addr:{:05x} op:{:?} step:{:x} flags:{:?} {} source:{}:{}",
                    index,
                    opcode,
                    step,
                    address.flags(),
                    p.signals(step),
                    file,
                    line
                ),
                None => println!(
                    "#  addr:{:05x} op:{:?} step:{:x} flags:{:?} {}",
                    index,
                    opcode,
                    step,
                    address.flags(),
                    p.signals(step)
                ),
            }
            println!("{:02x}", out);
        }
        out_bytes.push(out);
    }

    info!("built {} control bytes", out_bytes.len());
    out_bytes
}

/// Builds, verifies and embeds the boot image into the ALU table.
pub fn alu_image(boot: &[u8]) -> Result<Vec<u8>> {
    if boot.len() > BOOT_ROM_SIZE {
        return Err(RomError::BootTooLarge(boot.len()));
    }

    let mut image = alu::alu(false);
    alu::verify(&image);
    alu::embed_boot(&mut image, boot);
    Ok(image)
}

#[derive(Clone, Copy, Display, Debug, PartialEq, Eq, Hash)]
#[derive(EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Chip {
    Alu,
    Control0,
    Control1,
}

impl Chip {
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{}_{}.bin", prefix, self.to_string().to_lowercase())
    }

    pub fn size(&self) -> usize {
        match self {
            Chip::Alu => ALU_ROM_SIZE,
            Chip::Control0 | Chip::Control1 => CONTROL_HALF_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RomImages {
    pub alu: Vec<u8>,
    pub control: Vec<u8>,
}

impl RomImages {
    pub fn build(boot: &[u8]) -> Result<RomImages> {
        Ok(RomImages {
            alu: alu_image(boot)?,
            control: control_image(false),
        })
    }

    pub fn control_halves(&self) -> (&[u8], &[u8]) {
        self.control.split_at(CONTROL_HALF_SIZE)
    }

    pub fn chip(&self, chip: Chip) -> &[u8] {
        match chip {
            Chip::Alu => &self.alu,
            Chip::Control0 => self.control_halves().0,
            Chip::Control1 => self.control_halves().1,
        }
    }

    fn control_path(dir: &Path, prefix: &str) -> PathBuf {
        dir.join(format!("{}_control.bin", prefix))
    }

    pub fn write(&self, dir: &Path, prefix: &str) -> Result<()> {
        let control = RomImages::control_path(dir, prefix);
        write_file(&control, &self.control)?;
        info!("wrote {}", control.display());

        for chip in Chip::iter() {
            let path = dir.join(chip.file_name(prefix));
            write_file(&path, self.chip(chip))?;
            info!("wrote {}", path.display());
        }
        Ok(())
    }

    pub fn read(dir: &Path, prefix: &str) -> Result<RomImages> {
        Ok(RomImages {
            alu: read_exact_size(&dir.join(Chip::Alu.file_name(prefix)), ALU_ROM_SIZE)?,
            control: read_exact_size(&RomImages::control_path(dir, prefix), CONTROL_ROM_SIZE)?,
        })
    }
}

/// Loads whichever `<chip file>.burned` references exist next to the images.
pub fn read_burned(dir: &Path, prefix: &str) -> Result<Vec<(Chip, Vec<u8>)>> {
    let mut burned = Vec::new();
    for chip in Chip::iter() {
        let path = dir.join(format!("{}.burned", chip.file_name(prefix)));
        if !path.exists() {
            continue;
        }
        burned.push((chip, read_exact_size(&path, chip.size())?));
    }
    Ok(burned)
}

pub fn diff_summary(built: &[u8], burned: &[u8]) -> String {
    let diffs: Vec<usize> = built
        .iter()
        .zip_longest(burned.iter())
        .positions(|pair| match pair {
            EitherOrBoth::Both(a, b) => a != b,
            _ => true,
        })
        .collect();

    match diffs.first() {
        None => "identical".to_owned(),
        Some(first) => format!("{} bytes differ, first at {:05x}", diffs.len(), first),
    }
}

/// Chips whose burned reference no longer matches the build.
pub fn compare_burned(images: &RomImages, burned: &[(Chip, Vec<u8>)]) -> Vec<Chip> {
    let mut stale = Vec::new();
    for (chip, reference) in burned {
        let built = images.chip(*chip);
        if built != reference.as_slice() {
            warn!("{} needs to be re-burned: {}", chip, diff_summary(built, reference));
            stale.push(*chip);
        }
    }
    stale
}

pub const PROGRAM_HEADER_SIZE: usize = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct SizedProgram {
    pub bytes: Vec<u8>,
    pub sum: u32,
    pub checksum: u8,
}

/// Prefixes a program with its big endian length.
pub fn prepend_size(program: &[u8]) -> SizedProgram {
    let len = program.len().min(BOOT_ROM_SIZE - PROGRAM_HEADER_SIZE);
    if len < program.len() {
        warn!("program truncated from {} to {} bytes", program.len(), len);
    }

    let mut bytes = vec![0u8; PROGRAM_HEADER_SIZE + len];
    bytes[PROGRAM_HEADER_SIZE..].copy_from_slice(&program[..len]);

    // summed before the header is filled in, over the first len bytes
    let sum: u32 = bytes[..len].iter().map(|b| *b as u32).sum();
    let checksum = (!sum).wrapping_add(1) as u8;

    bytes[..PROGRAM_HEADER_SIZE].copy_from_slice(&(len as u16).to_be_bytes());
    SizedProgram { bytes, sum, checksum }
}

pub fn sized_path(path: &Path) -> PathBuf {
    let mut out = path.as_os_str().to_owned();
    out.push(".sized");
    PathBuf::from(out)
}

pub fn write_sized(path: &Path) -> Result<SizedProgram> {
    let program = read_file(path)?;
    let sized = prepend_size(&program);
    info!(
        "read {} bytes, sum of bytes is 0x{:02x}, checksum: 0x{:02x}",
        sized.bytes.len() - PROGRAM_HEADER_SIZE,
        sized.sum,
        sized.checksum
    );
    write_file(&sized_path(path), &sized.bytes)?;
    Ok(sized)
}
