use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt};
use clap::Parser;
use clap_derive::Parser;
use log::{info, warn};

mod io;
mod utils;
mod vm;


use vm::cpu::{hard_exit, Cpu};
use vm::memory::{Memory, RomProvider, BIOS_ROM, BOOT_ADDR, LOW_WINDOW};

#[derive(Parser, Debug)]
#[command(name = "emu386", about = "80386 PC emulator")]
struct Cli {
    /// BIOS ROM image, mapped at the top of the low 1 MiB window.
    #[arg(long)]
    rom: Option<PathBuf>,

    /// Boot sector image, loaded at 0000:7C00.
    #[arg(long)]
    floppy: Option<PathBuf>,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 16)]
    ram: usize,

    /// Start execution at SEG:OFF (hex) instead of the BIOS entry.
    #[arg(long)]
    autotest: Option<String>,

    /// Stop after this many instructions (autotest runs).
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn read_image(path: &PathBuf) -> Vec<u8> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            if let Err(error) = file.read_to_end(&mut data) {
                hard_exit(&format!("reading {}: {error}", path.display()));
            }
        }
        Err(error) => hard_exit(&format!("opening {}: {error}", path.display())),
    }
    data
}

fn parse_entry(spec: &str) -> Option<(u16, u32)> {
    let (seg, off) = spec.split_once(':')?;
    Some((
        u16::from_str_radix(seg, 16).ok()?,
        u32::from_str_radix(off, 16).ok()?,
    ))
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let mut memory = Memory::new(args.ram * 1024 * 1024);

    if let Some(path) = &args.rom {
        let image = read_image(path);
        if image.len() > (LOW_WINDOW - BIOS_ROM) as usize {
            hard_exit("ROM image does not fit the BIOS window");
        }
        // ROMs map with their last byte at the top of the low window;
        // front-pad to a provider block boundary.
        let padded_len = image.len().div_ceil(0x4000) * 0x4000;
        let mut data = vec![0xFFu8; padded_len - image.len()];
        data.extend_from_slice(&image);
        let base = LOW_WINDOW - padded_len as u32;
        info!("[loader] ROM {} at {base:#07x}", path.display());
        memory.register_provider(Box::new(RomProvider::new(base, data)));
    }

    if let Some(path) = &args.floppy {
        let image = read_image(path);
        if image.len() < 512 {
            hard_exit("boot image shorter than one sector");
        }
        let signature = Cursor::new(&image[510..512])
            .read_u16::<LittleEndian>()
            .unwrap_or(0);
        if signature != 0xAA55 {
            warn!("[loader] boot sector signature is {signature:#06x}, not AA55");
        }
        memory.copy_data(BOOT_ADDR as usize, &image[..512]);
        info!("[loader] boot sector from {} at {BOOT_ADDR:#07x}", path.display());
    }

    let mut cpu = Cpu::new(memory);
    if let Some(spec) = &args.autotest {
        match parse_entry(spec) {
            Some(entry) => {
                cpu.autotest_entry = Some(entry);
                cpu.reset();
            }
            None => hard_exit("autotest entry must be SEG:OFF in hex"),
        }
    } else if args.rom.is_none() && args.floppy.is_none() {
        hard_exit("nothing to run: give --rom, --floppy or --autotest");
    }
    cpu.cycle_limit = args.max_cycles;

    cpu.run();
    info!("[cpu] stopped after {} instructions", cpu.cycle);
}
