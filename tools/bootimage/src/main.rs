//! Lumen OS disk image builder
//!
//! `bootimage <kernel-binary> [output-dir]` writes `lumen-bios.img` and
//! `lumen-uefi.img` next to the kernel (or into `output-dir`).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bootloader::DiskImageBuilder;

#[derive(Clone, Copy)]
enum Firmware {
    Bios,
    Uefi,
}

impl Firmware {
    fn file_name(self) -> &'static str {
        match self {
            Firmware::Bios => "lumen-bios.img",
            Firmware::Uefi => "lumen-uefi.img",
        }
    }

    fn qemu_command(self, image: &Path) -> String {
        let drive = format!("-drive format=raw,file={} -serial stdio", image.display());
        match self {
            Firmware::Bios => format!("qemu-system-x86_64 {}", drive),
            Firmware::Uefi => format!("qemu-system-x86_64 -bios /usr/share/OVMF/OVMF_CODE.fd {}", drive),
        }
    }

    fn build(self, builder: &DiskImageBuilder, image: &Path) -> Result<(), String> {
        let result = match self {
            Firmware::Bios => builder.create_bios_image(image),
            Firmware::Uefi => builder.create_uefi_image(image),
        };
        result.map_err(|e| format!("{}: {}", image.display(), e))
    }
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(kernel) = args.next().map(PathBuf::from) else {
        eprintln!("Usage: bootimage <kernel-binary> [output-dir]");
        return ExitCode::FAILURE;
    };
    if !kernel.is_file() {
        eprintln!("Error: kernel binary not found: {}", kernel.display());
        return ExitCode::FAILURE;
    }
    let out_dir = match args.next() {
        Some(dir) => PathBuf::from(dir),
        None => kernel.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
    };

    let builder = DiskImageBuilder::new(kernel.clone());
    println!("Building disk images for {}", kernel.display());

    for firmware in [Firmware::Bios, Firmware::Uefi] {
        let image = out_dir.join(firmware.file_name());
        if let Err(e) = firmware.build(&builder, &image) {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
        println!("  {}", image.display());
        println!("    run: {}", firmware.qemu_command(&image));
    }

    ExitCode::SUCCESS
}
