//! HEX file info command implementation.

use {
    super::boards::resolve_board,
    crate::{Cli, config::Config},
    anyhow::{Context, Result},
    console::style,
    std::path::Path,
    stkflash::{BoardProfile, HexImage, ParseOptions},
};

fn load(file: &Path, config: &Config) -> Result<HexImage> {
    let options = ParseOptions {
        verify_checksums: config.upload.verify_hex_checksum,
    };
    HexImage::from_file(file, options).with_context(|| format!("Failed to load {}", file.display()))
}

fn info_json(file: &Path, image: &HexImage, board: &BoardProfile) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "file": file.display().to_string(),
            "size": image.len(),
            "records": image.record_count(),
            "load_address": image.load_address().map(|a| format!("0x{a:04X}")),
            "board": board.id,
            "page_size": board.page_size,
            "pages": image.page_count(board.page_size),
        }
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, file: &Path, json: bool) -> Result<()> {
    let image = load(file, config)?;
    let board = resolve_board(cli, config)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(file, &image, &board))?
        );
        return Ok(());
    }

    eprintln!(
        "{} {}",
        style("📦").cyan(),
        file.display()
    );
    eprintln!("\n{}", style("Image").bold().underlined());
    eprintln!("  Size:         {} bytes", image.len());
    eprintln!("  Data records: {}", image.record_count());
    match image.load_address() {
        Some(addr) => eprintln!("  Load address: 0x{addr:04X}"),
        None => eprintln!("  Load address: {}", style("none").dim()),
    }
    eprintln!(
        "  Pages:        {} x {} bytes ({})",
        image.page_count(board.page_size),
        board.page_size,
        board.id
    );
    if image.is_empty() {
        eprintln!(
            "  {} the file contains no program data",
            style("⚠").yellow()
        );
    }
    Ok(())
}
