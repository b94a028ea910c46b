//! Probe command implementation.

use {
    super::{
        boards::resolve_board,
        upload::{ProgressReporter, UploadFlags, build_upload_config, ensure_not_interrupted},
    },
    crate::{Cli, config::Config, get_port},
    anyhow::{Context, Result},
    console::style,
    stkflash::{AvrFlasher, BootloaderInfo, NativePortOpener, ProgressEvent},
};

fn signature_hex(signature: [u8; 3]) -> String {
    format!(
        "{:02X} {:02X} {:02X}",
        signature[0], signature[1], signature[2]
    )
}

fn info_json(port: &str, info: &BootloaderInfo) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "port": port,
            "signature": signature_hex(info.signature),
            "chip": info.chip_name(),
            "bootloader_version": format!("{}.{}", info.version.0, info.version.1),
            "baud_rate": info.baud_rate,
            "reset_variant": info.reset_variant,
        }
    })
}

/// Probe command implementation.
pub(crate) fn cmd_probe(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    ensure_not_interrupted()?;

    let board = resolve_board(cli, config)?;
    let probe_config = build_upload_config(cli, config, &board, &UploadFlags::default())?;
    let port = get_port(cli, config)?;

    let mut flasher = AvrFlasher::new(NativePortOpener::new(&port), probe_config);
    // JSON mode keeps stderr free of progress output.
    let probed = if json {
        flasher.probe(&mut |_: &ProgressEvent| {})
    } else {
        flasher.probe(&mut ProgressReporter::new(cli))
    };
    let info = probed.context("Probe failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info_json(&port, &info))?);
        return Ok(());
    }

    eprintln!("\n{}", style("Bootloader").bold().underlined());
    eprintln!("  Port:      {port}");
    eprintln!(
        "  Signature: {} ({})",
        signature_hex(info.signature),
        info.chip_name().unwrap_or("unknown chip")
    );
    eprintln!("  Version:   {}.{}", info.version.0, info.version.1);
    eprintln!(
        "  Link:      {} baud, {} reset",
        info.baud_rate, info.reset_variant
    );
    Ok(())
}
