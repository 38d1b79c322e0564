//! Image info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    rzflash::{
        Image, ImageFormat, NativePortEnumerator, PortEnumerator, image, protocol::DEFAULT_CHUNK_SIZE,
    },
    std::path::Path,
};

use crate::CliError;

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }

    Ok(())
}

/// Decode an image, choosing the format from its extension.
///
/// Unknown extensions are treated as raw binary.
fn load_image(file: &Path) -> Result<Image> {
    if !file.is_file() {
        return Err(CliError::Config(format!("Image not found: {}", file.display())).into());
    }

    let format = ImageFormat::from_extension(file).unwrap_or(ImageFormat::RawBinary);
    image::decode(file, format, DEFAULT_CHUNK_SIZE)
        .with_context(|| format!("Failed to load image {}", file.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(file: &Path, json: bool) -> Result<()> {
    if json {
        return cmd_info_json(file);
    }

    eprintln!("{} Loading image: {}", style("📦").cyan(), file.display());
    let image = load_image(file)?;

    eprintln!("\n{}", style("Image Information").bold().underlined());
    eprintln!("  Format: {}", image.format);
    if let Some(width) = image.width {
        eprintln!("  Address width: {} bits", width.bytes() * 8);
    }
    eprintln!("  Records: {}", image.data_records().count());
    eprintln!("  Payload: {} bytes", image.payload_len());
    match image.address_range() {
        Some((start, end)) => eprintln!("  Address range: 0x{start:08X} - 0x{end:08X}"),
        None => eprintln!("  Address range: {}", style("none").dim()),
    }
    if let Some(entry) = image.entry_point() {
        eprintln!("  Entry point: 0x{entry:08X}");
    }

    Ok(())
}

/// Info command `--json` output: structured JSON to stdout.
fn cmd_info_json(file: &Path) -> Result<()> {
    let image = load_image(file)?;
    println!("{}", serde_json::to_string_pretty(&image_json(&image))?);
    Ok(())
}

fn image_json(image: &Image) -> serde_json::Value {
    let format = match image.format {
        ImageFormat::SRecord => "srec",
        ImageFormat::RawBinary => "raw",
    };
    let range = image.address_range().map(|(start, end)| {
        serde_json::json!({
            "start": format!("0x{start:08X}"),
            "end": format!("0x{end:08X}"),
        })
    });

    serde_json::json!({
        "ok": true,
        "data": {
            "path": image.path.display().to_string(),
            "format": format,
            "address_bits": image.width.map(|w| w.bytes() * 8),
            "records": image.data_records().count(),
            "payload_bytes": image.payload_len(),
            "address_range": range,
            "entry_point": image.entry_point().map(|e| format!("0x{e:08X}")),
        }
    })
}
