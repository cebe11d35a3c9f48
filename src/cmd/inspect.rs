use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use image_inspector::progress::{Spinner, format_bytes};
use image_inspector::runtime::engine::EngineClient;
use image_inspector::{ImageInspector, InspectOptions, Inspection};

pub async fn run(options: &InspectOptions, json: Option<&str>, verbose: bool) -> Result<()> {
    options.validate()?;

    let client = EngineClient::new(&options.docker_host)?;
    let mut inspector = ImageInspector::new(Arc::new(client));

    // Log lines would be drawn over by the spinner.
    let spinner = if verbose {
        Spinner::hidden()
    } else {
        Spinner::new(format!("Inspecting {} ...", options.image))
    };
    inspector.set_progress_bar(spinner.clone_bar());

    let inspection = match inspector.inspect(options).await {
        Ok(inspection) => inspection,
        Err(err) => {
            spinner.fail(format!("Inspection of {} failed ({})", options.image, err.phase()));
            return Err(err.into());
        }
    };

    spinner.finish(format!(
        "Extracted {} entries ({}) to {}",
        inspection.summary.entries,
        format_bytes(inspection.summary.bytes),
        inspection.destination.display()
    ));

    match json {
        Some(dest) => write_json(&inspection, dest),
        None => {
            print_summary(&inspection);
            Ok(())
        }
    }
}

fn write_json(inspection: &Inspection, dest: &str) -> Result<()> {
    let output = serde_json::to_string_pretty(inspection)?;
    if dest == "-" {
        println!("{output}");
    } else {
        fs::write(dest, &output).with_context(|| format!("Failed to write JSON to {dest}"))?;
        eprintln!("{} Wrote {dest}", "✔".green());
    }
    Ok(())
}

fn print_summary(inspection: &Inspection) {
    let meta = &inspection.metadata;
    println!("{}", style::style(&inspection.image).bold());
    println!("  id: {}", meta.id);
    if let (Some(os), Some(arch)) = (&meta.os, &meta.architecture) {
        println!("  platform: {os}/{arch}");
    }
    println!("  size: {}", format_bytes(meta.size));
    if let Some(rootfs) = &meta.rootfs {
        println!("  layers: {}", rootfs.layers.len());
    }
    println!(
        "  pulled: {}",
        if inspection.pulled { "yes" } else { "no (already present)" }
    );
    println!("  destination: {}", inspection.destination.display());
    if inspection.summary.skipped > 0 {
        println!(
            "  {} {} entries skipped",
            "!".yellow().bold(),
            inspection.summary.skipped
        );
    }
}
