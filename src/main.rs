//! PDF Compressor CLI
//!
//! Command-line interface for compressing PDF files.

use anyhow::Context;
use clap::Parser;
use compress_pdf::{compress, default_output_path, format_file_size, get_file_info};
use std::path::PathBuf;

/// Compress a PDF file while keeping text readable
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    #[arg(short, long)]
    input: PathBuf,

    /// Output PDF file path (defaults to <input>_compressed.pdf)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Compression quality (1-100, higher keeps more detail)
    #[arg(short, long, default_value = "80")]
    quality: u8,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&args.input));

    println!("PDF Compressor");
    println!("==============");

    let outcome = compress(&args.input, &output, args.quality);
    if !outcome.success {
        anyhow::bail!(outcome.message);
    }

    let input_size = get_file_info(&args.input)
        .with_context(|| format!("Failed to read input file: {}", args.input.display()))?;
    let output_size = get_file_info(&output)
        .with_context(|| format!("Failed to read output file: {}", output.display()))?;

    println!("\n{}", outcome.message);
    println!(
        "Size: {} -> {}",
        format_file_size(input_size),
        format_file_size(output_size)
    );
    println!("Output saved to: {:?}", output);

    Ok(())
}
