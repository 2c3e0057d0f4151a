//! Man page generator for stkflash
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::PathBuf;

#[path = "../cli.rs"]
mod cli;

fn main() -> std::io::Result<()> {
    let output_dir = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from("man"), PathBuf::from);
    fs::create_dir_all(&output_dir)?;

    // One page for the whole tool; subcommands are sections of it
    let mut page = Vec::new();
    clap_mangen::Man::new(cli::Cli::command()).render(&mut page)?;

    let output_path = output_dir.join("stkflash.1");
    fs::write(&output_path, page)?;
    println!("Wrote {} (view with: man -l {})", output_path.display(), output_path.display());

    Ok(())
}
