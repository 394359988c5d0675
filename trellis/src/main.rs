mod commands;
mod config;
mod downloader;
mod license;
mod logger;
mod manifest;
mod progress;
mod selector;
mod services;
mod utils;
mod vault;

use clap::{ColorChoice, Parser};
use colored::Colorize;
use commands::{Args, Commands};
use log::LevelFilter;
use std::{
    io::{IsTerminal, stderr},
    process,
};

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Commands::Dl(args) => args.execute().await,
        Commands::Keys(args) => args.execute().await,
        Commands::License(args) => args.execute().await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let colors = match args.color {
        ColorChoice::Always => true,
        ColorChoice::Auto => stderr().is_terminal(),
        ColorChoice::Never => false,
    };
    colored::control::set_override(colors);
    kdam::term::init(colors);

    log::set_logger(&logger::Logger).expect("no logger set before main");
    log::set_max_level(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    if let Err(e) = run(args).await {
        eprintln!("{}: {:#}", "error".bold().red(), e);
        process::exit(1);
    }
}
