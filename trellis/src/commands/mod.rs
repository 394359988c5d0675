mod dl;
mod keys;
mod license;

pub use dl::Dl;
pub use keys::Keys;
pub use license::License;

use clap::{ColorChoice, Parser, Subcommand};

/// Download, license and decrypt DRM protected streams from supported services.
#[derive(Debug, Parser)]
#[command(version, author = "clitic <clitic21@gmail.com>", about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// When to output colored text.
    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Enable debug logs.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Dl(Dl),
    Keys(Keys),
    License(License),
}
