use crate::{utils, vault::Vault};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Print cached content keys from the vault as KID:KEY lines.
#[derive(Args, Clone, Debug)]
pub struct Keys {
    /// Service tag the keys were negotiated for.
    #[arg(required = true)]
    service: String,

    /// Restrict the listing to one content id.
    #[arg(long)]
    content_id: Option<String>,

    /// Key vault database path.
    #[arg(long)]
    vault: Option<PathBuf>,
}

impl Keys {
    pub async fn execute(self) -> Result<()> {
        let vault_path = self
            .vault
            .clone()
            .unwrap_or_else(|| utils::data_dir().join("vault.db"));
        let vault = Vault::open(&vault_path).await?;

        for line in vault
            .export(&self.service.to_lowercase(), self.content_id.as_deref())
            .await?
        {
            println!("{line}");
        }

        Ok(())
    }
}
