use crate::{commands::dl::security_level_parser, utils};
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use reqwest::{
    Client, Url,
    header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
};
use std::{path::{Path, PathBuf}, sync::Arc};
use trellis_cdm::{IdentityStore, ProtectionHeader, SecurityLevel, Session};

/// Request content keys from a license server.
#[derive(Args, Clone, Debug)]
pub struct License {
    /// Protection header input: base64 or a raw header file path.
    #[arg(required = true, value_name = "PATH|BASE64")]
    input: String,

    /// License server url.
    #[arg(short, long)]
    server: Url,

    /// Directory holding provisioned device identities.
    #[arg(long, value_name = "DIR")]
    devices: Option<PathBuf>,

    /// Security level of the device identity to license with.
    #[arg(long, default_value = "l3", value_parser = security_level_parser)]
    security_level: SecurityLevel,

    /// Extra headers for the license request.
    ///
    /// This option can be used multiple times.
    #[arg(short = 'H', long = "header", value_name = "KEY:VALUE", value_parser = Self::parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl License {
    fn parse_header(value: &str) -> Result<(HeaderName, HeaderValue)> {
        if let Some((k, v)) = value.split_once(':') {
            Ok((k.trim().parse()?, v.trim().parse()?))
        } else {
            bail!("Expected 'KEY:VALUE' but found '{}'.", value);
        }
    }

    pub async fn execute(self) -> Result<()> {
        let header = if Path::new(&self.input).exists() {
            ProtectionHeader::parse(&std::fs::read(&self.input)?)?
        } else {
            ProtectionHeader::from_base64(&self.input)?
        };

        let devices_dir = self
            .devices
            .clone()
            .unwrap_or_else(|| utils::data_dir().join("devices"));
        let device = IdentityStore::new(devices_dir).load(self.security_level)?;

        let mut session = Session::new(Arc::new(device), header)?;
        let challenge = session.build_challenge()?;
        session.submitted()?;

        let client = Client::builder()
            .default_headers(HeaderMap::from_iter(self.headers))
            .build()?;
        let response = client
            .post(self.server.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(challenge)
            .send()
            .await?;
        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            bail!(
                "License request failed ({}): '{}'",
                status,
                response.text().await?
            );
        }

        let body = response.bytes().await?;
        session.validate_response(&body)?;
        session.derive_keys()?;

        for key in session.close()? {
            println!(
                "[{}] {}:{}",
                key.kind.to_string().to_uppercase().green(),
                key.kid_hex(),
                key.key_hex()
            );
        }

        Ok(())
    }
}
