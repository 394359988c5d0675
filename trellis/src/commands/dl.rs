use crate::{
    config::CredentialStore,
    downloader::{self, DownloadOptions, RUNNING},
    license::{HttpTransport, KeyBroker},
    selector::{self, Filters, Quality, Wanted},
    services::{ResolvedTitle, Service, ServiceOptions},
    utils,
    vault::Vault,
};
use anyhow::{Context, Result, bail};
use clap::Args;
use log::{error, info, warn};
use reqwest::{
    Client, Proxy, Url,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use std::{
    collections::HashSet,
    path::PathBuf,
    sync::atomic::Ordering,
    time::Duration,
};
use trellis_cdm::{IdentityStore, ProtectionHeader, ProtectionSystem, SecurityLevel, header};

/// Download titles from a service.
#[derive(Debug, Clone, Args)]
pub struct Dl {
    /// Service tag (see `from_tag` registry), e.g. direct.
    #[arg(required = true)]
    pub service: String,

    /// Title reference understood by the service.
    /// For the direct service this is a DASH manifest url.
    #[arg(required = true)]
    pub url: String,

    /// Preferred audio language in RFC 5646 format (eg. fr or en-AU).
    /// Errors out when no audio track matches.
    #[arg(long, help_heading = "Selection Options")]
    pub audio_lang: Option<String>,

    /// Subtitle language to download alongside the streams.
    /// Errors out when no subtitle track matches.
    #[arg(long, help_heading = "Selection Options")]
    pub sub_lang: Option<String>,

    /// Video quality to select.
    /// common values: [best, worst, 1080p, 720p, WIDTHxHEIGHT]
    #[arg(short, long, help_heading = "Selection Options", default_value = "best", value_parser = Quality::parse)]
    pub quality: Quality,

    /// Episodes to download when the title resolves to a season or series,
    /// e.g. S01E01-S01E08, S02, 1-8 or a comma separated mix.
    #[arg(short, long, help_heading = "Selection Options", value_parser = Wanted::parse)]
    pub wanted: Option<Wanted>,

    /// Resolve the title and print its manifests in json format instead of
    /// downloading anything.
    #[arg(long)]
    pub parse: bool,

    /// Custom headers for requests.
    /// This option can be used multiple times.
    #[arg(long, help_heading = "Client Options", num_args = 2, value_names = &["KEY", "VALUE"])]
    pub header: Vec<String>,

    /// Skip checking and validation of site certificates.
    #[arg(long, help_heading = "Client Options")]
    pub no_certificate_checks: bool,

    /// Set http(s) / socks proxy address for requests.
    #[arg(long, help_heading = "Client Options", value_parser = proxy_address_parser)]
    pub proxy: Option<Proxy>,

    /// Update and set user agent header for requests.
    #[arg(
        long,
        help_heading = "Client Options",
        default_value = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36"
    )]
    pub user_agent: String,

    /// License server url, for services that do not advertise one.
    #[arg(long, help_heading = "License Options")]
    pub license_url: Option<Url>,

    /// Base64 protection header to license against, overriding what the
    /// manifest declares.
    #[arg(long, help_heading = "License Options")]
    pub pssh: Option<String>,

    /// Vault content id override. By default the manifest's default KID
    /// is used, which stays stable across runs.
    #[arg(long, help_heading = "License Options")]
    pub content_id: Option<String>,

    /// Directory holding provisioned device identities (l1.did, l3.did, ...).
    #[arg(long, help_heading = "License Options", value_name = "DIR")]
    pub devices: Option<PathBuf>,

    /// Security level of the device identity to license with.
    #[arg(long, help_heading = "License Options", default_value = "l3", value_parser = security_level_parser)]
    pub security_level: SecurityLevel,

    /// Maximum number of retries for a license challenge on transient
    /// failures. Entitlement denials are never retried.
    #[arg(long, help_heading = "License Options", default_value_t = 3)]
    pub license_retries: u8,

    /// Key vault database path.
    #[arg(long, help_heading = "License Options")]
    pub vault: Option<PathBuf>,

    /// Credentials file (json object keyed by service tag).
    #[arg(long, help_heading = "License Options")]
    pub credentials: Option<PathBuf>,

    /// Change directory path for temporarily downloaded files.
    /// By default current working directory is used.
    #[arg(short, long, help_heading = "Download Options")]
    pub directory: Option<PathBuf>,

    /// Mux downloaded streams to a video container (.mp4, .mkv, etc.) using ffmpeg.
    #[arg(short, long, help_heading = "Download Options")]
    pub output: Option<PathBuf>,

    /// Keep temporary stream files after muxing.
    #[arg(long, help_heading = "Download Options")]
    pub keep_segments: bool,

    /// Maximum number of retries to download an individual segment.
    #[arg(long, help_heading = "Download Options", default_value_t = 15)]
    pub retry_count: u8,

    /// Maximum number of parallel segment downloads.
    /// Number of threads should be in range 1-16 (inclusive).
    #[arg(short, long, help_heading = "Download Options", default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub threads: u8,
}

impl Dl {
    fn client(&self) -> Result<Client> {
        let mut client_builder = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(self.no_certificate_checks)
            .user_agent(&self.user_agent)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120));

        if !self.header.is_empty() {
            let mut headers = HeaderMap::new();

            for i in (0..self.header.len()).step_by(2) {
                headers.insert(
                    self.header[i].parse::<HeaderName>()?,
                    self.header[i + 1].parse::<HeaderValue>()?,
                );
            }

            client_builder = client_builder.default_headers(headers);
        }

        if let Some(proxy) = &self.proxy {
            client_builder = client_builder.proxy(proxy.clone());
        }

        Ok(client_builder.build()?)
    }

    pub async fn execute(self) -> Result<()> {
        let client = self.client()?;

        let service = Service::from_tag(
            &self.service,
            ServiceOptions {
                license_url: self.license_url.clone(),
                content_id: self.content_id.clone(),
            },
        )?;

        let credentials = CredentialStore::load(self.credentials.as_deref())?;
        let context = service
            .authenticate(&client, &credentials.get(service.tag()))
            .await
            .context("authentication failed")?;

        let titles = service.resolve(&client, &context, &self.url).await?;
        let titles = selector::filter_titles(titles, self.wanted.as_ref())?;

        if self.parse {
            let manifests = titles.iter().map(|x| &x.manifest).collect::<Vec<_>>();
            serde_json::to_writer(std::io::stdout(), &manifests)?;
            return Ok(());
        }

        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() && RUNNING.load(Ordering::SeqCst) {
                warn!("Ctrl+C received, stopping gracefully.");
                RUNNING.store(false, Ordering::SeqCst);
            }

            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Ctrl+C received, force exiting.");
                std::process::exit(1);
            }
        });

        let vault_path = self
            .vault
            .clone()
            .unwrap_or_else(|| utils::data_dir().join("vault.db"));
        let devices_dir = self
            .devices
            .clone()
            .unwrap_or_else(|| utils::data_dir().join("devices"));

        let broker = KeyBroker::new(
            HttpTransport::new(client.clone()),
            Vault::open(&vault_path).await?,
            IdentityStore::new(devices_dir),
            self.security_level,
            self.license_retries,
            Duration::from_millis(500),
        );

        let total = titles.len();
        let mut failures = 0;

        for title in &titles {
            if !RUNNING.load(Ordering::SeqCst) {
                bail!("cancelled before the batch finished.");
            }

            info!("Downloading {}", title.display_name());

            // One failed title never takes the rest of the batch down.
            if let Err(e) = self.download_title(&client, &broker, title, total).await {
                failures += 1;
                error!("{}: {:#}", title.display_name(), e);
            }
        }

        if failures > 0 {
            bail!("{failures} of {total} titles failed.");
        }

        Ok(())
    }

    async fn download_title(
        &self,
        client: &Client,
        broker: &KeyBroker<HttpTransport>,
        title: &ResolvedTitle,
        batch_size: usize,
    ) -> Result<()> {
        let filters = Filters {
            audio_lang: self.audio_lang.clone(),
            sub_lang: self.sub_lang.clone(),
            quality: Some(self.quality.clone()),
        };

        let tracks = selector::select_tracks(&title.manifest.tracks, &filters)?;

        let required_kids = tracks
            .iter()
            .filter_map(|x| x.encryption.required_kid())
            .map(|x| x.to_owned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let encrypted = tracks
            .iter()
            .any(|x| x.encryption != crate::manifest::TrackEncryption::Clear);

        let keys = if encrypted {
            let header = self.protection_header(&required_kids)?;
            let license_url = title.license_url.as_ref().ok_or_else(|| {
                anyhow::anyhow!("title is encrypted but no license url is available (--license-url)")
            })?;

            broker
                .obtain(
                    &title.service,
                    &title.content_id,
                    &header,
                    license_url,
                    &required_kids,
                )
                .await?
        } else {
            Default::default()
        };

        let output = self.output.as_ref().map(|output| {
            if batch_size > 1 {
                let ext = output
                    .extension()
                    .map(|x| x.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mkv".to_owned());
                output.with_file_name(format!("{}.{}", title.display_name(), ext))
            } else {
                output.clone()
            }
        });

        let options = DownloadOptions {
            directory: self.directory.clone(),
            output,
            threads: self.threads,
            retry_count: self.retry_count,
            keep_segments: self.keep_segments,
        };

        downloader::download_title(client, &title.display_name(), tracks, &keys, &options).await
    }

    /// Resolve the protection header to license against: an explicit --pssh
    /// wins, otherwise one is assembled from the manifest's key ids.
    fn protection_header(&self, required_kids: &[String]) -> Result<ProtectionHeader> {
        if let Some(pssh) = &self.pssh {
            return Ok(ProtectionHeader::from_base64(pssh)?);
        }

        let mut kids = vec![];

        for kid in required_kids {
            let bytes = hex::decode(kid)?;
            kids.push(<[u8; 16]>::try_from(bytes.as_slice()).map_err(|_| {
                anyhow::anyhow!("default kid {kid} is not 16 bytes")
            })?);
        }

        if kids.is_empty() {
            bail!(
                "manifest does not declare key ids for its protected tracks, pass --pssh instead."
            );
        }

        Ok(ProtectionHeader::parse(&header::build(
            ProtectionSystem::Widevine,
            &kids,
            &[],
        ))?)
    }
}

fn proxy_address_parser(s: &str) -> Result<Proxy, String> {
    Proxy::all(s).map_err(|x| x.to_string())
}

pub(super) fn security_level_parser(s: &str) -> Result<SecurityLevel, String> {
    match s.to_lowercase().as_str() {
        "l1" | "1" => Ok(SecurityLevel::L1),
        "l2" | "2" => Ok(SecurityLevel::L2),
        "l3" | "3" => Ok(SecurityLevel::L3),
        x => Err(format!("unknown security level '{x}'. use l1, l2 or l3.")),
    }
}
