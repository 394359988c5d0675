use crate::{
    downloader::{RUNNING, merger::Merger},
    manifest::{ByteRange, Segment, Track},
    progress::Progress,
};
use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use anyhow::{Result, anyhow, bail};
use log::{debug, warn};
use reqwest::{Client, StatusCode, Url, header};
use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::Ordering,
    time::Duration,
};
use tokio::task::JoinSet;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Per-track decryption strategy, resolved from the track's encryption mode
/// and the vault keys before any fetch starts.
#[derive(Clone)]
pub enum Decrypter {
    None,
    /// CENC fMP4 segments through mp4decrypt, with track info taken from
    /// the init segment.
    Cenc {
        keys: HashMap<String, String>,
        init: Option<Vec<u8>>,
    },
    /// Whole-segment AES-128-CBC.
    FullBlock { key: [u8; 16], iv: [u8; 16] },
}

impl Decrypter {
    fn decrypt(&self, data: Vec<u8>, encrypted: bool) -> Result<Vec<u8>> {
        if !encrypted {
            return Ok(data);
        }

        match self {
            Self::None => Ok(data),
            Self::Cenc { keys, init } => {
                mp4decrypt::mp4decrypt(&data, keys, init.as_deref())
                    .map_err(|x| anyhow!("mp4decrypt: {}", x))
            }
            Self::FullBlock { key, iv } => {
                Aes128CbcDec::new(key.into(), iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&data)
                    .map_err(|x| anyhow!("segment decryption failed: {}", x))
            }
        }
    }
}

/// Fetch one init segment synchronously; it gates everything else.
pub(super) async fn fetch_init(client: &Client, track: &Track) -> Result<Option<Vec<u8>>> {
    let Some(init) = &track.init else {
        return Ok(None);
    };

    let url = init.uri.parse::<Url>()?;
    let mut request = client.get(url);

    if let Some(range) = &init.range {
        request = request.header(header::RANGE, range.as_header_value());
    }

    let response = request.send().await?.error_for_status()?;
    Ok(Some(response.bytes().await?.to_vec()))
}

/// Download one track's segments with bounded concurrency, decrypting in the
/// worker tasks and writing through the in-order merger.
///
/// New fetches stop being spawned while either the task budget or the
/// reassembly window is full, so a slow head segment applies backpressure
/// instead of growing the buffer without bound.
pub(super) async fn download_track(
    client: &Client,
    track: &Track,
    decrypter: Decrypter,
    init: Option<Vec<u8>>,
    path: &Path,
    threads: usize,
    retries: u8,
) -> Result<()> {
    let offset = usize::from(init.is_some());
    let total = track.segments.len() + offset;
    let mut merger = Merger::new(total, path)?;
    let mut pb = Progress::new(&track.kind.to_string(), total);

    if let Some(init) = init {
        merger.write(0, &init)?;
        pb.update(init.len());
    }

    let window = threads * 4;
    let mut set: JoinSet<Result<(usize, Vec<u8>)>> = JoinSet::new();

    for segment in &track.segments {
        while set.len() >= threads || merger.pending() >= window {
            drain_one(&mut set, &mut merger, &mut pb).await?;
        }

        if !RUNNING.load(Ordering::SeqCst) {
            set.abort_all();
            bail!("download cancelled.");
        }

        let client = client.clone();
        let decrypter = decrypter.clone();
        let segment = segment.clone();
        let pos = segment.seq + offset;

        set.spawn(async move {
            let data = fetch_segment(&client, &segment.uri, segment.range.as_ref(), retries).await?;
            let data = decrypter.decrypt(data, segment.encrypted)?;
            Ok((pos, data))
        });
    }

    while !set.is_empty() {
        drain_one(&mut set, &mut merger, &mut pb).await?;
    }

    if !merger.is_complete() {
        bail!("stream is missing segments after download.");
    }

    pb.finish();
    debug!(
        "downloaded {} ({})",
        path.to_string_lossy(),
        crate::utils::format_bytes(merger.stored(), 2)
    );
    Ok(())
}

async fn drain_one(
    set: &mut JoinSet<Result<(usize, Vec<u8>)>>,
    merger: &mut Merger,
    pb: &mut Progress,
) -> Result<()> {
    let joined = set
        .join_next()
        .await
        .expect("drain_one called with tasks in flight");

    match joined {
        Ok(Ok((pos, data))) => {
            pb.update(data.len());
            merger.write(pos, &data)?;
            Ok(())
        }
        Ok(Err(e)) => {
            set.abort_all();
            Err(e)
        }
        Err(e) => {
            set.abort_all();
            Err(anyhow!("segment task failed: {}", e))
        }
    }
}

async fn fetch_segment(
    client: &Client,
    uri: &str,
    range: Option<&ByteRange>,
    retries: u8,
) -> Result<Vec<u8>> {
    let url = uri.parse::<Url>()?;

    for attempt in 0..=retries {
        if !RUNNING.load(Ordering::SeqCst) {
            bail!("download cancelled.");
        }

        if attempt > 0 {
            let delay = Duration::from_millis(250) * 2u32.pow(u32::from(attempt - 1));
            debug!("retrying {uri} in {delay:?}");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.get(url.clone());

        if let Some(range) = range {
            request = request.header(header::RANGE, range.as_header_value());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("{} ({})", uri, transient_error(&e)?);
                continue;
            }
        };

        let status = response.status();

        if matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ) || status.is_server_error()
        {
            warn!("{} (HTTP {})", uri, status);
            continue;
        }

        if status.is_client_error() {
            bail!("segment fetch failed {} (HTTP {}).", uri, status);
        }

        return Ok(response.bytes().await?.to_vec());
    }

    bail!("reached max retries while fetching {}.", uri);
}

/// Classify a reqwest error; anything not transient aborts the pipeline.
fn transient_error(error: &reqwest::Error) -> Result<&'static str> {
    if error.is_connect() {
        Ok("connection error")
    } else if error.is_timeout() {
        Ok("timeout")
    } else if error.is_request() {
        bail!("request failed permanently: {}", error)
    } else {
        Ok("transport error")
    }
}
