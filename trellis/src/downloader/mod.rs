mod merger;
mod mux;
mod stream;

use crate::manifest::{Track, TrackEncryption};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use reqwest::Client;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::atomic::AtomicBool,
};
use stream::Decrypter;

/// Cleared by the ctrl-c watcher; every fetch loop checks it before
/// starting new work.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

pub struct DownloadOptions {
    pub directory: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub threads: u8,
    pub retry_count: u8,
    pub keep_segments: bool,
}

/// Download, decrypt and optionally mux one title's selected tracks.
///
/// Every encrypted track must have its key resolved before the first fetch
/// starts; a missing key id means the license is incomplete and nothing is
/// downloaded. A failed or cancelled title removes whatever partial output
/// it produced, since partially decrypted media is not usable.
pub async fn download_title(
    client: &Client,
    name: &str,
    tracks: Vec<Track>,
    keys: &HashMap<String, String>,
    options: &DownloadOptions,
) -> Result<()> {
    if tracks.is_empty() {
        bail!("no tracks selected for {name}.");
    }

    for track in &tracks {
        match &track.encryption {
            TrackEncryption::Clear => (),
            encryption => {
                let covered = match encryption.required_kid() {
                    Some(kid) => keys.contains_key(kid),
                    // CENC without a declared default KID still needs keys;
                    // mp4decrypt matches them against the track encryption box.
                    None => !keys.is_empty(),
                };

                if !covered {
                    bail!(
                        "license is incomplete: no key for {} track {} (kid {}).",
                        track.kind,
                        track.id,
                        encryption.required_kid().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    if let Some(directory) = &options.directory
        && !directory.exists()
    {
        std::fs::create_dir_all(directory)?;
    }

    let mut finished = vec![];
    let mut result = Ok(());

    for track in &tracks {
        info!("Processing {} stream: {}", track.kind, track.display_stream());

        if track.segments.is_empty() {
            warn!("Skipping stream (no segments)");
            continue;
        }

        let path = match &options.directory {
            Some(directory) => directory.join(track.file_name()),
            None => PathBuf::from(track.file_name()),
        };

        let outcome = download_one_track(client, track, keys, &path, options).await;

        match outcome {
            Ok(()) => finished.push(mux::MuxStream {
                kind: track.kind,
                language: track.language.clone(),
                path,
            }),
            Err(e) => {
                // Partial DRM output is not valid; drop everything.
                let _ = std::fs::remove_file(&path);
                result = Err(e).with_context(|| format!("{} track {}", track.kind, track.id));
                break;
            }
        }
    }

    if result.is_err() {
        for stream in &finished {
            let _ = std::fs::remove_file(&stream.path);
        }
        return result;
    }

    if let Some(output) = &options.output {
        mux::ffmpeg(output, &finished).await?;

        if !options.keep_segments {
            mux::delete_temp_files(&finished).await?;
        }

        info!("Muxed {name} to {}", output.to_string_lossy());
    }

    Ok(())
}

async fn download_one_track(
    client: &Client,
    track: &Track,
    keys: &HashMap<String, String>,
    path: &std::path::Path,
    options: &DownloadOptions,
) -> Result<()> {
    let init = stream::fetch_init(client, track).await?;

    let decrypter = match &track.encryption {
        TrackEncryption::Clear => Decrypter::None,
        TrackEncryption::Cenc { .. } => Decrypter::Cenc {
            keys: keys.clone(),
            init: init.clone(),
        },
        TrackEncryption::FullBlock { kid, iv } => {
            let value = hex::decode(&keys[kid])?;
            let key = <[u8; 16]>::try_from(value.as_slice())
                .map_err(|_| anyhow::anyhow!("key for kid {kid} is not 16 bytes."))?;
            Decrypter::FullBlock { key, iv: *iv }
        }
    };

    stream::download_track(
        client,
        track,
        decrypter,
        init,
        path,
        options.threads as usize,
        options.retry_count,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Segment, TrackKind};
    use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    const K1_KID: &str = "00112233445566778899aabbccddeeff";
    const K1: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x07; 16];

    fn encrypt(data: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&K1.into(), &IV.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
    }

    fn track_for(server_url: &str, encrypted: [bool; 3]) -> Track {
        Track {
            id: "video_1".to_owned(),
            kind: TrackKind::Video,
            language: None,
            codecs: Some("avc1.640028".to_owned()),
            bandwidth: Some(1_000_000),
            resolution: Some((1920, 1080)),
            channels: None,
            init: None,
            segments: (0..3)
                .map(|seq| Segment {
                    uri: format!("{server_url}/seg_{seq}.m4s"),
                    seq,
                    range: None,
                    encrypted: encrypted[seq],
                })
                .collect(),
            encryption: TrackEncryption::FullBlock {
                kid: K1_KID.to_owned(),
                iv: IV,
            },
            extension: "m4s".to_owned(),
        }
    }

    /// Three segments, two encrypted under K1 and one in the clear, with K1
    /// already in the vault: license resolution, download, decryption and
    /// merging all succeed with zero license server traffic.
    #[tokio::test]
    async fn vault_hit_decrypts_and_merges_without_license_calls() {
        use crate::{
            license::{HttpTransport, KeyBroker},
            vault::Vault,
        };
        use std::time::Duration;
        use trellis_cdm::{
            ContentKey, IdentityStore, KeyType, ProtectionHeader, ProtectionSystem, SecurityLevel,
            header,
        };

        let mut server = mockito::Server::new_async().await;

        let plain: [&[u8]; 3] = [b"first segment ", b"second segment ", b"third segment"];
        let _m0 = server
            .mock("GET", "/seg_0.m4s")
            .with_body(encrypt(plain[0]))
            .create_async()
            .await;
        let _m1 = server
            .mock("GET", "/seg_1.m4s")
            .with_body(encrypt(plain[1]))
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", "/seg_2.m4s")
            .with_body(plain[2])
            .create_async()
            .await;
        // Any license traffic would land on this endpoint and fail the test.
        let license = server
            .mock("POST", "/license")
            .with_status(500)
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let kid = <[u8; 16]>::try_from(hex::decode(K1_KID).unwrap().as_slice()).unwrap();

        let vault = Vault::open(&dir.path().join("vault.db")).await.unwrap();
        vault
            .store("direct", "e2e-title", &[ContentKey {
                kid,
                key: K1,
                kind: KeyType::Content,
            }])
            .await
            .unwrap();

        let broker = KeyBroker::new(
            HttpTransport::new(Client::new()),
            vault,
            IdentityStore::new(dir.path().join("devices")),
            SecurityLevel::L3,
            3,
            Duration::ZERO,
        );

        let protection =
            ProtectionHeader::parse(&header::build(ProtectionSystem::Widevine, &[kid], &[]))
                .unwrap();
        let license_url = format!("{}/license", server.url()).parse().unwrap();

        let keys = broker
            .obtain(
                "direct",
                "e2e-title",
                &protection,
                &license_url,
                &[K1_KID.to_owned()],
            )
            .await
            .unwrap();

        let track = track_for(&server.url(), [true, true, false]);
        let options = DownloadOptions {
            directory: Some(dir.path().to_path_buf()),
            output: None,
            threads: 3,
            retry_count: 2,
            keep_segments: false,
        };

        download_title(&Client::new(), "e2e title", vec![track.clone()], &keys, &options)
            .await
            .unwrap();

        let merged = std::fs::read(dir.path().join(track.file_name())).unwrap();
        assert_eq!(merged, plain.concat());
        license.assert_async().await;
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_fetch() {
        let mut server = mockito::Server::new_async().await;
        let segments = server
            .mock("GET", mockito::Matcher::Regex("/seg_.*".to_owned()))
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let track = track_for(&server.url(), [true, true, true]);

        let options = DownloadOptions {
            directory: Some(dir.path().to_path_buf()),
            output: None,
            threads: 3,
            retry_count: 0,
            keep_segments: false,
        };

        let err = download_title(&Client::new(), "t", vec![track], &HashMap::new(), &options)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("license is incomplete"));
        segments.assert_async().await;
    }

    #[tokio::test]
    async fn retry_exhaustion_discards_partial_output() {
        let mut server = mockito::Server::new_async().await;

        let _ok = server
            .mock("GET", "/seg_0.m4s")
            .with_body(b"data")
            .create_async()
            .await;
        let _ok2 = server
            .mock("GET", "/seg_2.m4s")
            .with_body(b"data")
            .create_async()
            .await;
        let _broken = server
            .mock("GET", "/seg_1.m4s")
            .with_status(503)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut track = track_for(&server.url(), [false, false, false]);
        track.encryption = TrackEncryption::Clear;

        let options = DownloadOptions {
            directory: Some(dir.path().to_path_buf()),
            output: None,
            threads: 2,
            retry_count: 1,
            keep_segments: false,
        };

        let file_name = track.file_name();
        let err = download_title(&Client::new(), "t", vec![track], &HashMap::new(), &options)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("max retries"));
        assert!(!dir.path().join(file_name).exists());
    }
}
