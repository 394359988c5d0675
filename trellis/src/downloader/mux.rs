use crate::{manifest::TrackKind, utils};
use anyhow::{Result, bail};
use colored::Colorize;
use log::info;
use std::{ffi::OsStr, path::{Path, PathBuf}, process::Stdio};
use tokio::{fs, process::Command};

pub struct MuxStream {
    pub kind: TrackKind,
    pub language: Option<String>,
    pub path: PathBuf,
}

/// Remux the downloaded elementary streams into one container with ffmpeg.
/// A non-zero exit is fatal for the title.
pub async fn ffmpeg(output: &Path, streams: &[MuxStream]) -> Result<()> {
    let streams = streams
        .iter()
        .filter(|x| x.kind == TrackKind::Video)
        .chain(streams.iter().filter(|x| x.kind == TrackKind::Audio))
        .chain(streams.iter().filter(|x| x.kind == TrackKind::Subtitles))
        .collect::<Vec<_>>();

    let mut args = Vec::new();

    for stream in &streams {
        args.extend_from_slice(&["-i".to_owned(), stream.path.to_string_lossy().into()]);
    }

    for i in 0..streams.len() {
        args.extend_from_slice(&["-map".to_owned(), i.to_string()]);
    }

    let mut audio_index = 0;
    let mut subtitle_index = 0;

    for stream in &streams {
        match stream.kind {
            TrackKind::Audio => {
                if let Some(language) = &stream.language {
                    args.extend_from_slice(&[
                        format!("-metadata:s:a:{audio_index}"),
                        format!("language={language}"),
                    ]);
                }

                audio_index += 1;
            }
            TrackKind::Subtitles => {
                if let Some(language) = &stream.language {
                    args.extend_from_slice(&[
                        format!("-metadata:s:s:{subtitle_index}"),
                        format!("language={language}"),
                    ]);
                }

                subtitle_index += 1;
            }
            TrackKind::Video => (),
        }
    }

    if subtitle_index > 0 {
        if output.extension() == Some(OsStr::new("mp4")) {
            args.extend_from_slice(&["-c:s".to_owned(), "mov_text".to_owned()]);
        } else {
            args.extend_from_slice(&["-c:s".to_owned(), "copy".to_owned()]);
        }
    }

    args.extend_from_slice(&[
        "-c:v".to_owned(),
        "copy".to_owned(),
        "-c:a".to_owned(),
        "copy".to_owned(),
    ]);

    args.push(output.to_string_lossy().into());

    if output.exists() {
        info!("Deleting {}", output.to_string_lossy());
        fs::remove_file(output).await?;
    }

    info!("Executing {} {}", "ffmpeg".bold(), args.join(" ").bold());

    let ffmpeg = utils::find_ffmpeg()
        .ok_or_else(|| anyhow::anyhow!("ffmpeg couldn't be found, it is required to mux."))?;

    let code = Command::new(ffmpeg)
        .args(args)
        .stderr(Stdio::null())
        .spawn()?
        .wait()
        .await?;

    if !code.success() {
        bail!("ffmpeg exited with code {}.", code.code().unwrap_or(1));
    }

    Ok(())
}

pub async fn delete_temp_files(streams: &[MuxStream]) -> Result<()> {
    for stream in streams {
        info!("Deleting {}", stream.path.to_string_lossy());
        fs::remove_file(&stream.path).await?;
    }

    Ok(())
}
