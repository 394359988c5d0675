use anyhow::{Result, anyhow, bail};
use regex::Regex;
use reqwest::{Client, Url, header::HeaderValue};
use serde::Serialize;
use std::{collections::HashMap, fmt::Display};

/// Parsed media presentation: the track list the selector and the pipeline
/// work from. Read-only once parsed.
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub tracks: Vec<Track>,
}

impl Manifest {
    /// Default KIDs across all tracks, normalized to bare lowercase hex.
    pub fn default_kids(&self) -> Vec<String> {
        let mut kids = vec![];

        for track in &self.tracks {
            if let TrackEncryption::Cenc { default_kid: Some(kid) } = &track.encryption {
                if !kids.contains(kid) {
                    kids.push(kid.clone());
                }
            }
        }

        kids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitles,
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitles => "subtitles",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackEncryption {
    Clear,
    /// CENC protected fMP4, decrypted through mp4decrypt with a KID:KEY map.
    Cenc { default_kid: Option<String> },
    /// Whole-segment AES-128-CBC, decrypted in process.
    FullBlock { kid: String, iv: [u8; 16] },
}

impl TrackEncryption {
    /// Key id a license must cover for this track, if it is encrypted.
    pub fn required_kid(&self) -> Option<&str> {
        match self {
            Self::Clear => None,
            Self::Cenc { default_kid } => default_kid.as_deref(),
            Self::FullBlock { kid, .. } => Some(kid),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn as_header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&format!("bytes={}-{}", self.start, self.end)).unwrap()
    }
}

/// Initialization segment locator.
#[derive(Debug, Clone, Serialize)]
pub struct Map {
    pub uri: String,
    pub range: Option<ByteRange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub uri: String,
    pub seq: usize,
    pub range: Option<ByteRange>,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: String,
    pub kind: TrackKind,
    pub language: Option<String>,
    pub codecs: Option<String>,
    pub bandwidth: Option<u64>,
    pub resolution: Option<(u64, u64)>,
    pub channels: Option<f32>,
    pub init: Option<Map>,
    pub segments: Vec<Segment>,
    pub encryption: TrackEncryption,
    pub extension: String,
}

impl Track {
    pub fn display_stream(&self) -> String {
        let mut extra = match self.kind {
            TrackKind::Video => {
                if let Some((w, h)) = self.resolution {
                    format!("{w}x{h}")
                } else {
                    "?".to_owned()
                }
            }
            _ => format!(
                "language: {}",
                self.language.as_deref().unwrap_or("?")
            ),
        };

        if let Some(codecs) = &self.codecs {
            extra += &format!(", codecs: {codecs}");
        }

        if let Some(bandwidth) = self.bandwidth {
            extra += &format!(
                ", bandwidth: {}/s",
                crate::utils::format_bytes(bandwidth as usize, 2)
            );
        }

        format!("{} ({})", self.kind, extra)
    }

    /// Temp file name for this track, unique per track id.
    pub fn file_name(&self) -> String {
        let id = self
            .id
            .chars()
            .map(|x| if x.is_ascii_alphanumeric() { x } else { '_' })
            .collect::<String>();

        format!("trellis_{}_{}.{}", self.kind, id, self.extension)
    }
}

/// Fetch a DASH manifest and parse it. Returns the parsed manifest and the
/// final (post-redirect) url, which segment urls are resolved against.
pub async fn fetch(client: &Client, url: &Url, bearer: Option<&str>) -> Result<(Manifest, Url)> {
    let mut request = client.get(url.clone());

    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let final_url = response.url().to_owned();
    let text = response.text().await?;

    if !text.contains("<MPD") {
        bail!("{} is not a DASH manifest.", final_url);
    }

    Ok((parse_mpd(&text, &final_url)?, final_url))
}

/// Walk an MPD into tracks with concrete segment urls.
///
/// Addressing modes handled: SegmentTemplate with @duration, SegmentTemplate
/// with SegmentTimeline, SegmentList and plain BaseURL. Indexed SegmentBase
/// representations are fetched whole.
pub fn parse_mpd(text: &str, base_url: &Url) -> Result<Manifest> {
    let mpd = dash_mpd::parse(text).map_err(|x| anyhow!("could not parse mpd: {}", x))?;
    let mut tracks = vec![];

    let period = mpd
        .periods
        .first()
        .ok_or_else(|| anyhow!("mpd has no periods."))?;

    let mut period_duration_secs = 0.0;

    if let Some(duration) = &mpd.mediaPresentationDuration {
        period_duration_secs = duration.as_secs_f32();
    }

    if let Some(duration) = &period.duration {
        period_duration_secs = duration.as_secs_f32();
    }

    for adaptation_set in &period.adaptations {
        for representation in &adaptation_set.representations {
            let codecs = representation
                .codecs
                .clone()
                .or(adaptation_set.codecs.clone());

            let mime_type = representation
                .mimeType
                .clone()
                .or(adaptation_set.mimeType.clone())
                .or(representation.contentType.clone())
                .or(adaptation_set.contentType.clone());

            let kind = match mime_type.as_deref() {
                Some("application/ttml+xml") => TrackKind::Subtitles,
                Some(x) if x.starts_with("audio") => TrackKind::Audio,
                Some(x) if x.starts_with("text") => TrackKind::Subtitles,
                Some(x) if x.starts_with("video") => TrackKind::Video,
                _ => match codecs.as_deref() {
                    Some("wvtt") | Some("stpp") => TrackKind::Subtitles,
                    _ => continue,
                },
            };

            let rid = representation
                .id
                .clone()
                .ok_or_else(|| anyhow!("missing @id on representation node."))?;

            let mut base_url = base_url.clone();

            if let Some(mpd_baseurl) = mpd.base_url.first().map(|x| x.base.as_ref()) {
                base_url = base_url.join(mpd_baseurl)?;
            }

            if let Some(period_baseurl) = period.BaseURL.first().map(|x| x.base.as_ref()) {
                base_url = base_url.join(period_baseurl)?;
            }

            if let Some(adaptation_baseurl) = adaptation_set.BaseURL.first().map(|x| x.base.as_ref())
            {
                base_url = base_url.join(adaptation_baseurl)?;
            }

            if let Some(representation_baseurl) =
                representation.BaseURL.first().map(|x| x.base.as_ref())
            {
                base_url = base_url.join(representation_baseurl)?;
            }

            let mut template_vars = HashMap::from([("RepresentationID".to_owned(), rid.clone())]);

            if let Some(bandwidth) = &representation.bandwidth {
                template_vars.insert("Bandwidth".to_owned(), bandwidth.to_string());
            }

            let mut template = Template::new(template_vars);
            let mut init = None;
            let mut uris = vec![];

            if let Some(segment_list) = representation
                .SegmentList
                .as_ref()
                .or(adaptation_set.SegmentList.as_ref())
            {
                if let Some(initialization) = &segment_list.Initialization {
                    init = Some(Map {
                        range: parse_range(&initialization.range)?,
                        uri: match &initialization.sourceURL {
                            Some(source_url) => {
                                base_url.join(&template.resolve(source_url))?.to_string()
                            }
                            None => base_url.to_string(),
                        },
                    });
                }

                for segment_url in &segment_list.segment_urls {
                    if let Some(media) = &segment_url.media {
                        uris.push((
                            base_url.join(media)?.to_string(),
                            parse_range(&segment_url.mediaRange)?,
                        ));
                    } else if !representation.BaseURL.is_empty() {
                        uris.push((base_url.to_string(), parse_range(&segment_url.mediaRange)?));
                    }
                }
            } else if let Some(segment_template) = representation
                .SegmentTemplate
                .as_ref()
                .or(adaptation_set.SegmentTemplate.as_ref())
            {
                if let Some(initialization) = &segment_template.initialization {
                    init = Some(Map {
                        range: None,
                        uri: base_url
                            .join(&template.resolve(initialization))?
                            .to_string(),
                    });
                }

                let media = segment_template
                    .media
                    .as_ref()
                    .map(|x| template.resolve(x))
                    .ok_or_else(|| anyhow!("SegmentTemplate without a media attribute."))?;
                let timescale = segment_template.timescale.unwrap_or(1) as f32;
                let mut number = segment_template.startNumber.unwrap_or(1);

                if let Some(segment_timeline) = &segment_template.SegmentTimeline {
                    let mut segment_time = 0;

                    for s in &segment_timeline.segments {
                        if let Some(t) = s.t {
                            segment_time = t;
                        }

                        let mut repeats = s.r.unwrap_or(0);

                        if repeats < 0 {
                            // Negative @r repeats until the period ends.
                            let remaining = period_duration_secs * timescale
                                - segment_time as f32;
                            repeats = (remaining / s.d as f32).ceil() as i64 - 1;
                        }

                        for _ in 0..=repeats.max(0) {
                            template.insert("Time", segment_time.to_string());
                            template.insert("Number", number.to_string());
                            uris.push((base_url.join(&template.resolve(&media))?.to_string(), None));
                            number += 1;
                            segment_time += s.d;
                        }
                    }
                } else {
                    let segment_duration = segment_template
                        .duration
                        .map(|x| x as f32 / timescale)
                        .ok_or_else(|| {
                            anyhow!("representation is missing SegmentTemplate@duration attribute.")
                        })?;
                    let total = (period_duration_secs / segment_duration).round().max(1.0) as u64;

                    for _ in 0..total {
                        template.insert("Number", number.to_string());
                        uris.push((base_url.join(&template.resolve(&media))?.to_string(), None));
                        number += 1;
                    }
                }
            } else if !representation.BaseURL.is_empty() || representation.SegmentBase.is_some() {
                // Single file representation, fetched whole.
                uris.push((base_url.to_string(), None));
            } else {
                bail!("no usable addressing mode identified for representation {rid}.");
            }

            let mut default_kid = None;

            for content_protection in representation
                .ContentProtection
                .iter()
                .chain(adaptation_set.ContentProtection.iter())
            {
                if default_kid.is_none() && content_protection.default_KID.is_some() {
                    default_kid = content_protection.default_KID.clone();
                }
            }

            let encryption = if representation.ContentProtection.is_empty()
                && adaptation_set.ContentProtection.is_empty()
            {
                TrackEncryption::Clear
            } else {
                TrackEncryption::Cenc {
                    default_kid: default_kid.map(|x| normalize_kid(&x)),
                }
            };

            let encrypted = encryption != TrackEncryption::Clear;
            let segments = uris
                .into_iter()
                .enumerate()
                .map(|(seq, (uri, range))| Segment {
                    uri,
                    seq,
                    range,
                    encrypted,
                })
                .collect::<Vec<_>>();

            tracks.push(Track {
                id: rid,
                kind,
                language: adaptation_set.lang.clone(),
                codecs,
                bandwidth: representation.bandwidth,
                resolution: match (representation.width, representation.height) {
                    (Some(w), Some(h)) => Some((w, h)),
                    _ => None,
                },
                channels: representation
                    .AudioChannelConfiguration
                    .first()
                    .or(adaptation_set.AudioChannelConfiguration.first())
                    .and_then(|x| x.value.as_ref())
                    .and_then(|x| x.parse::<f32>().ok()),
                init,
                segments,
                encryption,
                extension: mime_type
                    .as_deref()
                    .and_then(|x| x.split_once('/').map(|x| x.1.to_owned()))
                    .unwrap_or_else(|| "m4s".to_owned()),
            });
        }
    }

    if tracks.is_empty() {
        bail!("mpd contains no playable tracks.");
    }

    Ok(Manifest { tracks })
}

pub fn normalize_kid(kid: &str) -> String {
    kid.replace('-', "").to_lowercase()
}

fn parse_range(range: &Option<String>) -> Result<Option<ByteRange>> {
    range
        .as_ref()
        .map(|range| {
            if let Some((Some(start), Some(end))) = range
                .split_once('-')
                .map(|(x, y)| (x.parse::<u64>().ok(), y.parse::<u64>().ok()))
            {
                Ok(ByteRange { start, end })
            } else {
                bail!("could not parse byte range \"{range}\".")
            }
        })
        .transpose()
}

struct Template {
    re_representation_id: Regex,
    re_number: Regex,
    re_time: Regex,
    re_bandwidth: Regex,
    vars: HashMap<String, String>,
}

impl Template {
    fn new(vars: HashMap<String, String>) -> Self {
        Self {
            re_representation_id: Regex::new("\\$RepresentationID%0([\\d])d\\$").unwrap(),
            re_number: Regex::new("\\$Number%0([\\d])d\\$").unwrap(),
            re_time: Regex::new("\\$Time%0([\\d])d\\$").unwrap(),
            re_bandwidth: Regex::new("\\$Bandwidth%0([\\d])d\\$").unwrap(),
            vars,
        }
    }

    fn insert(&mut self, var: &str, val: String) {
        self.vars.insert(var.to_owned(), val);
    }

    fn resolve(&self, template: &str) -> String {
        let mut template = template.to_owned();

        for (var, ident_re) in [
            ("RepresentationID", &self.re_representation_id),
            ("Number", &self.re_number),
            ("Time", &self.re_time),
            ("Bandwidth", &self.re_bandwidth),
        ] {
            let ident = format!("${var}$");

            if template.contains(&ident) {
                if let Some(value) = self.vars.get(var) {
                    template = template.replace(&ident, value);
                }
            }

            if let Some(cap) = ident_re.captures(&template) {
                if let Some(value) = self.vars.get(var) {
                    let count = format!(
                        "{:0>width$}",
                        value,
                        width = cap[1].parse::<usize>().unwrap()
                    );
                    let m = ident_re.find(&template).unwrap();
                    template = template[..m.start()].to_owned() + &count + &template[m.end()..];
                }
            }
        }

        template
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" xmlns:cenc="urn:mpeg:cenc:2013" type="static" mediaPresentationDuration="PT12S">
  <Period>
    <AdaptationSet mimeType="video/mp4" lang="en">
      <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc" cenc:default_KID="EB676ABB-CB34-5E96-BBCF-616630F1A3DA"/>
      <Representation id="video_1080" bandwidth="4800000" width="1920" height="1080" codecs="avc1.640028">
        <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number%03d$.m4s" startNumber="1" duration="4" timescale="1"/>
      </Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4" lang="fr">
      <Representation id="audio_fr" bandwidth="128000" codecs="mp4a.40.2">
        <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/seg_$Number$.m4s" startNumber="1" duration="4" timescale="1"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_template_addressing() {
        let base = "https://cdn.example.com/title/manifest.mpd"
            .parse::<Url>()
            .unwrap();
        let manifest = parse_mpd(MPD, &base).unwrap();

        assert_eq!(manifest.tracks.len(), 2);

        let video = &manifest.tracks[0];
        assert_eq!(video.kind, TrackKind::Video);
        assert_eq!(video.resolution, Some((1920, 1080)));
        assert_eq!(video.segments.len(), 3);
        assert_eq!(
            video.segments[1].uri,
            "https://cdn.example.com/title/video_1080/seg_002.m4s"
        );
        assert_eq!(
            video.init.as_ref().unwrap().uri,
            "https://cdn.example.com/title/video_1080/init.mp4"
        );
        assert_eq!(
            video.encryption,
            TrackEncryption::Cenc {
                default_kid: Some("eb676abbcb345e96bbcf616630f1a3da".to_owned())
            }
        );

        let audio = &manifest.tracks[1];
        assert_eq!(audio.kind, TrackKind::Audio);
        assert_eq!(audio.language.as_deref(), Some("fr"));
        assert_eq!(audio.encryption, TrackEncryption::Clear);
        assert!(!audio.segments[0].encrypted);
        assert_eq!(
            manifest.default_kids(),
            vec!["eb676abbcb345e96bbcf616630f1a3da".to_owned()]
        );
    }
}
