use crate::{
    manifest::{Track, TrackKind},
    services::ResolvedTitle,
};
use regex::Regex;
use thiserror::Error;

/// A filter that matches nothing is an error, never a silent substitution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no video track matches quality '{0}'")]
    NoVideoQuality(String),
    #[error("no audio track matches language '{0}'")]
    NoAudioLanguage(String),
    #[error("no subtitle track matches language '{0}'")]
    NoSubtitleLanguage(String),
    #[error("no resolved episodes match '{0}'")]
    NoEpisodes(String),
    #[error("could not parse range expression '{0}'")]
    BadRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quality {
    Best,
    Worst,
    Height(u64),
    Resolution(u64, u64),
}

impl Quality {
    pub fn parse(s: &str) -> Result<Self, String> {
        Ok(match s.to_lowercase().as_str() {
            "best" | "highest" | "max" => Self::Best,
            "worst" | "lowest" | "min" => Self::Worst,
            x if x.ends_with('p') => Self::Height(
                x.trim_end_matches('p')
                    .parse::<u64>()
                    .map_err(|_| "could not parse HEIGHT.".to_owned())?,
            ),
            x => {
                if let Some((w, h)) = x.split_once('x') {
                    Self::Resolution(
                        w.parse::<u64>()
                            .map_err(|_| "could not parse WIDTH.".to_owned())?,
                        h.parse::<u64>()
                            .map_err(|_| "could not parse HEIGHT.".to_owned())?,
                    )
                } else {
                    return Err(format!(
                        "could not parse quality '{x}'. use best, worst, HEIGHTp or WIDTHxHEIGHT."
                    ));
                }
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub audio_lang: Option<String>,
    pub sub_lang: Option<String>,
    pub quality: Option<Quality>,
}

/// Resolve track filters into the concrete ordered set to download:
/// one video track, one audio track, one subtitle track when asked for.
pub fn select_tracks(tracks: &[Track], filters: &Filters) -> Result<Vec<Track>, SelectionError> {
    let mut selected = vec![];

    let videos = tracks
        .iter()
        .filter(|x| x.kind == TrackKind::Video)
        .collect::<Vec<_>>();

    if !videos.is_empty() {
        selected.push(select_video(&videos, filters.quality.as_ref())?.clone());
    }

    let audios = tracks
        .iter()
        .filter(|x| x.kind == TrackKind::Audio)
        .collect::<Vec<_>>();

    if let Some(lang) = &filters.audio_lang {
        let track = best_language_match(&audios, lang)
            .ok_or_else(|| SelectionError::NoAudioLanguage(lang.clone()))?;
        selected.push(track.clone());
    } else if let Some(first) = audios.first() {
        selected.push((*first).clone());
    }

    if let Some(lang) = &filters.sub_lang {
        let subs = tracks
            .iter()
            .filter(|x| x.kind == TrackKind::Subtitles)
            .collect::<Vec<_>>();
        let track = best_language_match(&subs, lang)
            .ok_or_else(|| SelectionError::NoSubtitleLanguage(lang.clone()))?;
        selected.push(track.clone());
    }

    Ok(selected)
}

fn select_video<'a>(
    videos: &[&'a Track],
    quality: Option<&Quality>,
) -> Result<&'a Track, SelectionError> {
    let pixels = |t: &Track| t.resolution.map(|(w, h)| w * h).unwrap_or(0);
    let rank = |t: &Track| (pixels(t), t.bandwidth.unwrap_or(0));

    match quality.unwrap_or(&Quality::Best) {
        Quality::Best => Ok(videos.iter().max_by_key(|x| rank(x)).unwrap()),
        Quality::Worst => Ok(videos.iter().min_by_key(|x| rank(x)).unwrap()),
        Quality::Height(h) => videos
            .iter()
            .filter(|x| x.resolution.map(|(_, vh)| vh == *h).unwrap_or(false))
            .max_by_key(|x| rank(x))
            .copied()
            .ok_or_else(|| SelectionError::NoVideoQuality(format!("{h}p"))),
        Quality::Resolution(w, h) => videos
            .iter()
            .filter(|x| x.resolution == Some((*w, *h)))
            .max_by_key(|x| rank(x))
            .copied()
            .ok_or_else(|| SelectionError::NoVideoQuality(format!("{w}x{h}"))),
    }
}

/// Exact language match wins over a primary-subtag match (`en` vs `en-AU`);
/// ties break on bandwidth.
fn best_language_match<'a>(tracks: &[&'a Track], wanted: &str) -> Option<&'a Track> {
    let wanted = wanted.to_lowercase();

    let factor = |track: &Track| {
        let lang = track.language.as_ref()?.to_lowercase();

        if lang == wanted {
            Some(2)
        } else if lang.get(0..2) == wanted.get(0..2) {
            Some(1)
        } else {
            None
        }
    };

    tracks
        .iter()
        .filter_map(|x| factor(x).map(|f| (f, x.bandwidth.unwrap_or(0), *x)))
        .max_by_key(|(f, bw, _)| (*f, *bw))
        .map(|(_, _, x)| x)
}

/// Parsed `--wanted` episode filter: comma separated points or ranges over
/// `SxxEyy` / `Sxx` / bare episode numbers.
#[derive(Debug, Clone)]
pub struct Wanted {
    expr: String,
    ranges: Vec<(Point, Point)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Point {
    /// Bare episode number, any season.
    Episode(u32),
    /// Season with an optional episode.
    Season(u32, Option<u32>),
}

impl Wanted {
    pub fn parse(expr: &str) -> Result<Self, SelectionError> {
        let point_re = Regex::new(r"^(?i)s(\d+)(?:e(\d+))?$").unwrap();
        let bad = || SelectionError::BadRange(expr.to_owned());

        let parse_point = |s: &str| -> Result<Point, SelectionError> {
            let s = s.trim();

            if let Some(caps) = point_re.captures(s) {
                let season = caps[1].parse::<u32>().map_err(|_| bad())?;
                let episode = caps
                    .get(2)
                    .map(|x| x.as_str().parse::<u32>())
                    .transpose()
                    .map_err(|_| bad())?;
                Ok(Point::Season(season, episode))
            } else {
                Ok(Point::Episode(s.parse::<u32>().map_err(|_| bad())?))
            }
        };

        let mut ranges = vec![];

        for part in expr.split(',') {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse_point(lo)?, parse_point(hi)?),
                None => {
                    let point = parse_point(part)?;
                    (point, point)
                }
            };

            // Mixed endpoint styles have no defined ordering.
            if matches!(
                (lo, hi),
                (Point::Episode(_), Point::Season(..)) | (Point::Season(..), Point::Episode(_))
            ) {
                return Err(bad());
            }

            ranges.push((lo, hi));
        }

        if ranges.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            expr: expr.to_owned(),
            ranges,
        })
    }

    pub fn matches(&self, season: Option<u32>, episode: Option<u32>) -> bool {
        self.ranges.iter().any(|(lo, hi)| match (lo, hi) {
            (Point::Episode(a), Point::Episode(b)) => {
                episode.map(|e| (*a..=*b).contains(&e)).unwrap_or(false)
            }
            (Point::Season(s1, e1), Point::Season(s2, e2)) => {
                let Some(season) = season else { return false };
                let episode = episode.unwrap_or(0);
                let lo = (*s1, e1.unwrap_or(0));
                let hi = (*s2, e2.unwrap_or(u32::MAX));
                (lo..=hi).contains(&(season, episode))
            }
            _ => false,
        })
    }
}

/// Apply a `--wanted` filter to the resolved episode list.
pub fn filter_titles(
    titles: Vec<ResolvedTitle>,
    wanted: Option<&Wanted>,
) -> Result<Vec<ResolvedTitle>, SelectionError> {
    let Some(wanted) = wanted else {
        return Ok(titles);
    };

    let filtered = titles
        .into_iter()
        .filter(|x| wanted.matches(x.season, x.episode))
        .collect::<Vec<_>>();

    if filtered.is_empty() {
        return Err(SelectionError::NoEpisodes(wanted.expr.clone()));
    }

    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::TrackEncryption;

    fn track(kind: TrackKind, language: Option<&str>, bandwidth: u64) -> Track {
        Track {
            id: format!("{kind}_{bandwidth}"),
            kind,
            language: language.map(|x| x.to_owned()),
            codecs: None,
            bandwidth: Some(bandwidth),
            resolution: None,
            channels: None,
            init: None,
            segments: vec![],
            encryption: TrackEncryption::Clear,
            extension: "m4s".to_owned(),
        }
    }

    fn video(width: u64, height: u64, bandwidth: u64) -> Track {
        Track {
            resolution: Some((width, height)),
            ..track(TrackKind::Video, None, bandwidth)
        }
    }

    #[test]
    fn audio_language_filter_is_strict() {
        let tracks = vec![
            track(TrackKind::Audio, Some("en"), 1),
            track(TrackKind::Audio, Some("fr"), 1),
        ];

        assert_eq!(
            select_tracks(&tracks, &Filters {
                audio_lang: Some("de".to_owned()),
                ..Default::default()
            })
            .unwrap_err(),
            SelectionError::NoAudioLanguage("de".to_owned())
        );

        let selected = select_tracks(&tracks, &Filters {
            audio_lang: Some("en".to_owned()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].language.as_deref(), Some("en"));
    }

    #[test]
    fn exact_language_beats_primary_subtag() {
        let tracks = vec![
            track(TrackKind::Audio, Some("en-AU"), 9),
            track(TrackKind::Audio, Some("en"), 1),
        ];

        let selected = select_tracks(&tracks, &Filters {
            audio_lang: Some("en".to_owned()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(selected[0].language.as_deref(), Some("en"));
    }

    #[test]
    fn quality_filter() {
        let tracks = vec![video(1920, 1080, 5_000), video(1280, 720, 3_000)];

        let best = select_tracks(&tracks, &Filters::default()).unwrap();
        assert_eq!(best[0].resolution, Some((1920, 1080)));

        let selected = select_tracks(&tracks, &Filters {
            quality: Some(Quality::Height(720)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(selected[0].resolution, Some((1280, 720)));

        assert_eq!(
            select_tracks(&tracks, &Filters {
                quality: Some(Quality::Height(480)),
                ..Default::default()
            })
            .unwrap_err(),
            SelectionError::NoVideoQuality("480p".to_owned())
        );
    }

    #[test]
    fn wanted_ranges() {
        let wanted = Wanted::parse("S01E02-S01E04").unwrap();
        assert!(wanted.matches(Some(1), Some(3)));
        assert!(!wanted.matches(Some(1), Some(5)));
        assert!(!wanted.matches(Some(2), Some(3)));
        assert!(!wanted.matches(None, Some(3)));

        let wanted = Wanted::parse("S02").unwrap();
        assert!(wanted.matches(Some(2), Some(11)));
        assert!(!wanted.matches(Some(1), Some(11)));

        let wanted = Wanted::parse("1-3,7").unwrap();
        assert!(wanted.matches(Some(4), Some(2)));
        assert!(wanted.matches(None, Some(7)));
        assert!(!wanted.matches(Some(1), Some(5)));

        let wanted = Wanted::parse("S01E05-S02E03").unwrap();
        assert!(wanted.matches(Some(1), Some(9)));
        assert!(wanted.matches(Some(2), Some(3)));
        assert!(!wanted.matches(Some(2), Some(4)));

        assert!(Wanted::parse("S01-3").is_err());
        assert!(Wanted::parse("abc").is_err());
    }
}
