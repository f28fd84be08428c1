//! Video resolution limits derived from the send bitrate.
//!
//! The adapter keeps the bitrates it was given over a sliding window and
//! restricts the raw video entering the send path to resolutions and frame
//! rates that bitrate can carry.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::codec::{Caps, CapsValue, Structure};

/// Length of the bitrate history.
pub const ADAPTER_INTERVAL: Duration = Duration::from_secs(10);

/// Pixels per second one bit per second carries with H.264.
const PIXELS_PER_BIT: u64 = 25;

const MAX_FRAMERATE: i64 = 66;

/// Raw video when the send path does not say what it consumes.
const DEFAULT_VIDEO: &str = "video/x-raw";

const SQUARE_PIXEL: &[(u32, u32)] = &[
    (1920, 1200),
    (1920, 1080),
    (1600, 1200),
    (1680, 1050),
    (1280, 800),
    (1280, 768),
    (1280, 720),
    (1024, 768),
    (800, 600),
    (854, 480),
    (800, 480),
    (640, 480),
    (320, 240),
    (160, 120),
    (128, 96),
];

/// CIF family, with a 12:11 pixel aspect ratio.
const CIF: &[(u32, u32)] = &[(1480, 1152), (704, 576), (352, 288), (176, 144)];

fn video_structure(media_type: &str, min_framerate: i64, (width, height): (u32, u32), par: &str) -> Structure {
    Structure::new(media_type)
        .with("width", CapsValue::Int(width as i64))
        .with("height", CapsValue::Int(height as i64))
        .with("pixel-aspect-ratio", CapsValue::Str(par.into()))
        .with("framerate", CapsValue::IntRange(min_framerate, MAX_FRAMERATE))
}

/// Resolutions `bitrate` can carry.
///
/// Resolutions reaching 20 fps come first, then those reaching 10 fps. Only
/// when neither exists are resolutions down to 1 fps offered.
pub fn caps_from_bitrate(media_type: &str, bitrate: u32) -> Caps {
    // At least one frame per second at the smallest size.
    let pixels_per_second = (bitrate as u64 * PIXELS_PER_BIT).max(128 * 96);

    let mut high = vec![];
    let mut lower = vec![];
    let mut extra_low = vec![];

    let sizes = SQUARE_PIXEL
        .iter()
        .map(|s| (*s, "1/1"))
        .chain(CIF.iter().map(|s| (*s, "12/11")));

    for (size, par) in sizes {
        let max_framerate = pixels_per_second / (size.0 as u64 * size.1 as u64);

        if max_framerate >= 20 {
            high.push(video_structure(media_type, 20, size, par));
        }
        if max_framerate >= 10 {
            lower.push(video_structure(media_type, 10, size, par));
        }
        if max_framerate > 0 {
            extra_low.push(video_structure(media_type, 1, size, par));
        }
    }

    high.extend(lower);
    if high.is_empty() {
        Caps::from_structures(extra_low)
    } else {
        Caps::from_structures(high)
    }
}

/// Narrow the video structures of `caps` to what `bitrate` carries. Other
/// structures pass unchanged.
pub fn restrict_caps(caps: &Caps, bitrate: u32) -> Caps {
    if caps.is_any() {
        return caps_from_bitrate(DEFAULT_VIDEO, bitrate);
    }

    let mut out = Caps::new_empty();
    for s in caps.structures() {
        let one = Caps::from_structure(s.clone());
        if s.name().starts_with("video/") {
            out.append(caps_from_bitrate(s.name(), bitrate).intersect(&one));
        } else {
            out.append(one);
        }
    }
    out
}

/// Smooths the bitrates the session is given.
///
/// The bitrate adapted for is the mean minus one standard deviation of the
/// samples in the last [`ADAPTER_INTERVAL`]. A new value is only reported
/// when it moves more than 10% from the previous one.
#[derive(Debug)]
pub(crate) struct BitrateAdapter {
    interval: Duration,
    history: VecDeque<(Instant, u32)>,
    /// Bitrate the send path was last restricted for.
    applied: Option<u32>,
    timeout: Option<Instant>,
}

impl BitrateAdapter {
    pub fn new() -> Self {
        BitrateAdapter {
            interval: ADAPTER_INTERVAL,
            history: VecDeque::new(),
            applied: None,
            timeout: None,
        }
    }

    pub fn applied(&self) -> Option<u32> {
        self.applied
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timeout
    }

    /// Record a bitrate. The first sample takes effect at once, later ones
    /// when the timer fires.
    pub fn add(&mut self, now: Instant, bitrate: u32) -> Option<u32> {
        self.history.push_back((now, bitrate));
        let first = self.history.len() == 1;

        self.expire(now);

        if self.timeout.is_none() {
            self.timeout = Some(now + self.interval);
        }

        if first {
            self.update()
        } else {
            None
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Option<u32> {
        if self.timeout.map(|t| t > now).unwrap_or(true) {
            return None;
        }
        self.timeout = None;
        self.expire(now);
        self.update()
    }

    /// Drop samples older than the interval, keeping the latest.
    fn expire(&mut self, now: Instant) {
        while self.history.len() > 1 {
            match self.history.front() {
                Some((t, _)) if *t + self.interval < now => {
                    self.history.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Mean minus standard deviation of the history.
    fn lower_average(&self) -> Option<u32> {
        let mut mean = 0.0_f64;
        let mut s = 0.0_f64;
        let mut count = 0.0_f64;

        for (_, b) in &self.history {
            let b = *b as f64;
            count += 1.0;
            let delta = b - mean;
            mean += delta / count;
            s += delta * (b - mean);
        }

        if count == 0.0 {
            return None;
        }

        let stddev = (s / count).sqrt();
        (mean > stddev).then(|| (mean - stddev) as u32)
    }

    fn update(&mut self) -> Option<u32> {
        let bitrate = self.lower_average()?;
        trace!("Computed average lower bitrate: {}", bitrate);

        let moved = match self.applied {
            None => true,
            Some(last) => {
                let last = last as f64;
                (bitrate as f64) > last * 1.1 || (bitrate as f64) < last * 0.9
            }
        };

        if moved {
            self.applied = Some(bitrate);
            Some(bitrate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sizes(caps: &Caps) -> Vec<(i64, i64)> {
        caps.structures()
            .iter()
            .filter_map(|s| Some((s.get_int("width")?, s.get_int("height")?)))
            .collect()
    }

    #[test]
    fn high_bitrate_allows_hd() {
        let caps = caps_from_bitrate("video/x-raw", 2_000_000);
        let sizes = sizes(&caps);

        // 50M pixels/s carries 1920x1200 at 21 fps.
        assert_eq!(sizes[0], (1920, 1200));
        let first = &caps.structures()[0];
        assert_eq!(first.get("framerate"), Some(&CapsValue::IntRange(20, 66)));
        assert_eq!(first.get_str("pixel-aspect-ratio"), Some("1/1"));
        assert!(sizes.contains(&(352, 288)));
    }

    #[test]
    fn low_bitrate_limits_resolution() {
        // 2.5M pixels/s: 320x240 reaches 32 fps, 640x480 only 8.
        let caps = caps_from_bitrate("video/x-raw", 100_000);
        let sizes = sizes(&caps);

        assert!(sizes.contains(&(320, 240)));
        assert!(!sizes.contains(&(640, 480)));
        assert!(sizes.iter().all(|(w, h)| w * h * 10 <= 2_500_000));
    }

    #[test]
    fn very_low_bitrate_falls_back_to_one_fps() {
        let caps = caps_from_bitrate("video/x-raw", 1);
        let sizes = sizes(&caps);

        assert_eq!(sizes, vec![(128, 96)]);
        assert_eq!(caps.structures()[0].get("framerate"), Some(&CapsValue::IntRange(1, 66)));
    }

    #[test]
    fn restrict_keeps_non_video() {
        let input = Caps::from_structures(vec![
            Structure::new("video/x-raw").with("width", CapsValue::IntRange(1, 4096)),
            Structure::new("audio/x-raw"),
        ]);

        let out = restrict_caps(&input, 100_000);

        assert!(out.structures().iter().any(|s| s.name() == "audio/x-raw"));
        assert!(out.structures().iter().any(|s| s.get_int("width") == Some(320)));
        assert!(out.structures().iter().all(|s| s.get_int("width") != Some(640)));

        let any = restrict_caps(&Caps::new_any(), 100_000);
        assert!(any.structures().iter().all(|s| s.name() == "video/x-raw"));
    }

    #[test]
    fn first_sample_applies_at_once() {
        let now = Instant::now();
        let mut a = BitrateAdapter::new();

        assert_eq!(a.add(now, 500_000), Some(500_000));
        assert_eq!(a.applied(), Some(500_000));
        assert_eq!(a.poll_timeout(), Some(now + ADAPTER_INTERVAL));

        // Later samples wait for the timer.
        assert_eq!(a.add(now + Duration::from_secs(1), 100_000), None);
        assert_eq!(a.handle_timeout(now + Duration::from_secs(5)), None);

        // Mean 300k, deviation 200k.
        assert_eq!(a.handle_timeout(now + ADAPTER_INTERVAL), Some(100_000));
        assert_eq!(a.poll_timeout(), None);
    }

    #[test]
    fn small_changes_are_ignored() {
        let now = Instant::now();
        let mut a = BitrateAdapter::new();

        a.add(now, 500_000);
        a.add(now + Duration::from_secs(11), 520_000);
        a.add(now + Duration::from_secs(12), 520_000);

        // The first sample expired, 520k is within 10%.
        assert_eq!(a.handle_timeout(now + Duration::from_secs(21)), None);
        assert_eq!(a.applied(), Some(500_000));
    }
}
