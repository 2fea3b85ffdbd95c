use std::time::Duration;

use tracing::debug;

use crate::config::AudioConfig;

/// Candidate window positions, as fractions of the source length.
const CANDIDATE_FRACTIONS: [f64; 4] = [0.0, 0.25, 0.5, 0.75];

const MIN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// A planned sampling window within a longer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipPosition {
    pub start: Duration,
    pub duration: Duration,
    pub index: usize,
}

impl ClipPosition {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Plan which windows of a source to extract.
///
/// Short sources get a single window from 0. Longer sources get up to
/// `max_clips` windows at 0%, 25%, 50%, 75% and near the end, bounded by
/// `max_total_audio`. A zero or non-finite `total_secs` yields no windows.
pub fn plan_clip_positions(total_secs: f64, config: &AudioConfig) -> Vec<ClipPosition> {
    if !total_secs.is_finite() || total_secs <= 0.0 {
        return Vec::new();
    }
    let total = Duration::from_secs_f64(total_secs);

    if total <= config.short_media_threshold {
        return vec![ClipPosition {
            start: Duration::ZERO,
            duration: total.min(config.max_total_audio),
            index: 0,
        }];
    }

    let candidates = CANDIDATE_FRACTIONS
        .iter()
        .map(|f| total.mul_f64(*f))
        .chain(std::iter::once(total.saturating_sub(config.end_offset)))
        .take(config.max_clips);

    let mut clips: Vec<ClipPosition> = Vec::new();
    let mut planned = Duration::ZERO;

    for start in candidates {
        if planned >= config.max_total_audio {
            break;
        }
        if let Some(previous) = clips.last() {
            if start < previous.end() {
                debug!("Skipping candidate at {:.1}s: overlaps previous window", start.as_secs_f64());
                continue;
            }
        }

        let duration = config
            .short_clip_duration
            .min(total.saturating_sub(start))
            .min(config.max_total_audio - planned);

        if duration < config.min_clip_duration {
            debug!(
                "Skipping candidate at {:.1}s: {:.1}s is below the minimum window",
                start.as_secs_f64(),
                duration.as_secs_f64()
            );
            continue;
        }

        clips.push(ClipPosition {
            start,
            duration,
            index: clips.len(),
        });
        planned += duration;
    }

    debug!(
        "Planned {} windows ({:.1}s) over {:.1}s of media",
        clips.len(),
        planned.as_secs_f64(),
        total_secs
    );

    clips
}

/// Per-attempt extraction timeout: 20% of the clip length, clamped to 30..=60s.
pub fn calculate_timeout(clip_duration: Duration) -> Duration {
    clip_duration.mul_f64(0.2).clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_media_single_window() {
        let config = AudioConfig::default();
        let clips = plan_clip_positions(120.0, &config);
        assert_eq!(
            clips,
            vec![ClipPosition {
                start: Duration::ZERO,
                duration: Duration::from_secs(90),
                index: 0,
            }]
        );
    }

    #[test]
    fn test_very_short_media_uses_full_length() {
        let clips = plan_clip_positions(12.5, &AudioConfig::default());
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].duration, Duration::from_secs_f64(12.5));
    }

    #[test]
    fn test_empty_duration_yields_no_windows() {
        let config = AudioConfig::default();
        assert!(plan_clip_positions(0.0, &config).is_empty());
        assert!(plan_clip_positions(-3.0, &config).is_empty());
        assert!(plan_clip_positions(f64::NAN, &config).is_empty());
        assert!(plan_clip_positions(f64::INFINITY, &config).is_empty());
    }

    #[test]
    fn test_long_media_respects_total_budget() {
        // 3 windows of 30s fill the 90s budget before 75% and near-end are reached.
        let clips = plan_clip_positions(3600.0, &AudioConfig::default());
        assert_eq!(clips.len(), 3);
        assert_eq!(clips[0].start, Duration::ZERO);
        assert_eq!(clips[1].start, Duration::from_secs(900));
        assert_eq!(clips[2].start, Duration::from_secs(1800));
        let total: Duration = clips.iter().map(|c| c.duration).sum();
        assert_eq!(total, Duration::from_secs(90));
    }

    #[test]
    fn test_long_media_with_large_budget_reaches_end() {
        let config = AudioConfig {
            max_total_audio: Duration::from_secs(600),
            ..AudioConfig::default()
        };
        let clips = plan_clip_positions(1000.0, &config);
        assert_eq!(clips.len(), 5);
        assert_eq!(clips[4].start, Duration::from_secs(940));
        assert_eq!(clips[4].end(), Duration::from_secs(970));
        for (i, clip) in clips.iter().enumerate() {
            assert_eq!(clip.index, i);
        }
    }

    #[test]
    fn test_final_window_shrinks_to_budget() {
        let config = AudioConfig {
            max_total_audio: Duration::from_secs(75),
            ..AudioConfig::default()
        };
        let clips = plan_clip_positions(3600.0, &config);
        assert_eq!(clips.len(), 3);
        assert_eq!(clips[2].duration, Duration::from_secs(15));
    }

    #[test]
    fn test_tiny_remainder_is_discarded() {
        let config = AudioConfig {
            max_total_audio: Duration::from_secs(63),
            ..AudioConfig::default()
        };
        let clips = plan_clip_positions(3600.0, &config);
        // The third window would be 3s, below the 5s floor.
        assert_eq!(clips.len(), 2);
    }

    #[test]
    fn test_overlapping_candidates_are_skipped() {
        let config = AudioConfig {
            short_clip_duration: Duration::from_secs(200),
            max_total_audio: Duration::from_secs(2000),
            short_media_threshold: Duration::from_secs(60),
            ..AudioConfig::default()
        };
        let clips = plan_clip_positions(400.0, &config);
        for pair in clips.windows(2) {
            assert!(pair[0].end() <= pair[1].start);
        }
        // 0..200, 200..400; the 75% and near-end candidates overlap.
        assert_eq!(clips.len(), 2);
    }

    #[test]
    fn test_timeout_clamp() {
        assert_eq!(calculate_timeout(Duration::from_secs(10)), Duration::from_secs(30));
        assert_eq!(calculate_timeout(Duration::from_secs(400)), Duration::from_secs(60));
        assert_eq!(calculate_timeout(Duration::from_secs(200)), Duration::from_secs(40));
    }
}
