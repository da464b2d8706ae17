//! Voice directive: per-utterance overrides embedded in reply text.
//!
//! A reply whose first line parses as a JSON object may override the
//! synthesis voice, model, and speed for that utterance (and, unless
//! `once` is set, for the rest of the session). Parsing never fails the
//! reply: a malformed line simply means no directive and the whole text
//! is spoken.

use serde_json::Value;
use tracing::debug;

/// Valid playback speed multiplier range.
const SPEED_RANGE: (f32, f32) = (0.25, 4.0);
/// Valid spoken words-per-minute range for `rateWpm`.
const WPM_RANGE: (f64, f64) = (80.0, 400.0);
/// Baseline speaking rate a speed of 1.0 corresponds to.
const BASELINE_WPM: f64 = 175.0;

/// Overrides parsed from a reply's first line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    /// Synthesis voice override.
    pub voice: Option<String>,
    /// Synthesis model override.
    pub model: Option<String>,
    /// Speed multiplier override, already validated and in range.
    pub speed: Option<f32>,
    /// When set, the overrides apply to this utterance only.
    pub once: bool,
}

impl Directive {
    /// Whether the directive carries any override at all.
    pub fn is_empty(&self) -> bool {
        self.voice.is_none() && self.model.is_none() && self.speed.is_none()
    }
}

/// A reply split into its optional directive and the text to speak.
#[derive(Debug, Clone, Default)]
pub struct ParsedReply {
    /// Directive from the first line, if one parsed.
    pub directive: Option<Directive>,
    /// Remaining text with the directive line stripped.
    pub text: String,
    /// Directive keys that were present but not recognized. Reported,
    /// never fatal.
    pub unknown_keys: Vec<String>,
}

/// Split a reply into directive and spoken text.
///
/// The first line is a directive only when it parses as a JSON object;
/// anything else (including a parse error) degrades to "no directive"
/// and the full reply is returned as spoken text.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let trimmed = reply.trim_start();
    let (first_line, rest) = match trimmed.split_once('\n') {
        Some((line, rest)) => (line.trim(), rest),
        None => (trimmed.trim(), ""),
    };

    if !first_line.starts_with('{') {
        return ParsedReply {
            directive: None,
            text: reply.trim().to_owned(),
            unknown_keys: Vec::new(),
        };
    }

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(first_line) else {
        debug!("first line looks like JSON but did not parse; speaking verbatim");
        return ParsedReply {
            directive: None,
            text: reply.trim().to_owned(),
            unknown_keys: Vec::new(),
        };
    };

    let mut directive = Directive::default();
    let mut unknown_keys = Vec::new();
    let mut wpm_speed: Option<f32> = None;

    for (key, value) in &map {
        match key.as_str() {
            "voice" => directive.voice = value.as_str().map(str::to_owned),
            "model" => directive.model = value.as_str().map(str::to_owned),
            "speed" => directive.speed = value.as_f64().and_then(valid_speed),
            "rateWpm" => wpm_speed = value.as_f64().and_then(speed_from_wpm),
            "once" => directive.once = value.as_bool().unwrap_or(false),
            other => unknown_keys.push(other.to_owned()),
        }
    }

    // An explicit valid speed wins over a rate conversion.
    if directive.speed.is_none() {
        directive.speed = wpm_speed;
    }

    ParsedReply {
        directive: Some(directive),
        text: rest.trim().to_owned(),
        unknown_keys,
    }
}

/// A speed value inside the valid multiplier range, or `None`.
fn valid_speed(speed: f64) -> Option<f32> {
    let (lo, hi) = SPEED_RANGE;
    let speed = speed as f32;
    (speed.is_finite() && (lo..=hi).contains(&speed)).then_some(speed)
}

/// Convert a words-per-minute rate to a speed multiplier. Out-of-range
/// rates are treated as absent.
fn speed_from_wpm(wpm: f64) -> Option<f32> {
    let (lo, hi) = WPM_RANGE;
    if !wpm.is_finite() || !(lo..=hi).contains(&wpm) {
        return None;
    }
    let (slo, shi) = SPEED_RANGE;
    Some(((wpm / BASELINE_WPM) as f32).clamp(slo, shi))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn plain_text_has_no_directive() {
        let parsed = parse_reply("Hello there.\nSecond line.");
        assert!(parsed.directive.is_none());
        assert_eq!(parsed.text, "Hello there.\nSecond line.");
    }

    #[test]
    fn directive_line_is_parsed_and_stripped() {
        let parsed = parse_reply("{\"voice\": \"nova\", \"speed\": 1.5}\nHello there.");
        let directive = parsed.directive.unwrap();
        assert_eq!(directive.voice.as_deref(), Some("nova"));
        assert_eq!(directive.speed, Some(1.5));
        assert!(!directive.once);
        assert_eq!(parsed.text, "Hello there.");
    }

    #[test]
    fn once_scopes_overrides() {
        let parsed = parse_reply("{\"model\": \"tts-1-hd\", \"once\": true}\nHi.");
        let directive = parsed.directive.unwrap();
        assert_eq!(directive.model.as_deref(), Some("tts-1-hd"));
        assert!(directive.once);
    }

    #[test]
    fn out_of_range_speed_is_absent() {
        let parsed = parse_reply("{\"speed\": 9.0}\nHi.");
        assert_eq!(parsed.directive.unwrap().speed, None);

        let parsed = parse_reply("{\"speed\": 0.1}\nHi.");
        assert_eq!(parsed.directive.unwrap().speed, None);
    }

    #[test]
    fn rate_wpm_converts_to_speed() {
        let parsed = parse_reply("{\"rateWpm\": 350}\nHi.");
        let speed = parsed.directive.unwrap().speed.unwrap();
        assert!((speed - 2.0).abs() < 0.01, "350 wpm should be 2.0x: {speed}");
    }

    #[test]
    fn rate_wpm_out_of_range_is_absent() {
        let parsed = parse_reply("{\"rateWpm\": 40}\nHi.");
        assert_eq!(parsed.directive.unwrap().speed, None);
    }

    #[test]
    fn explicit_speed_wins_over_rate() {
        let parsed = parse_reply("{\"speed\": 1.2, \"rateWpm\": 350}\nHi.");
        assert_eq!(parsed.directive.unwrap().speed, Some(1.2));
    }

    #[test]
    fn unknown_keys_are_reported_not_fatal() {
        let parsed = parse_reply("{\"voice\": \"nova\", \"pitch\": 2}\nHi.");
        assert_eq!(parsed.unknown_keys, vec!["pitch"]);
        assert_eq!(parsed.directive.unwrap().voice.as_deref(), Some("nova"));
        assert_eq!(parsed.text, "Hi.");
    }

    #[test]
    fn malformed_json_first_line_is_spoken_verbatim() {
        let parsed = parse_reply("{not json at all\nHello.");
        assert!(parsed.directive.is_none());
        assert_eq!(parsed.text, "{not json at all\nHello.");
    }

    #[test]
    fn directive_only_reply_has_empty_text() {
        let parsed = parse_reply("{\"voice\": \"nova\"}");
        assert!(parsed.directive.is_some());
        assert!(parsed.text.is_empty());
    }

    #[test]
    fn wrong_value_types_are_absent() {
        let parsed = parse_reply("{\"voice\": 3, \"speed\": \"fast\", \"once\": \"yes\"}\nHi.");
        let directive = parsed.directive.unwrap();
        assert!(directive.voice.is_none());
        assert!(directive.speed.is_none());
        assert!(!directive.once);
    }
}
