//! Color parsing and cyclic hue math.
//!
//! Hue lives on a 256-point circle (0 and 255 are adjacent), matching the
//! value range the keyboard firmware uses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseColorError {
    #[error("unknown color format: {0}")]
    UnknownFormat(String),
    #[error("invalid hex color: {0}")]
    InvalidHex(String),
    #[error("invalid hsv hue: {0}")]
    InvalidHsv(String),
    #[error("hsv hue {0} out of range (0..=360)")]
    HsvOutOfRange(f64),
}

/// Named palette supported directly by the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedColor {
    Red,
    Yellow,
    Green,
    Cyan,
    Blue,
    Purple,
}

impl NamedColor {
    /// Fixed hue table (degrees mapped to the 0..=255 domain).
    pub fn hue(self) -> u8 {
        match self {
            NamedColor::Red => 0,
            NamedColor::Yellow => 42,
            NamedColor::Green => 85,
            NamedColor::Cyan => 128,
            NamedColor::Blue => 170,
            NamedColor::Purple => 213,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NamedColor::Red => "red",
            NamedColor::Yellow => "yellow",
            NamedColor::Green => "green",
            NamedColor::Cyan => "cyan",
            NamedColor::Blue => "blue",
            NamedColor::Purple => "purple",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "red" => Some(NamedColor::Red),
            "yellow" => Some(NamedColor::Yellow),
            "green" => Some(NamedColor::Green),
            "cyan" => Some(NamedColor::Cyan),
            "blue" => Some(NamedColor::Blue),
            "purple" => Some(NamedColor::Purple),
            _ => None,
        }
    }
}

impl fmt::Display for NamedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed color request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpec {
    Named(NamedColor),
    Hex { r: u8, g: u8, b: u8 },
    Hsv(u8),
}

impl ColorSpec {
    /// Target hue on the 0..=255 wheel.
    pub fn target_hue(&self) -> u8 {
        match self {
            ColorSpec::Named(name) => name.hue(),
            ColorSpec::Hex { r, g, b } => rgb_to_hue(*r, *g, *b),
            ColorSpec::Hsv(hue) => *hue,
        }
    }
}

impl fmt::Display for ColorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorSpec::Named(name) => write!(f, "{name}"),
            ColorSpec::Hex { r, g, b } => write!(f, "#{r:02x}{g:02x}{b:02x}"),
            ColorSpec::Hsv(hue) => write!(f, "hsv:{hue}"),
        }
    }
}

impl FromStr for ColorSpec {
    type Err = ParseColorError;

    /// Accepted formats:
    ///
    /// - named: `red`, `yellow`, `green`, `cyan`, `blue`, `purple`
    ///   (case-insensitive)
    /// - hex: `#RRGGBB` or `RRGGBB`
    /// - hsv: `hsv:<N>`. Values `0..=255` are raw hue units (truncated);
    ///   values in `(255, 360]` are degrees, converted by
    ///   `round(n / 360 * 255)` with 360 wrapping to 0. Anything negative or
    ///   above 360 is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim().to_ascii_lowercase();

        if let Some(name) = NamedColor::from_name(&input) {
            return Ok(ColorSpec::Named(name));
        }

        if let Some(rest) = input.strip_prefix("hsv:") {
            let value: f64 = rest
                .trim()
                .parse()
                .map_err(|_| ParseColorError::InvalidHsv(rest.trim().to_string()))?;
            if !value.is_finite() || value < 0.0 || value > 360.0 {
                return Err(ParseColorError::HsvOutOfRange(value));
            }
            if value <= 255.0 {
                return Ok(ColorSpec::Hsv(value as u8));
            }
            let degrees = value % 360.0;
            let hue = ((degrees / 360.0) * 255.0).round() as u16 % 256;
            return Ok(ColorSpec::Hsv(hue as u8));
        }

        let digits = input.strip_prefix('#').unwrap_or(&input);
        if digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            let parse =
                |range| u8::from_str_radix(&digits[range], 16).map_err(|_| {
                    ParseColorError::InvalidHex(input.clone())
                });
            return Ok(ColorSpec::Hex {
                r: parse(0..2)?,
                g: parse(2..4)?,
                b: parse(4..6)?,
            });
        }
        if input.starts_with('#') {
            return Err(ParseColorError::InvalidHex(input));
        }

        Err(ParseColorError::UnknownFormat(input))
    }
}

/// Standard RGB -> HSV hue extraction, scaled to 0..=255.
/// Achromatic input (r == g == b) maps to 0.
pub fn rgb_to_hue(r: u8, g: u8, b: u8) -> u8 {
    let rf = f64::from(r) / 255.0;
    let gf = f64::from(g) / 255.0;
    let bf = f64::from(b) / 255.0;

    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    if delta == 0.0 {
        return 0;
    }

    let mut degrees = if max == rf {
        60.0 * (((gf - bf) / delta) % 6.0)
    } else if max == gf {
        60.0 * (((bf - rf) / delta) + 2.0)
    } else {
        60.0 * (((rf - gf) / delta) + 4.0)
    };

    if degrees < 0.0 {
        degrees += 360.0;
    }

    (((degrees / 360.0) * 255.0).round() as u16 % 256) as u8
}

/// Direction of travel on the hue wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Up,
    Down,
}

impl fmt::Display for StepDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepDirection::Up => "+",
            StepDirection::Down => "-",
        })
    }
}

/// Shortest arc between two hues on the 256-point cycle.
///
/// Returns the direction of the shorter arc and its length (always <= 128).
/// An exact tie (128 both ways) resolves to `Up`.
pub fn shortest_path(current: u8, target: u8) -> (StepDirection, u8) {
    let forward = (i32::from(target) - i32::from(current)).rem_euclid(256);
    let backward = (256 - forward) % 256;

    if forward <= backward {
        (StepDirection::Up, forward as u8)
    } else {
        (StepDirection::Down, backward as u8)
    }
}

/// A stepping plan derived from the shortest arc and a fixed step size.
///
/// The external tool moves `step_size` hue units per invocation, so the plan
/// is `steps` whole invocations plus a `remainder < step_size` the device
/// cannot express. Executing the plan lands within `step_size - 1` of the
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub direction: StepDirection,
    pub steps: u32,
    pub remainder: u8,
}

impl StepPlan {
    pub fn between(current: u8, target: u8, step_size: u8) -> Self {
        debug_assert!(step_size > 0);
        let (direction, distance) = shortest_path(current, target);
        StepPlan {
            direction,
            steps: u32::from(distance) / u32::from(step_size),
            remainder: distance % step_size,
        }
    }

    /// Total hue units the plan travels.
    pub fn travel(&self, step_size: u8) -> u16 {
        self.steps as u16 * u16::from(step_size)
    }
}

/// Adds a signed delta to a hue, wrapping on the 256-point cycle.
pub fn wrap_add(hue: u8, delta: i32) -> u8 {
    (i32::from(hue) + delta).rem_euclid(256) as u8
}
