//! NMEA-183 sentence decoding
//!
//! Decoding never fails on malformed input: short sentences are padded with
//! empty fields and unparsable numbers default to zero, so a single bad field
//! does not cost the rest of the sentence.

use std::fmt;

use tracing::debug;

use crate::models::{GpsQuality, SentenceFilter};

/// Text stored for a coordinate that could not be decoded
pub const UNKNOWN_COORDINATE: &str = "0.0";

const GGA_FIELDS: usize = 15;
const HDT_FIELDS: usize = 3;
const VTG_FIELDS: usize = 10;
const DEPTH_FIELDS: usize = 3;

const METERS_PER_FOOT: f64 = 0.3048;

/// Sentence families understood by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    /// Position and fix quality
    Gga,
    /// True heading
    Hdt,
    /// Course and speed over ground
    Vtg,
    /// Depth below transducer
    Dbt,
    /// Depth of water
    Dpt,
}

/// One decoded field group
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Position {
        latitude: Option<Coordinate>,
        longitude: Option<Coordinate>,
        quality: GpsQuality,
    },
    /// Heading in degrees
    Heading(f64),
    /// Speed over ground in knots
    Speed(f64),
    /// Water depth in meters
    Depth(f64),
}

/// Classify a sentence by the 3-character type code following the talker ID
pub fn sentence_type(line: &str) -> Option<SentenceKind> {
    match line.get(3..6)? {
        "GGA" => Some(SentenceKind::Gga),
        "HDT" => Some(SentenceKind::Hdt),
        "VTG" => Some(SentenceKind::Vtg),
        "DBT" => Some(SentenceKind::Dbt),
        "DPT" => Some(SentenceKind::Dpt),
        _ => None,
    }
}

/// Whether a line looks like an NMEA sentence at all
pub fn is_sentence(line: &str) -> bool {
    line.starts_with('$') && line.len() > 6
}

impl SentenceFilter {
    pub fn accepts(&self, kind: SentenceKind) -> bool {
        match self {
            SentenceFilter::All => true,
            SentenceFilter::Gga => kind == SentenceKind::Gga,
            SentenceFilter::Hdt => kind == SentenceKind::Hdt,
            SentenceFilter::Vtg => kind == SentenceKind::Vtg,
            SentenceFilter::Depth => matches!(kind, SentenceKind::Dbt | SentenceKind::Dpt),
        }
    }
}

/// Decode one trimmed line into a field group update
///
/// Returns `None` for sentence types the service does not track.
pub fn decode(line: &str) -> Option<FieldUpdate> {
    let kind = sentence_type(line)?;
    let update = match kind {
        SentenceKind::Gga => decode_gga(line),
        SentenceKind::Hdt => {
            let fields = split_fields(line, HDT_FIELDS);
            FieldUpdate::Heading(parse_number(fields[1], "heading", line))
        }
        SentenceKind::Vtg => {
            let fields = split_fields(line, VTG_FIELDS);
            FieldUpdate::Speed(parse_number(fields[5], "speed", line))
        }
        SentenceKind::Dpt => {
            let fields = split_fields(line, DEPTH_FIELDS);
            FieldUpdate::Depth(parse_number(fields[1], "depth", line))
        }
        SentenceKind::Dbt => decode_dbt(line),
    };
    Some(update)
}

fn decode_gga(line: &str) -> FieldUpdate {
    let fields = split_fields(line, GGA_FIELDS);

    let latitude = parse_coordinate(fields[2], fields[3], Axis::Latitude, line);
    let longitude = parse_coordinate(fields[4], fields[5], Axis::Longitude, line);
    let quality = GpsQuality::from_indicator(fields[6]);

    FieldUpdate::Position {
        latitude,
        longitude,
        quality,
    }
}

/// `$xxDBT,<feet>,f,<meters>,M,<fathoms>,F`; meters preferred.
fn decode_dbt(line: &str) -> FieldUpdate {
    let fields = split_fields(line, DEPTH_FIELDS);
    let meters = fields.get(3).map(|f| f.trim()).unwrap_or("");
    if !meters.is_empty() {
        return FieldUpdate::Depth(parse_number(meters, "depth", line));
    }
    FieldUpdate::Depth(parse_number(fields[1], "depth", line) * METERS_PER_FOOT)
}

/// Split a sentence into fields, dropping any `*hh` checksum and padding
/// short sentences with empty fields.
fn split_fields(line: &str, minimum: usize) -> Vec<&str> {
    let body = line.split_once('*').map_or(line, |(body, _)| body);
    let mut fields: Vec<&str> = body.split(',').collect();
    if fields.len() < minimum {
        debug!(
            "Short sentence, padding {} missing fields with defaults: {}",
            minimum - fields.len(),
            line
        );
        fields.resize(minimum, "");
    }
    fields
}

fn parse_number(field: &str, name: &str, line: &str) -> f64 {
    let field = field.trim();
    if field.is_empty() {
        return 0.0;
    }
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => {
            debug!("Error parsing {} {:?}, using default 0: {}", name, field, line);
            0.0
        }
    }
}

fn parse_coordinate(value: &str, hemisphere: &str, axis: Axis, line: &str) -> Option<Coordinate> {
    let value = value.trim();
    let hemisphere = hemisphere.trim();
    if value.is_empty() || hemisphere.is_empty() {
        return None;
    }

    let parsed = value
        .parse::<f64>()
        .ok()
        .zip(Hemisphere::from_letter(hemisphere, axis))
        .and_then(|(value, hemisphere)| Coordinate::from_nmea(value, hemisphere));
    if parsed.is_none() {
        debug!(
            "Error parsing {:?} coordinate {:?} {:?}, using default: {}",
            axis, value, hemisphere, line
        );
    }
    parsed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    North,
    South,
    East,
    West,
}

impl Hemisphere {
    /// Parse a hemisphere letter valid for the given axis
    pub fn from_letter(letter: &str, axis: Axis) -> Option<Self> {
        match (letter, axis) {
            ("N", Axis::Latitude) => Some(Hemisphere::North),
            ("S", Axis::Latitude) => Some(Hemisphere::South),
            ("E", Axis::Longitude) => Some(Hemisphere::East),
            ("W", Axis::Longitude) => Some(Hemisphere::West),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Hemisphere::North => 'N',
            Hemisphere::South => 'S',
            Hemisphere::East => 'E',
            Hemisphere::West => 'W',
        }
    }

    fn is_negative(&self) -> bool {
        matches!(self, Hemisphere::South | Hemisphere::West)
    }
}

/// A latitude or longitude as whole degrees, decimal minutes and hemisphere
///
/// Displayed as `D°M'H`, e.g. `48°7.038000'N`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    degrees: u32,
    minutes: f64,
    hemisphere: Hemisphere,
}

impl Coordinate {
    /// From the NMEA `dddmm.mmmm` representation
    pub fn from_nmea(value: f64, hemisphere: Hemisphere) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let degrees = (value / 100.0).trunc();
        Some(Self {
            degrees: degrees as u32,
            minutes: value - degrees * 100.0,
            hemisphere,
        })
    }

    /// From signed decimal degrees; the sign selects the hemisphere
    pub fn from_decimal(decimal: f64, axis: Axis) -> Self {
        let hemisphere = match (axis, decimal < 0.0) {
            (Axis::Latitude, false) => Hemisphere::North,
            (Axis::Latitude, true) => Hemisphere::South,
            (Axis::Longitude, false) => Hemisphere::East,
            (Axis::Longitude, true) => Hemisphere::West,
        };
        let magnitude = decimal.abs();
        let degrees = magnitude.trunc();
        Self {
            degrees: degrees as u32,
            minutes: (magnitude - degrees) * 60.0,
            hemisphere,
        }
    }

    /// Parse the display form. The `D°M°H` and `D M H` variants are accepted too.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let letter = text.chars().last()?;
        let body = text[..text.len() - letter.len_utf8()].trim_end_matches(['\'', '°', ' ']);
        let (degrees, minutes) = body.split_once(['°', ' '])?;

        let axis = match letter {
            'N' | 'S' => Axis::Latitude,
            _ => Axis::Longitude,
        };
        let hemisphere = Hemisphere::from_letter(letter.encode_utf8(&mut [0; 4]), axis)?;
        let degrees = degrees.trim().parse::<u32>().ok()?;
        let minutes = minutes.trim().parse::<f64>().ok()?;
        if !minutes.is_finite() {
            return None;
        }

        Some(Self {
            degrees,
            minutes,
            hemisphere,
        })
    }

    /// Signed decimal degrees; southern and western hemispheres are negative
    pub fn decimal(&self) -> f64 {
        let magnitude = self.degrees as f64 + self.minutes / 60.0;
        if self.hemisphere.is_negative() {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn hemisphere(&self) -> Hemisphere {
        self.hemisphere
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}°{:.6}'{}",
            self.degrees,
            self.minutes,
            self.hemisphere.letter()
        )
    }
}

/// Display text for an optional coordinate
pub fn coordinate_text(coordinate: Option<&Coordinate>) -> String {
    coordinate
        .map(Coordinate::to_string)
        .unwrap_or_else(|| UNKNOWN_COORDINATE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
    }

    #[test]
    fn decode_gga() {
        let Some(FieldUpdate::Position {
            latitude,
            longitude,
            quality,
        }) = decode(GGA)
        else {
            panic!("expected position update");
        };

        let latitude = latitude.unwrap();
        let longitude = longitude.unwrap();
        assert_eq!(latitude.to_string(), "48°7.038000'N");
        assert_eq!(longitude.to_string(), "11°31.000000'E");
        assert_close(latitude.decimal(), 48.0 + 7.038 / 60.0);
        assert_close(longitude.decimal(), 11.0 + 31.0 / 60.0);
        assert_eq!(quality, GpsQuality::GpsFix);
    }

    #[test]
    fn decode_gga_southern_western() {
        let line = "$GPGGA,000000,0610.5000,S,10649.2000,W,2,08,0.9,5.0,M,0.0,M,,";
        let Some(FieldUpdate::Position {
            latitude,
            longitude,
            quality,
        }) = decode(line)
        else {
            panic!("expected position update");
        };

        assert_close(latitude.unwrap().decimal(), -(6.0 + 10.5 / 60.0));
        assert_close(longitude.unwrap().decimal(), -(106.0 + 49.2 / 60.0));
        assert_eq!(quality, GpsQuality::DifferentialGpsFix);
    }

    #[test]
    fn decode_truncated_gga_defaults() {
        let update = decode("$GPGGA,123519,,N,").unwrap();
        assert_eq!(
            update,
            FieldUpdate::Position {
                latitude: None,
                longitude: None,
                quality: GpsQuality::NotApplicable,
            }
        );

        if let FieldUpdate::Position { latitude, .. } = update {
            assert_eq!(coordinate_text(latitude.as_ref()), "0.0");
        }
    }

    #[test]
    fn decode_gga_bad_latitude_keeps_other_fields() {
        let line = "$GPGGA,123519,48x7.038,N,01131.000,E,4,08,0.9,545.4,M,46.9,M,,";
        let Some(FieldUpdate::Position {
            latitude,
            longitude,
            quality,
        }) = decode(line)
        else {
            panic!("expected position update");
        };
        assert!(latitude.is_none());
        assert!(longitude.is_some());
        assert_eq!(quality, GpsQuality::RtkFixed);
    }

    #[test]
    fn decode_heading() {
        assert_eq!(decode("$HEHDT,274.07,T*03"), Some(FieldUpdate::Heading(274.07)));
        assert_eq!(decode("$HEHDT"), Some(FieldUpdate::Heading(0.0)));
        assert_eq!(decode("$HEHDT,abc,T"), Some(FieldUpdate::Heading(0.0)));
    }

    #[test]
    fn decode_speed() {
        assert_eq!(
            decode("$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*48"),
            Some(FieldUpdate::Speed(5.5))
        );
        assert_eq!(decode("$GPVTG,054.7,T"), Some(FieldUpdate::Speed(0.0)));
    }

    #[test]
    fn decode_depth() {
        assert_eq!(decode("$SDDPT,12.5,0.3*6A"), Some(FieldUpdate::Depth(12.5)));
        assert_eq!(
            decode("$SDDBT,32.8,f,10.0,M,5.4,F*3C"),
            Some(FieldUpdate::Depth(10.0))
        );
        let Some(FieldUpdate::Depth(meters)) = decode("$SDDBT,10.0,f,,M,,F") else {
            panic!("expected depth update");
        };
        assert_close(meters, 3.048);
    }

    #[test]
    fn decode_unrecognized() {
        assert_eq!(decode("$GPRMC,123519,A,4807.038,N"), None);
        assert_eq!(decode("$GP"), None);
        assert_eq!(decode(""), None);
    }

    #[test]
    fn filter_accepts_families() {
        assert!(SentenceFilter::All.accepts(SentenceKind::Vtg));
        assert!(SentenceFilter::Gga.accepts(SentenceKind::Gga));
        assert!(!SentenceFilter::Gga.accepts(SentenceKind::Hdt));
        assert!(SentenceFilter::Depth.accepts(SentenceKind::Dbt));
        assert!(SentenceFilter::Depth.accepts(SentenceKind::Dpt));
        assert!(!SentenceFilter::Vtg.accepts(SentenceKind::Dpt));
    }

    #[test]
    fn coordinate_round_trip() {
        let cases = [
            (48.1173, Axis::Latitude),
            (-6.175, Axis::Latitude),
            (-0.5, Axis::Latitude),
            (106.82, Axis::Longitude),
            (-179.999_999, Axis::Longitude),
        ];
        for (decimal, axis) in cases {
            let text = Coordinate::from_decimal(decimal, axis).to_string();
            let parsed = Coordinate::parse(&text).unwrap();
            assert_close(parsed.decimal(), decimal);
            assert_eq!(parsed.decimal() < 0.0, decimal < 0.0, "{}", text);
        }
    }

    #[test]
    fn southern_and_western_are_negative() {
        let south = Coordinate::parse("6°10.5'S").unwrap();
        let west = Coordinate::parse("106°49.2'W").unwrap();
        assert!(south.decimal() < 0.0);
        assert!(west.decimal() < 0.0);
        assert_eq!(Coordinate::from_decimal(-6.175, Axis::Latitude).hemisphere(), Hemisphere::South);
        assert_eq!(Coordinate::from_decimal(106.8, Axis::Longitude).hemisphere(), Hemisphere::East);
    }

    #[test]
    fn parse_alternative_forms() {
        assert_close(Coordinate::parse("6°10.5°S").unwrap().decimal(), -6.175);
        assert_close(Coordinate::parse("6 10.5 S").unwrap().decimal(), -6.175);
        assert!(Coordinate::parse("0.0").is_none());
        assert!(Coordinate::parse("").is_none());
        assert!(Coordinate::parse("6°10.5'X").is_none());
    }
}
