//! Exact-match format selection.
//!
//! All four fields must be equal; the first match in enumeration order wins.
//! There is no nearest-match fallback: a miss is `None` and the caller
//! decides what to try next.

use crate::types::FormatDescription;

/// Index of the first entry of `available` equal to `target`.
pub fn position_of(target: &FormatDescription, available: &[FormatDescription]) -> Option<usize> {
    available.iter().position(|candidate| candidate == target)
}

/// First entry of `available` equal to `target`, returned unchanged.
pub fn find_format(
    target: &FormatDescription,
    available: &[FormatDescription],
) -> Option<FormatDescription> {
    position_of(target, available).map(|i| available[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn device_a() -> Vec<FormatDescription> {
        vec![
            FormatDescription::new(640, 480, 30, PixelFormat::Nv12),
            FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg),
        ]
    }

    #[test]
    fn exact_match_is_returned_unchanged() {
        let target = FormatDescription::new(640, 480, 30, PixelFormat::Nv12);
        assert_eq!(find_format(&target, &device_a()), Some(target));
    }

    #[test]
    fn differing_fps_is_no_match() {
        let target = FormatDescription::new(640, 480, 60, PixelFormat::Nv12);
        assert_eq!(find_format(&target, &device_a()), None);
    }

    #[test]
    fn every_field_participates() {
        let formats = device_a();
        let misses = [
            FormatDescription::new(641, 480, 30, PixelFormat::Nv12),
            FormatDescription::new(640, 481, 30, PixelFormat::Nv12),
            FormatDescription::new(640, 480, 30, PixelFormat::Mjpeg),
            FormatDescription::new(1280, 720, 15, PixelFormat::Nv12),
        ];
        for target in misses {
            assert_eq!(find_format(&target, &formats), None, "{target}");
        }
    }

    #[test]
    fn first_match_in_enumeration_order_wins() {
        let dup = FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg);
        let mut formats = device_a();
        formats.push(dup);
        assert_eq!(position_of(&dup, &formats), Some(1));
    }

    #[test]
    fn empty_list_never_matches() {
        let target = FormatDescription::new(640, 480, 30, PixelFormat::Nv12);
        assert_eq!(find_format(&target, &[]), None);
    }
}
