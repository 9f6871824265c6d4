//! World-coordinate keyword sets.
//!
//! Set 0 uses the bare FITS names (`CDELT1`, ...). Set `n > 0` appends the
//! letter `chr('A' + n)` to names and short keys (`CD1_1B`), and is doubled with
//! the telescope's legacy numbering (`C21_1`).

use super::table::KeywordSpec;
use crate::error::{AppResult, CamstackError};

/// Reference pixel of the placeholder sets.
const DUMMY_PIX: (f64, f64) = (12345.6, 12345.6);
/// Plate scale of the placeholder sets.
const DUMMY_DELT: f64 = -0.654321;

/// Build WCS set number `wcs_num` (0..=9).
pub fn wcs_keywords(
    wcs_num: usize,
    pix: (f64, f64),
    delt: f64,
    cd_rot_rad: f64,
    legacy_double: bool,
) -> AppResult<Vec<(String, KeywordSpec)>> {
    if wcs_num >= 10 {
        return Err(CamstackError::Keyword(format!(
            "WCS set {wcs_num} out of range (0..=9)"
        )));
    }
    let suffix = if wcs_num == 0 {
        String::new()
    } else {
        char::from(b'A' + wcs_num as u8).to_string()
    };
    let (sin, cos) = cd_rot_rad.sin_cos();

    let base: [(&str, crate::keywords::KeywordValue, &str, &str, &str); 12] = [
        ("CDELT1", delt.into(), "X Scale projected on detector (#/pix)", "%20.8f", "CDE1"),
        ("CDELT2", delt.into(), "Y Scale projected on detector (#/pix)", "%20.8f", "CDE2"),
        ("CUNIT1", "DEGREE    ".into(), "Units used in both CRVAL1 and CDELT1", "%-10s", "CUN1"),
        ("CUNIT2", "DEGREE    ".into(), "Units used in both CRVAL2 and CDELT2", "%-10s", "CUN2"),
        ("CTYPE1", "RA---TAN  ".into(), "Pixel coordinate system", "%-10s", "CTP1"),
        ("CTYPE2", "DEC--TAN  ".into(), "Pixel coordinate system", "%-10s", "CTP2"),
        ("CRPIX1", pix.0.into(), "Reference pixel in X (pixel)", "%20.1f", "CPX1"),
        ("CRPIX2", pix.1.into(), "Reference pixel in Y (pixel)", "%20.1f", "CPX2"),
        ("CD1_1", (delt * cos).into(), "Pixel coordinate translation matrix", "%20.8f", "CD11"),
        ("CD1_2", (-delt * sin).into(), "Pixel coordinate translation matrix", "%20.8f", "CD12"),
        ("CD2_1", (delt * sin).into(), "Pixel coordinate translation matrix", "%20.8f", "CD21"),
        ("CD2_2", (delt * cos).into(), "Pixel coordinate translation matrix", "%20.8f", "CD22"),
    ];

    let mut out = Vec::with_capacity(if legacy_double && wcs_num > 0 { 24 } else { 12 });
    for (key, value, descr, fmt, short) in base {
        out.push((
            format!("{key}{suffix}"),
            KeywordSpec::new(value.clone(), descr, fmt, Some(format!("{short}{suffix}").as_str()))?,
        ));
        if legacy_double && wcs_num > 0 {
            // CD1_1 -> C21_1
            let legacy = format!("{}{}{}", &key[..1], wcs_num + 1, &key[2..]);
            out.push((
                legacy,
                KeywordSpec::new(value, descr, fmt, Some(format!("{short}{}", wcs_num + 1).as_str()))?,
            ));
        }
    }
    Ok(out)
}

/// Placeholder set, overwritten by the pointing-aware header writer downstream.
pub fn wcs_dummy_keywords(wcs_num: usize) -> AppResult<Vec<(String, KeywordSpec)>> {
    wcs_keywords(wcs_num, DUMMY_PIX, DUMMY_DELT, 0.0, true)
}
