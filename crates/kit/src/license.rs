//! License file handling for the SR OS appliance family.
//!
//! The guest fetches `/tftpboot/license.txt` over the management NAT's TFTP
//! root. On the host side we only need two things out of it: the UUID the
//! license is bound to (passed to the emulator as `-uuid`) and the license
//! start date, advanced by one day and used as the fake RTC base so the
//! guest clock is always inside the validity window.

use camino::Utf8Path;
use chrono::{Days, NaiveDate};
use color_eyre::eyre::{eyre, Context, Result};
use tracing::info;

pub const LICENSE_PATH: &str = "/tftpboot/license.txt";

/// Identity extracted from a license file. Defaults apply when no license
/// is present (integrated mode does not require one).
#[derive(Debug, Clone, Default)]
pub struct License {
    pub uuid: Option<String>,
    /// `YYYY-MM-DD` fed to `-rtc base=`.
    pub rtc_base: Option<String>,
}

impl License {
    pub fn is_present(&self) -> bool {
        self.uuid.is_some()
    }
}

/// Read and parse the license file if it exists.
pub fn read(path: &Utf8Path) -> Result<License> {
    if !path.is_file() {
        info!("No license file found");
        return Ok(License::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let license = parse(&text).with_context(|| format!("Unable to parse license file {path}"))?;
    info!(
        "License file found for UUID {} with start date {}",
        license.uuid.as_deref().unwrap_or("-"),
        license.rtc_base.as_deref().unwrap_or("-")
    );
    if let Some(uuid) = &license.uuid {
        // older firmware revisions match against the byte-swapped form
        tracing::debug!("byte-swapped UUID form: {}", mangle_uuid(uuid));
    }
    Ok(license)
}

pub fn parse(text: &str) -> Result<License> {
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");

    // The first whitespace-delimited token is the UUID the license is bound
    // to. It is used verbatim; see `mangle_uuid` for the endianness variant
    // some firmware revisions expect.
    let uuid = body
        .split_whitespace()
        .next()
        .ok_or_else(|| eyre!("license file contains no UUID"))?
        .to_string();

    let rtc_base = find_date(&body)
        .map(|date| {
            date.checked_add_days(Days::new(1))
                .ok_or_else(|| eyre!("license start date out of range"))
                .map(|d| d.format("%Y-%m-%d").to_string())
        })
        .transpose()?;

    Ok(License {
        uuid: Some(uuid),
        rtc_base,
    })
}

/// First `YYYY-MM-DD` substring that parses as a real date.
fn find_date(s: &str) -> Option<NaiveDate> {
    let bytes = s.as_bytes();
    for start in 0..bytes.len().saturating_sub(9) {
        let w = &bytes[start..start + 10];
        let shaped = w.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
        if !shaped {
            continue;
        }
        if let Ok(date) = NaiveDate::parse_from_str(std::str::from_utf8(w).ok()?, "%Y-%m-%d") {
            return Some(date);
        }
    }
    None
}

/// Mangle a UUID to compensate for the endianness mismatch between how some
/// firmware stores the first three fields and how the license encodes them.
pub fn mangle_uuid(uuid: &str) -> String {
    let parts: Vec<&str> = uuid.split('-').collect();
    if parts.len() != 5 {
        return uuid.to_string();
    }
    [
        uuid_rev_part(parts[0]),
        uuid_rev_part(parts[1]),
        uuid_rev_part(parts[2]),
        parts[3].to_string(),
        parts[4].to_string(),
    ]
    .join("-")
}

/// Reverse the byte order of one hex-encoded UUID field.
pub fn uuid_rev_part(part: &str) -> String {
    let mut res = String::with_capacity(part.len());
    let bytes = part.as_bytes();
    for i in (0..bytes.len() / 2).rev() {
        res.push(bytes[2 * i] as char);
        res.push(bytes[2 * i + 1] as char);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_rev_part_is_an_involution() {
        for part in ["00010203", "0405", "deadbeef", "", "ab"] {
            assert_eq!(uuid_rev_part(&uuid_rev_part(part)), part);
        }
    }

    #[test]
    fn uuid_rev_part_reverses_byte_pairs() {
        assert_eq!(uuid_rev_part("00010203"), "03020100");
        assert_eq!(uuid_rev_part("0405"), "0504");
    }

    #[test]
    fn mangle_uuid_swaps_first_three_fields() {
        assert_eq!(
            mangle_uuid("00010203-0405-0607-0809-0a0b0c0d0e0f"),
            "03020100-0504-0706-0809-0a0b0c0d0e0f"
        );
    }

    #[test]
    fn mangle_uuid_leaves_malformed_input_alone() {
        assert_eq!(mangle_uuid("not-a-uuid"), "not-a-uuid");
    }

    #[test]
    fn parse_extracts_uuid_and_bumps_start_date() {
        let lic = parse("# issued by vendor\nc33b726a-93ee-4a9c-8b3c-5b43be0f2b57 2017-07-04 some-sig\n").unwrap();
        assert_eq!(
            lic.uuid.as_deref(),
            Some("c33b726a-93ee-4a9c-8b3c-5b43be0f2b57")
        );
        assert_eq!(lic.rtc_base.as_deref(), Some("2017-07-05"));
    }

    #[test]
    fn parse_bumps_across_month_and_year_boundaries() {
        let lic = parse("uuid-token valid from 2017-12-31\n").unwrap();
        assert_eq!(lic.rtc_base.as_deref(), Some("2018-01-01"));
    }

    #[test]
    fn parse_without_date_leaves_rtc_unset() {
        let lic = parse("uuid-token\n").unwrap();
        assert_eq!(lic.uuid.as_deref(), Some("uuid-token"));
        assert!(lic.rtc_base.is_none());
    }

    #[test]
    fn parse_rejects_empty_license() {
        assert!(parse("# only comments\n").is_err());
    }

    #[test]
    fn read_missing_file_yields_default() {
        let lic = read(Utf8Path::new("/nonexistent/license.txt")).unwrap();
        assert!(!lic.is_present());
    }
}
