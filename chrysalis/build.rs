// chrysalis/build.rs
// Chrysalis Build Script: build target tag and version string

use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // REL for optimized release builds, DBG for optimized debug, NPT without optimization
    let profile = env::var("PROFILE").unwrap_or_default();
    let opt_level = env::var("OPT_LEVEL").unwrap_or_default();
    let target = match (profile.as_str(), opt_level.as_str()) {
        ("release", _) => "REL",
        (_, "0") => "NPT",
        _ => "DBG",
    };

    let version = env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let digits: String = version.chars().filter(|c| *c != '.').collect();

    let epoch = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        });
    let (year, month, day) = civil_from_days((epoch / 86_400) as i64);

    println!("cargo:rustc-env=CHRYSALIS_TARGET={target}");
    println!(
        "cargo:rustc-env=CHRYSALIS_VERSION_STRING={target}-{digits}-{year:04}-{month:02}-{day:02}"
    );
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
