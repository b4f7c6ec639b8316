//! Provides formatting helpers for durations and byte sizes.
//!
//! These helpers render the numbers reported by the cache statistics (see
//! [CacheStats](crate::lru::CacheStats)) and by [Average](crate::average::Average)
//! in a concise, human readable manner.

/// Formats a duration given in microseconds.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// Note that a helper function [format_short_duration](format_short_duration) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        write!(f, "{} us", micros)
    } else if micros < 10_000 {
        write!(f, "{:.2} ms", micros as f32 / 1_000.)
    } else if micros < 100_000 {
        write!(f, "{:.1} ms", micros as f32 / 1_000.)
    } else if micros < 1_000_000 {
        write!(f, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(f, "{:.2} s", micros as f32 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(f, "{:.1} s", micros as f32 / 1_000_000.)
    } else {
        write!(f, "{} s", micros / 1_000_000)
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// Note that a helper function [format_micros](format_micros) is also provided
/// which directly consumes a **std::fmt::Write**.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_short_duration(250), "250 us");
/// assert_eq!(ganymede::fmt::format_short_duration(2_500), "2.50 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(48_300), "48.3 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(512_000), "512 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(2_400_000), "2.40 s");
/// assert_eq!(ganymede::fmt::format_short_duration(36_000_000), "36.0 s");
/// assert_eq!(ganymede::fmt::format_short_duration(120_000_000), "120 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// Note that a helper function [format_size](format_size) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_bytes(size_in_bytes: usize, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if size_in_bytes == 1 {
        return write!(f, "1 byte");
    } else if size_in_bytes < 1024 {
        return write!(f, "{} bytes", size_in_bytes);
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < 5 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        write!(f, "{:.2} ", size)?;
    } else if size <= 100. {
        write!(f, "{:.1} ", size)?;
    } else {
        write!(f, "{:.0} ", size)?;
    }

    match magnitude {
        0 => write!(f, "Bytes"),
        1 => write!(f, "KiB"),
        2 => write!(f, "MiB"),
        3 => write!(f, "GiB"),
        4 => write!(f, "TiB"),
        _ => write!(f, "PiB"),
    }
}

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// Note that a helper function [format_bytes](format_bytes) is also provided
/// which directly consumes a **std::fmt::Write**.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_size(0), "0 bytes");
/// assert_eq!(ganymede::fmt::format_size(1), "1 byte");
/// assert_eq!(ganymede::fmt::format_size(667), "667 bytes");
/// assert_eq!(ganymede::fmt::format_size(4_096), "4.00 KiB");
/// assert_eq!(ganymede::fmt::format_size(45_056), "44.0 KiB");
/// assert_eq!(ganymede::fmt::format_size(524_288), "512 KiB");
/// assert_eq!(ganymede::fmt::format_size(5_242_880), "5.00 MiB");
/// assert_eq!(ganymede::fmt::format_size(3_221_225_472), "3.00 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let mut result = String::new();
    let _ = format_bytes(size_in_bytes, &mut result);

    result
}
