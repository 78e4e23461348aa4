//! Battery system geometry fixed at build time.

/// Number of parallel strings monitored by this controller.
pub const STRING_COUNT: usize = 2;

/// Series cells measured per string.
pub const CELLS_PER_STRING: usize = 16;

/// Cell temperature sensors per string.
pub const TEMP_SENSORS_PER_STRING: usize = 8;

// Per-string cell masks are stored in a u32.
const _: () = assert!(CELLS_PER_STRING <= 32 && TEMP_SENSORS_PER_STRING <= 32);

/// Iterates over every string index.
pub fn strings() -> impl Iterator<Item = u8> {
    (0..STRING_COUNT).filter_map(|string| u8::try_from(string).ok())
}
