//! Enforcement mode
//!
//! The mode is written once, before the event loop starts.

use crate::{config::Mode, error::EngineError};
use aya::maps::{Array, HashMap, Map, MapError};
use kntrl_common::{MAP_MODE, MODE_KEY};
use log::info;

/// Write `mode` at [`MODE_KEY`] of the mode map
///
/// The kernel object may declare the map as an array or a hash map.
pub fn apply(map: &mut Map, mode: Mode) -> Result<(), EngineError> {
    let code = mode.code();
    let result = if matches!(map, Map::Array(_)) {
        Array::<_, u32>::try_from(map).and_then(|mut a| a.set(MODE_KEY, code, 0))
    } else {
        HashMap::<_, u32, u32>::try_from(map).and_then(|mut h| h.insert(MODE_KEY, code, 0))
    };

    result.map_err(|source: MapError| EngineError::Map {
        map: MAP_MODE,
        source,
    })?;

    info!("mode set to {} ({})", mode, code);
    Ok(())
}
