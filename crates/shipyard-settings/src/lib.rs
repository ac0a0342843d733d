//! # shipyard-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ShipyardSettings::default()`]
//! 2. **User file**: `~/.shipyard/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SHIPYARD_*` overrides (highest priority)
//!
//! Settings are loaded once by the binary and passed down explicitly;
//! there is no process-wide singleton.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
