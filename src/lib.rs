//! # rxfer
//!
//! Host-side layer around the transfer engine: log initialisation and the
//! settings file. The engine itself is re-exported as [`xfer`].

pub use rxfer_engine::xfer;

pub mod logging;
pub mod settings;

pub use logging::{LogConfig, LogFormat};
pub use settings::{Settings, SettingsError};
