//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS frames and parameters
//! as defined in RFC 7540 Section 6.5.

use super::error::{Error, Result};
use std::fmt;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Get initial window size (with default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(65535)
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(16384)
    }

    /// Get max concurrent streams (None = unlimited)
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        // SETTINGS_INITIAL_WINDOW_SIZE is capped at 2^31-1
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > 0x7FFFFFFF {
                return Err(Error::InvalidSettings(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        // SETTINGS_MAX_FRAME_SIZE must be in [16384, 16777215]
        if let Some(max_frame_size) = self.max_frame_size {
            if !(16384..=16777215).contains(&max_frame_size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }

    /// Parse a SETTINGS frame payload (or an `HTTP2-Settings` upgrade
    /// payload, which uses the same encoding)
    ///
    /// Unknown parameters are ignored per RFC 7540. The payload length must
    /// be a multiple of six.
    pub fn parse_payload(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        let mut pos = 0;
        while pos + 6 <= payload.len() {
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let value = u32::from_be_bytes([
                payload[pos + 2],
                payload[pos + 3],
                payload[pos + 4],
                payload[pos + 5],
            ]);

            match id {
                0x1 => settings.header_table_size = Some(value),
                0x2 => settings.enable_push = Some(value != 0),
                0x3 => settings.max_concurrent_streams = Some(value),
                0x4 => settings.initial_window_size = Some(value),
                0x5 => settings.max_frame_size = Some(value),
                0x6 => settings.max_header_list_size = Some(value),
                _ => {}
            }

            pos += 6;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Encode the set parameters as a SETTINGS frame payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let mut put = |id: SettingsParameter, value: u32| {
            out.extend_from_slice(&id.as_u16().to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        };

        if let Some(val) = self.header_table_size {
            put(SettingsParameter::HeaderTableSize, val);
        }
        if let Some(val) = self.enable_push {
            put(SettingsParameter::EnablePush, u32::from(val));
        }
        if let Some(val) = self.max_concurrent_streams {
            put(SettingsParameter::MaxConcurrentStreams, val);
        }
        if let Some(val) = self.initial_window_size {
            put(SettingsParameter::InitialWindowSize, val);
        }
        if let Some(val) = self.max_frame_size {
            put(SettingsParameter::MaxFrameSize, val);
        }
        if let Some(val) = self.max_header_list_size {
            put(SettingsParameter::MaxHeaderListSize, val);
        }

        out
    }
}

/// Builder for HTTP/2 settings
#[derive(Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
