//! HTTP/2 settings
//!
//! Each side of a connection holds one [`Settings`] table for itself and
//! one for its peer. Tables start at the protocol defaults and change only
//! through validated SETTINGS frames.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;

/// Largest permitted SETTINGS_MAX_FRAME_SIZE
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest permitted flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

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

    /// Check a value against the bounds RFC 9113 places on it
    pub fn validate(self, value: u32) -> Result<()> {
        match self {
            SettingsParameter::EnablePush if value > 1 => Err(Error::Protocol(format!(
                "ENABLE_PUSH must be 0 or 1, got {}",
                value
            ))),
            SettingsParameter::InitialWindowSize if value > MAX_WINDOW_SIZE => {
                Err(Error::FlowControl(format!(
                    "INITIAL_WINDOW_SIZE {} exceeds maximum (2^31-1)",
                    value
                )))
            }
            SettingsParameter::MaxFrameSize
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
            {
                Err(Error::Protocol(format!(
                    "MAX_FRAME_SIZE {} outside valid range (16384-16777215)",
                    value
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// One endpoint's settings table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// None means unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// None means unlimited
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Validate and apply one received parameter
    ///
    /// Unknown identifiers are ignored.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<()> {
        let Some(param) = SettingsParameter::from_u16(id) else {
            return Ok(());
        };
        param.validate(value)?;

        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size = value,
            SettingsParameter::EnablePush => self.enable_push = value == 1,
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            SettingsParameter::InitialWindowSize => self.initial_window_size = value,
            SettingsParameter::MaxFrameSize => self.max_frame_size = value,
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size = Some(value),
        }
        Ok(())
    }

    /// Parameters a server advertises in its SETTINGS frame
    ///
    /// ENABLE_PUSH is never sent by a server.
    pub fn server_params(&self) -> Vec<(u16, u32)> {
        let mut params = vec![
            (SettingsParameter::HeaderTableSize.as_u16(), self.header_table_size),
            (SettingsParameter::InitialWindowSize.as_u16(), self.initial_window_size),
            (SettingsParameter::MaxFrameSize.as_u16(), self.max_frame_size),
        ];
        if let Some(max) = self.max_concurrent_streams {
            params.push((SettingsParameter::MaxConcurrentStreams.as_u16(), max));
        }
        if let Some(max) = self.max_header_list_size {
            params.push((SettingsParameter::MaxHeaderListSize.as_u16(), max));
        }
        params
    }
}

/// Builder for a local settings table
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = size;
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = enable;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build, rejecting values outside protocol bounds
    pub fn build(self) -> Result<Settings> {
        SettingsParameter::InitialWindowSize.validate(self.settings.initial_window_size)?;
        SettingsParameter::MaxFrameSize.validate(self.settings.max_frame_size)?;
        Ok(self.settings)
    }
}
