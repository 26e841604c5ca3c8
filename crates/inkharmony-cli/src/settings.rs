//! Application settings management
//!
//! Persistent defaults for the audio device and player timing, overridden by
//! command-line flags.

use std::fs;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use anyhow::{ Context, Result };
use serde::{ Deserialize, Serialize };

use inkharmony_core::{ OutputConfig, PlayerConfig };


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Output buffer length in milliseconds
    pub buffer_ms: u32,

    /// Preferred output device; the system default when unset
    pub output_device: Option<String>,

    pub start_timeout_ms: u64,

    pub join_timeout_ms: u64,

    pub log_level: String,
}


impl Default for Settings {
    fn default() -> Self {
        let player = PlayerConfig::default();
        Self {
            buffer_ms: OutputConfig::default().buffer_ms,
            output_device: None,
            start_timeout_ms: player.start_timeout.as_millis() as u64,
            join_timeout_ms: player.join_timeout.as_millis() as u64,
            log_level: "warn".into(),
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "inkharmony" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( path ) {
            Ok( contents ) => Self::parse( &contents ),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to disk.
    pub fn save( &self ) -> Result<()> {
        let path = Self::settings_path().context( "No config directory on this system" )?;
        self.save_to( &path )
    }


    fn save_to( &self, path: &Path ) -> Result<()> {
        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all( parent ).context( "Failed to create settings directory" )?;
            }
        }

        let json = serde_json::to_string_pretty( self ).context( "Failed to serialize settings" )?;
        fs::write( path, json ).with_context( || format!( "Failed to write {}", path.display() ) )?;
        tracing::info!( "Saved settings to {:?}", path );
        Ok(())
    }


    /// Parses settings JSON, falling back to defaults if it is malformed.
    fn parse( contents: &str ) -> Self {
        serde_json::from_str( contents ).unwrap_or_else( |e| {
            tracing::warn!( "Ignoring malformed settings: {}", e );
            Self::default()
        })
    }


    /// Output configuration, with `device` taking precedence over the stored one.
    pub fn output_config( &self, device: Option<String> ) -> OutputConfig {
        OutputConfig {
            buffer_ms: self.buffer_ms,
            device_name: device.or_else( || self.output_device.clone() ),
            ..OutputConfig::default()
        }
    }


    pub fn player_config( &self ) -> PlayerConfig {
        PlayerConfig {
            start_timeout: Duration::from_millis( self.start_timeout_ms ),
            join_timeout: Duration::from_millis( self.join_timeout_ms ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_partial_settings_use_defaults() {
        let settings = Settings::parse( r#"{ "buffer_ms": 300, "output_device": "USB DAC" }"# );
        assert_eq!( settings.buffer_ms, 300 );
        assert_eq!( settings.output_device.as_deref(), Some( "USB DAC" ) );
        assert_eq!( settings.join_timeout_ms, Settings::default().join_timeout_ms );
        assert_eq!( settings.log_level, "warn" );
    }


    #[test]
    fn test_malformed_settings_fall_back() {
        assert_eq!( Settings::parse( "{ not json" ), Settings::default() );
    }


    #[test]
    fn test_device_flag_overrides_settings() {
        let settings = Settings { output_device: Some( "Speakers".into() ), ..Settings::default() };
        assert_eq!( settings.output_config( None ).device_name.as_deref(), Some( "Speakers" ) );
        assert_eq!( settings.output_config( Some( "Headphones".into() ) ).device_name.as_deref(), Some( "Headphones" ) );
    }


    #[test]
    fn test_player_config_from_millis() {
        let settings = Settings { start_timeout_ms: 750, join_timeout_ms: 250, ..Settings::default() };
        let config = settings.player_config();
        assert_eq!( config.start_timeout, Duration::from_millis( 750 ) );
        assert_eq!( config.join_timeout, Duration::from_millis( 250 ) );
    }


    #[test]
    fn test_saved_settings_load_back() {
        let dir = std::env::temp_dir().join( format!( "inkharmony-settings-{}", std::process::id() ) );
        let _ = fs::remove_dir_all( &dir );
        let path = dir.join( "nested" ).join( "settings.json" );

        let settings = Settings {
            output_device: Some( "USB DAC".into() ),
            log_level: "debug".into(),
            ..Settings::default()
        };
        settings.save_to( &path ).unwrap();

        assert_eq!( Settings::load_from( &path ), settings );
        assert_eq!( Settings::load_from( &dir.join( "missing.json" ) ), Settings::default() );

        let _ = fs::remove_dir_all( &dir );
    }
}
