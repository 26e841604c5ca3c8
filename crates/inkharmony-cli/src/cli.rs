//! Command-line argument parsing for InkHarmony.

use std::path::PathBuf;

use clap::Parser;


/// InkHarmony - frame-accurate MP3 player.
#[derive( Parser, Debug )]
#[command( name = "inkharmony" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Output device name (see --list-devices).
    #[arg( short, long )]
    pub device: Option<String>,

    /// Log level: error, warn, info, debug or trace.
    #[arg( short, long )]
    pub log_level: Option<String>,

    /// Load the playlist without starting playback.
    #[arg( long )]
    pub no_autoplay: bool,

    /// Store --device and --log-level as the new defaults.
    #[arg( long )]
    pub save_settings: bool,

    /// Print the available output devices and exit.
    #[arg( long )]
    pub list_devices: bool,

    /// MP3 files or directories to queue.
    #[arg( trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}
