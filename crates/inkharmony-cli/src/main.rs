//! InkHarmony CLI - line-driven MP3 player

mod cli;
mod settings;

use std::io::{ self, BufRead };
use std::path::PathBuf;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::mpsc::{ self, RecvTimeoutError };
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{ Context, Result };
use clap::Parser;

use cli::Args;
use settings::Settings;

use inkharmony_core::{
    command,
    library::{ load_tracks, LibraryScanner },
    Command, CpalBackend, PlaybackState, Player, PlayerError, PlayerEvent, Track,
};


/// Application state.
struct App {
    player: Arc<Player>,
    should_quit: bool,
    /// Set by the song-change callback; the next tick prints the new track
    song_changed: Arc<AtomicBool>,
}


impl App {
    fn new( player: Arc<Player> ) -> Self {
        let song_changed = Arc::new( AtomicBool::new( false ) );
        let flag = Arc::clone( &song_changed );
        player.on_song_change( move || flag.store( true, Ordering::Release ) );

        Self { player, should_quit: false, song_changed }
    }


    /// Drains player events and reports what changed.
    fn tick( &mut self ) {
        for event in self.player.dispatch_events() {
            match event {
                PlayerEvent::Error { message } => eprintln!( "error: {}", message ),
                PlayerEvent::StateChanged { state } => tracing::debug!( "State: {}", state ),
                PlayerEvent::PlaybackStarted { index, start_frame } => {
                    tracing::debug!( "Track {} rendering from frame {}", index + 1, start_frame );
                }
                PlayerEvent::TrackEnded { index } => tracing::debug!( "Track {} ended", index + 1 ),
                PlayerEvent::TrackChanged { .. } => {}
            }
        }

        if self.song_changed.swap( false, Ordering::AcqRel ) {
            if let Some( track ) = self.player.current_track() {
                println!( "Now playing: {}", track_label( self.player.current_index(), &track ) );
            }
        }
    }


    /// Parses and runs one input line.
    fn handle_line( &mut self, line: &str ) {
        if line.trim().is_empty() {
            return;
        }

        match Command::parse( line ) {
            Ok( cmd ) => {
                tracing::debug!( "Command: {} ({:?})", cmd.description(), cmd );
                if let Err( e ) = self.execute( cmd ) {
                    eprintln!( "{}", e );
                }
            }
            Err( e ) => eprintln!( "{} (type 'help' for commands)", e ),
        }
    }


    fn execute( &mut self, cmd: Command ) -> Result<(), PlayerError> {
        match cmd {
            Command::Play => self.player.play(),
            Command::Pause => self.player.pause(),
            Command::Resume => self.player.resume(),
            Command::Stop => self.player.stop(),
            Command::Next => self.player.next(),
            Command::Prev => self.player.previous(),
            Command::Seek { frame } => self.seek( frame ),
            Command::Goto { index } => self.goto( index ),
            Command::List => {
                self.print_list();
                Ok(())
            }
            Command::Status => {
                self.print_status();
                Ok(())
            }
            Command::Help => {
                println!( "{}", command::help_text() );
                Ok(())
            }
            Command::Quit => {
                self.should_quit = true;
                Ok(())
            }
        }
    }


    /// Continues the current track from `frame`.
    fn seek( &self, frame: u64 ) -> Result<(), PlayerError> {
        match self.player.state() {
            PlaybackState::Playing => self.player.pause()?,
            PlaybackState::Paused => {}
            PlaybackState::Stopped => {
                println!( "Nothing to seek in; play a track first" );
                return Ok(());
            }
        }
        self.player.set_current_frame( frame );
        self.player.resume()
    }


    /// Starts the track at `index` from the beginning.
    fn goto( &self, index: usize ) -> Result<(), PlayerError> {
        if self.player.state() != PlaybackState::Stopped {
            self.player.stop()?;
        }
        self.player.set_current_index( index )?;
        self.player.play()
    }


    fn print_list( &self ) {
        let tracks = self.player.tracks();
        if tracks.is_empty() {
            println!( "Playlist is empty" );
            return;
        }

        let current = self.player.current_index();
        for ( i, track ) in tracks.iter().enumerate() {
            let marker = if i == current { ">" } else { " " };
            println!( "{} {}", marker, track_label( i, track ) );
        }
    }


    fn print_status( &self ) {
        let state = self.player.state();
        match self.player.current_track() {
            Some( track ) => println!(
                "{} | {} | frame {} | {} tracks",
                state,
                track_label( self.player.current_index(), &track ),
                self.player.current_frame(),
                self.player.track_count(),
            ),
            None => println!( "{} | no tracks loaded", state ),
        }
    }
}


/// Formats a track as "3. name" using its one-based position.
fn track_label( index: usize, track: &Track ) -> String {
    format!( "{}. {}", index + 1, track.name().unwrap_or( "(untitled)" ) )
}


/// Installs the stderr log subscriber.
fn init_logging( level: &str ) {
    let level = level.parse::<tracing::Level>().unwrap_or_else( |_| {
        eprintln!( "Unknown log level '{}', using warn", level );
        tracing::Level::WARN
    });

    tracing_subscriber::fmt()
        .with_max_level( level )
        .with_writer( io::stderr )
        .with_target( false )
        .init();
}


/// Scans the given files and directories and loads every MP3 found.
fn load_playlist( paths: &[PathBuf] ) -> Result<Vec<Track>> {
    let mut scanner = LibraryScanner::new();
    for path in paths {
        scanner.add_root( path.clone() );
    }

    let files = scanner.scan().context( "Failed to scan for MP3 files" )?;
    Ok( load_tracks( &files ) )
}


/// Forwards stdin lines to the main loop. The channel closes at end of input.
fn spawn_input_reader() -> Result<mpsc::Receiver<String>> {
    let ( tx, rx ) = mpsc::channel();
    thread::Builder::new()
        .name( "inkharmony-input".into() )
        .spawn( move || {
            for line in io::stdin().lock().lines() {
                let Ok( line ) = line else { break };
                if tx.send( line ).is_err() {
                    break;
                }
            }
        })
        .context( "Failed to start input thread" )?;
    Ok( rx )
}


fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load();
    init_logging( args.log_level.as_deref().unwrap_or( &settings.log_level ) );

    if args.save_settings {
        if let Some( device ) = &args.device {
            settings.output_device = Some( device.clone() );
        }
        if let Some( level ) = &args.log_level {
            settings.log_level = level.clone();
        }
        settings.save()?;
    }

    if args.list_devices {
        for name in CpalBackend::device_names() {
            println!( "{}", name );
        }
        return Ok(());
    }

    let tracks = load_playlist( &args.files )?;
    println!( "Loaded {} tracks", tracks.len() );

    let backend = Arc::new( CpalBackend::new( settings.output_config( args.device.clone() ) ) );
    let player = Arc::new( Player::with_playlist( backend, settings.player_config(), tracks )? );
    let mut app = App::new( Arc::clone( &player ) );

    if !args.no_autoplay && player.track_count() > 0 {
        if let Err( e ) = player.play() {
            eprintln!( "{}", e );
        }
    }

    let input = spawn_input_reader()?;

    // Main loop
    loop {
        app.tick();

        match input.recv_timeout( Duration::from_millis( 100 ) ) {
            Ok( line ) => app.handle_line( &line ),
            Err( RecvTimeoutError::Timeout ) => {}
            Err( RecvTimeoutError::Disconnected ) => break,
        }

        if app.should_quit {
            break;
        }
    }

    if player.state() != PlaybackState::Stopped {
        if let Err( e ) = player.stop() {
            tracing::warn!( "Failed to stop cleanly: {}", e );
        }
    }

    Ok(())
}
