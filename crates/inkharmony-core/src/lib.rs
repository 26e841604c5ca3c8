//! InkHarmony Core - MP3 playback engine
//!
//! This crate provides frame-accurate MP3 playback: decoding, resumable
//! playback sessions, a circular playlist, the player state machine, and
//! audio output.

use std::sync::{ Mutex, MutexGuard, PoisonError };

pub mod command;
pub mod decoder;
pub mod library;
pub mod output;
pub mod player;
pub mod playlist;
pub mod session;
pub mod state;

#[cfg( test )]
mod test_support;

pub use command::{ Command, CommandError };
pub use decoder::{ DecoderError, FrameDecoder };
pub use library::{ load_track, load_tracks, LibraryError, LibraryScanner };
pub use output::{ AudioBackend, AudioDevice, CpalBackend, OutputConfig, OutputError, StreamSpec };
pub use player::{ FrameCursor, Player, PlayerConfig, PlayerError, PlayerEvent };
pub use playlist::{ Playlist, PlaylistError, Track };
pub use session::{ CloseHandle, PlaybackSession, SessionEvent, SessionOutcome };
pub use state::{ IllegalTransition, Operation, PlaybackState };


/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else( PoisonError::into_inner )
}
