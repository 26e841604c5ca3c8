//! Playlist position tracking
//!
//! Holds the ordered track buffers and the index of the track being played.
//! Navigation is circular in both directions.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;


/// Errors that can occur with playlist operations.
#[derive( Debug, Clone, PartialEq, Eq, Error )]
pub enum PlaylistError {
    #[error( "Playlist is empty" )]
    EmptyPlaylist,

    #[error( "Track index {index} out of range for {len} tracks" )]
    IndexOutOfRange { index: usize, len: usize },
}


/// One compressed-audio file held in memory.
///
/// Cloning is cheap; the bytes are shared and never mutated.
#[derive( Clone, PartialEq, Eq )]
pub struct Track {
    data: Arc<[u8]>,
    name: Option<String>,
}


impl Track {
    /// Wraps raw file contents.
    pub fn new( data: impl Into<Arc<[u8]>> ) -> Self {
        Self { data: data.into(), name: None }
    }


    /// Attaches a display name.
    pub fn with_name( mut self, name: impl Into<String> ) -> Self {
        self.name = Some( name.into() );
        self
    }


    /// Returns the encoded bytes.
    pub fn bytes( &self ) -> &[u8] {
        &self.data
    }


    /// Returns a shared handle to the encoded bytes.
    pub fn data( &self ) -> Arc<[u8]> {
        Arc::clone( &self.data )
    }


    pub fn name( &self ) -> Option<&str> {
        self.name.as_deref()
    }


    pub fn len( &self ) -> usize {
        self.data.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.data.is_empty()
    }
}


impl fmt::Debug for Track {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "Track" )
            .field( "name", &self.name )
            .field( "bytes", &self.data.len() )
            .finish()
    }
}


/// Ordered tracks plus the current position.
///
/// `current_index` is always in bounds while the list is non-empty.
#[derive( Debug, Default, Clone )]
pub struct Playlist {
    tracks: Vec<Track>,
    current_index: usize,
}


impl Playlist {
    /// Creates a new empty playlist.
    pub fn new() -> Self {
        Self::default()
    }


    /// Creates a playlist positioned on its first track.
    pub fn with_tracks( tracks: Vec<Track> ) -> Self {
        Self { tracks, current_index: 0 }
    }


    /// Gets the current track.
    pub fn current( &self ) -> Result<&Track, PlaylistError> {
        self.tracks.get( self.current_index ).ok_or( PlaylistError::EmptyPlaylist )
    }


    /// Moves to the next track, wrapping to the first. No-op when empty.
    pub fn advance( &mut self ) {
        if !self.tracks.is_empty() {
            self.current_index = ( self.current_index + 1 ) % self.tracks.len();
        }
    }


    /// Moves to the previous track, wrapping to the last. No-op when empty.
    pub fn retreat( &mut self ) {
        let len = self.tracks.len();
        if len > 0 {
            self.current_index = ( self.current_index + len - 1 ) % len;
        }
    }


    /// Returns to the first track.
    pub fn reset( &mut self ) {
        self.current_index = 0;
    }


    /// Swaps in a new track list and returns to its first track.
    pub fn replace( &mut self, tracks: Vec<Track> ) {
        self.tracks = tracks;
        self.reset();
    }


    /// Jumps to a specific track by index.
    pub fn jump_to( &mut self, index: usize ) -> Result<&Track, PlaylistError> {
        if index >= self.tracks.len() {
            return Err( PlaylistError::IndexOutOfRange { index, len: self.tracks.len() } );
        }
        self.current_index = index;
        self.current()
    }


    /// Gets all tracks in the playlist.
    pub fn tracks( &self ) -> &[Track] {
        &self.tracks
    }


    /// Gets the number of tracks.
    pub fn len( &self ) -> usize {
        self.tracks.len()
    }


    /// Returns true if the playlist is empty.
    pub fn is_empty( &self ) -> bool {
        self.tracks.is_empty()
    }


    /// Gets the current track index.
    pub fn current_index( &self ) -> usize {
        self.current_index
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn tracks( names: &[&str] ) -> Vec<Track> {
        names.iter()
            .map( |n| Track::new( n.as_bytes().to_vec() ).with_name( *n ) )
            .collect()
    }


    #[test]
    fn test_advance_is_circular() {
        for len in 1..6 {
            let names: Vec<String> = ( 0..len ).map( |i| format!( "t{}", i ) ).collect();
            let refs: Vec<&str> = names.iter().map( String::as_str ).collect();

            let mut playlist = Playlist::with_tracks( tracks( &refs ) );
            playlist.advance();
            let start = playlist.current_index();

            for _ in 0..len {
                playlist.advance();
            }
            assert_eq!( playlist.current_index(), start, "len {}", len );
        }
    }


    #[test]
    fn test_retreat_wraps_to_last() {
        let mut playlist = Playlist::with_tracks( tracks( &[ "a", "b", "c" ] ) );
        playlist.retreat();
        assert_eq!( playlist.current_index(), 2 );
        assert_eq!( playlist.current().unwrap().name(), Some( "c" ) );

        playlist.advance();
        assert_eq!( playlist.current_index(), 0 );
    }


    #[test]
    fn test_replace_resets_index() {
        let mut playlist = Playlist::with_tracks( tracks( &[ "a", "b", "c" ] ) );
        playlist.advance();
        playlist.advance();
        assert_eq!( playlist.current_index(), 2 );

        playlist.replace( tracks( &[ "x", "y" ] ) );
        assert_eq!( playlist.current_index(), 0 );
        assert_eq!( playlist.current().unwrap().name(), Some( "x" ) );
    }


    #[test]
    fn test_empty_playlist_navigation_is_noop() {
        let mut playlist = Playlist::new();
        playlist.advance();
        playlist.retreat();
        assert_eq!( playlist.current_index(), 0 );
        assert_eq!( playlist.current().unwrap_err(), PlaylistError::EmptyPlaylist );

        let mut playlist = Playlist::with_tracks( tracks( &[ "a" ] ) );
        playlist.replace( Vec::new() );
        assert!( playlist.is_empty() );
        assert!( playlist.current().is_err() );
    }


    #[test]
    fn test_jump_to() {
        let mut playlist = Playlist::with_tracks( tracks( &[ "a", "b" ] ) );
        assert_eq!( playlist.jump_to( 1 ).unwrap().name(), Some( "b" ) );
        assert_eq!(
            playlist.jump_to( 2 ).unwrap_err(),
            PlaylistError::IndexOutOfRange { index: 2, len: 2 }
        );
        assert_eq!( playlist.current_index(), 1 );
    }


    #[test]
    fn test_track_debug_hides_bytes() {
        let track = Track::new( vec![ 0u8; 10 ] ).with_name( "song" );
        let debug = format!( "{:?}", track );
        assert!( debug.contains( "song" ) );
        assert!( debug.contains( "10" ) );
    }
}
