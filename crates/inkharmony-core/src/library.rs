//! Track discovery and loading
//!
//! Finds MP3 files on disk and reads them into in-memory [`Track`]s for the
//! playlist.

use std::path::{ Path, PathBuf };

use thiserror::Error;

use crate::playlist::Track;


/// Extension of playable files.
const MP3_EXTENSION: &str = "mp3";


/// Errors that can occur during library operations.
#[derive( Debug, Error )]
pub enum LibraryError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Path not found: {0}" )]
    NotFound( PathBuf ),

    #[error( "Not an MP3 file: {0}" )]
    NotMp3( PathBuf ),

    #[error( "Empty file: {0}" )]
    EmptyFile( PathBuf ),
}


/// Library scanner for discovering MP3 files.
#[derive( Debug, Default )]
pub struct LibraryScanner {
    roots: Vec<PathBuf>,
}


impl LibraryScanner {
    /// Creates a new scanner with no roots.
    pub fn new() -> Self {
        Self::default()
    }


    /// Adds a file or directory to scan. Duplicates are ignored.
    pub fn add_root( &mut self, path: impl Into<PathBuf> ) {
        let path = path.into();
        if !self.roots.contains( &path ) {
            self.roots.push( path );
        }
    }


    /// Scans all roots in order.
    ///
    /// A root that is a file is taken as is if it is an MP3. Directories are
    /// walked recursively and their files sorted by path.
    pub fn scan( &self ) -> Result<Vec<PathBuf>, LibraryError> {
        let mut files = Vec::new();

        for root in &self.roots {
            tracing::info!( "Scanning: {:?}", root );
            if root.is_file() {
                if is_mp3( root ) {
                    files.push( root.clone() );
                } else {
                    tracing::warn!( "Skipping non-MP3 file: {:?}", root );
                }
                continue;
            }

            let mut found = Vec::new();
            scan_recursive( root, &mut found )?;
            found.sort();
            files.extend( found );
        }

        tracing::info!( "Found {} tracks", files.len() );
        Ok( files )
    }
}


fn scan_recursive( dir: &Path, files: &mut Vec<PathBuf> ) -> Result<(), LibraryError> {
    let entries = match std::fs::read_dir( dir ) {
        Ok( e ) => e,
        Err( e ) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!( "Access denied: {:?}", dir );
            return Ok(());
        }
        Err( e ) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err( LibraryError::NotFound( dir.to_path_buf() ) );
        }
        Err( e ) => return Err( LibraryError::Io( e ) ),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_recursive( &path, files )?;
        } else if is_mp3( &path ) {
            files.push( path );
        }
    }

    Ok(())
}


/// Checks the extension, case-insensitively.
fn is_mp3( path: &Path ) -> bool {
    path.extension()
        .and_then( |e| e.to_str() )
        .is_some_and( |e| e.eq_ignore_ascii_case( MP3_EXTENSION ) )
}


/// Reads an MP3 file into memory, named after its file stem.
pub fn load_track( path: &Path ) -> Result<Track, LibraryError> {
    if !is_mp3( path ) {
        return Err( LibraryError::NotMp3( path.to_path_buf() ) );
    }

    let data = std::fs::read( path ).map_err( |e| match e.kind() {
        std::io::ErrorKind::NotFound => LibraryError::NotFound( path.to_path_buf() ),
        _ => LibraryError::Io( e ),
    })?;

    if data.is_empty() {
        return Err( LibraryError::EmptyFile( path.to_path_buf() ) );
    }

    let track = Track::new( data );
    Ok( match path.file_stem().and_then( |s| s.to_str() ) {
        Some( stem ) => track.with_name( stem ),
        None => track,
    })
}


/// Loads every path, skipping the ones that fail with a warning.
pub fn load_tracks( paths: &[PathBuf] ) -> Vec<Track> {
    paths.iter()
        .filter_map( |path| match load_track( path ) {
            Ok( track ) => Some( track ),
            Err( e ) => {
                tracing::warn!( "Skipping {:?}: {}", path, e );
                None
            }
        })
        .collect()
}


#[cfg( test )]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::silent_mp3;


    /// Fresh scratch directory per test.
    fn scratch( name: &str ) -> PathBuf {
        let dir = std::env::temp_dir()
            .join( format!( "inkharmony-library-{}-{}", std::process::id(), name ) );
        let _ = fs::remove_dir_all( &dir );
        fs::create_dir_all( &dir ).unwrap();
        dir
    }


    #[test]
    fn test_scan_finds_sorted_mp3s_recursively() {
        let dir = scratch( "scan" );
        fs::create_dir_all( dir.join( "disc2" ) ).unwrap();
        fs::write( dir.join( "b.mp3" ), silent_mp3( 1 ) ).unwrap();
        fs::write( dir.join( "a.MP3" ), silent_mp3( 1 ) ).unwrap();
        fs::write( dir.join( "notes.txt" ), b"liner notes" ).unwrap();
        fs::write( dir.join( "disc2" ).join( "c.mp3" ), silent_mp3( 1 ) ).unwrap();

        let mut scanner = LibraryScanner::new();
        scanner.add_root( &dir );
        scanner.add_root( &dir );

        let files = scanner.scan().unwrap();
        assert_eq!( files, vec![ dir.join( "a.MP3" ), dir.join( "b.mp3" ), dir.join( "disc2" ).join( "c.mp3" ) ] );

        let _ = fs::remove_dir_all( &dir );
    }


    #[test]
    fn test_scan_keeps_file_roots_in_order() {
        let dir = scratch( "roots" );
        fs::write( dir.join( "z.mp3" ), silent_mp3( 1 ) ).unwrap();
        fs::write( dir.join( "y.mp3" ), silent_mp3( 1 ) ).unwrap();
        fs::write( dir.join( "cover.jpg" ), b"jpeg" ).unwrap();

        let mut scanner = LibraryScanner::new();
        scanner.add_root( dir.join( "z.mp3" ) );
        scanner.add_root( dir.join( "cover.jpg" ) );
        scanner.add_root( dir.join( "y.mp3" ) );

        assert_eq!( scanner.scan().unwrap(), vec![ dir.join( "z.mp3" ), dir.join( "y.mp3" ) ] );

        let _ = fs::remove_dir_all( &dir );
    }


    #[test]
    fn test_scan_missing_root() {
        let mut scanner = LibraryScanner::new();
        scanner.add_root( "/definitely/not/a/music/dir" );
        assert!( matches!( scanner.scan(), Err( LibraryError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_load_track_names_by_stem() {
        let dir = scratch( "load" );
        let path = dir.join( "Opening Theme.mp3" );
        fs::write( &path, silent_mp3( 2 ) ).unwrap();

        let track = load_track( &path ).unwrap();
        assert_eq!( track.name(), Some( "Opening Theme" ) );
        assert_eq!( track.bytes(), silent_mp3( 2 ).as_slice() );

        let _ = fs::remove_dir_all( &dir );
    }


    #[test]
    fn test_load_track_errors() {
        let dir = scratch( "errors" );
        fs::write( dir.join( "empty.mp3" ), b"" ).unwrap();
        fs::write( dir.join( "song.wav" ), b"RIFF" ).unwrap();

        assert!( matches!( load_track( &dir.join( "empty.mp3" ) ), Err( LibraryError::EmptyFile( _ ) ) ) );
        assert!( matches!( load_track( &dir.join( "song.wav" ) ), Err( LibraryError::NotMp3( _ ) ) ) );
        assert!( matches!( load_track( &dir.join( "gone.mp3" ) ), Err( LibraryError::NotFound( _ ) ) ) );

        let tracks = load_tracks( &[ dir.join( "empty.mp3" ), dir.join( "gone.mp3" ) ] );
        assert!( tracks.is_empty() );

        let _ = fs::remove_dir_all( &dir );
    }
}
