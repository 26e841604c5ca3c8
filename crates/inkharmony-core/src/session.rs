//! Resumable playback sessions
//!
//! A session plays one track from a start frame for up to a number of frames
//! and remembers where it stopped, so a later session can pick up at exactly
//! that frame.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use crate::decoder::{ DecoderError, FrameDecoder };
use crate::output::AudioBackend;
use crate::playlist::Track;


/// Frame count meaning "until the end of the stream".
pub const UNBOUNDED: u64 = u64::MAX;


/// Thread-safe request to end a session early.
#[derive( Debug, Clone, Default )]
pub struct CloseHandle( Arc<AtomicBool> );


impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }


    /// Asks the session to stop after the frame in flight.
    pub fn request_close( &self ) {
        self.0.store( true, Ordering::Release );
    }


    pub fn is_close_requested( &self ) -> bool {
        self.0.load( Ordering::Acquire )
    }
}


/// Lifecycle notifications fired by [`PlaybackSession::play_range`].
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SessionEvent {
    /// The device is open and audible decoding is about to begin.
    Started { start_frame: u64 },
    /// Resources are released. Fired once per call, on every exit path.
    Finished { last_frame: u64 },
}


/// Why a session stopped.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SessionOutcome {
    /// The stream ran out of frames.
    EndOfStream,
    /// The requested number of frames was played.
    LimitReached,
    /// A close was requested.
    Closed,
}


impl SessionOutcome {
    /// True when the track played through to its end.
    pub fn is_completed( &self ) -> bool {
        matches!( self, SessionOutcome::EndOfStream )
    }
}


/// One run of the decode loop over a single track.
///
/// A session plays once; the decoder and device are released before
/// `play_range` returns, and later calls report [`SessionOutcome::Closed`].
pub struct PlaybackSession {
    decoder: FrameDecoder,
    backend: Arc<dyn AudioBackend>,
    close: CloseHandle,
    progress: Arc<AtomicU64>,
    listener: Option<Box<dyn FnMut( SessionEvent )>>,
    finished: bool,
}


impl PlaybackSession {
    /// Prepares a session for `track`. The device is opened by `play_range`.
    pub fn new( track: &Track, backend: Arc<dyn AudioBackend> ) -> Result<Self, DecoderError> {
        Ok( Self {
            decoder: FrameDecoder::open( track )?,
            backend,
            close: CloseHandle::new(),
            progress: Arc::new( AtomicU64::new( 0 ) ),
            listener: None,
            finished: false,
        })
    }


    /// Uses an existing close handle, so a close can be requested before the
    /// session exists.
    pub fn with_close_handle( mut self, close: CloseHandle ) -> Self {
        self.close = close;
        self
    }


    /// Publishes the frame counter to `progress` as frames complete.
    pub fn with_progress( mut self, progress: Arc<AtomicU64> ) -> Self {
        self.progress = progress;
        self
    }


    /// Registers the lifecycle listener.
    pub fn on_event( &mut self, listener: impl FnMut( SessionEvent ) + 'static ) {
        self.listener = Some( Box::new( listener ) );
    }


    pub fn close_handle( &self ) -> CloseHandle {
        self.close.clone()
    }


    /// Requests early termination. Callable from any thread via [`close_handle`](Self::close_handle).
    pub fn request_close( &self ) {
        self.close.request_close();
    }


    /// Frame counter after the session stopped; the next resume point.
    pub fn last_completed_frame( &self ) -> u64 {
        self.decoder.frame_index()
    }


    /// Skips `start_frame` frames, then plays up to `frame_count` frames.
    ///
    /// The device is flushed and closed and `Finished` is fired before this
    /// returns, whether it succeeds or fails.
    pub fn play_range( &mut self, start_frame: u64, frame_count: u64 ) -> Result<SessionOutcome, DecoderError> {
        let result = if self.finished {
            Ok( SessionOutcome::Closed )
        } else {
            self.run( start_frame, frame_count )
        };

        self.finished = true;
        self.decoder.close();

        let last_frame = self.decoder.frame_index();
        self.progress.store( last_frame, Ordering::Release );

        match result {
            Ok( outcome ) => tracing::debug!( "Session ended at frame {}: {:?}", last_frame, outcome ),
            Err( ref e ) => tracing::warn!( "Session failed at frame {}: {}", last_frame, e ),
        }

        self.emit( SessionEvent::Finished { last_frame } );
        result
    }


    fn run( &mut self, start_frame: u64, frame_count: u64 ) -> Result<SessionOutcome, DecoderError> {
        while self.decoder.frame_index() < start_frame {
            if self.close.is_close_requested() {
                return Ok( SessionOutcome::Closed );
            }
            if !self.decoder.skip_next_frame()? {
                return Ok( SessionOutcome::EndOfStream );
            }
            self.progress.store( self.decoder.frame_index(), Ordering::Release );
        }

        self.decoder.open_device( self.backend.as_ref() )?;
        self.emit( SessionEvent::Started { start_frame: self.decoder.frame_index() } );

        let mut played = 0;
        while played < frame_count {
            if self.close.is_close_requested() {
                return Ok( SessionOutcome::Closed );
            }
            if !self.decoder.decode_next_frame()? {
                return Ok( SessionOutcome::EndOfStream );
            }
            played += 1;
            self.progress.store( self.decoder.frame_index(), Ordering::Release );
        }

        Ok( SessionOutcome::LimitReached )
    }


    fn emit( &mut self, event: SessionEvent ) {
        if let Some( listener ) = self.listener.as_mut() {
            listener( event );
        }
    }
}


#[cfg( test )]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{ silent_track, wait_until, MockBackend };


    fn session( frames: usize, backend: &MockBackend ) -> PlaybackSession {
        PlaybackSession::new( &silent_track( "t", frames ), Arc::new( backend.clone() ) ).unwrap()
    }


    fn recorded( session: &mut PlaybackSession ) -> Rc<RefCell<Vec<SessionEvent>>> {
        let events = Rc::new( RefCell::new( Vec::new() ) );
        let sink = Rc::clone( &events );
        session.on_event( move |e| sink.borrow_mut().push( e ) );
        events
    }


    #[test]
    fn test_plays_whole_track() {
        let backend = MockBackend::new();
        let mut session = session( 10, &backend );
        let events = recorded( &mut session );

        let outcome = session.play_range( 0, UNBOUNDED ).unwrap();

        assert_eq!( outcome, SessionOutcome::EndOfStream );
        assert!( outcome.is_completed() );
        assert_eq!( session.last_completed_frame(), 10 );
        assert_eq!( backend.frames_written(), vec![ 10 ] );
        assert_eq!( *events.borrow(), vec![
            SessionEvent::Started { start_frame: 0 },
            SessionEvent::Finished { last_frame: 10 },
        ]);
        assert!( !backend.is_open() );
    }


    #[test]
    fn test_split_ranges_cover_track_exactly_once() {
        let backend = MockBackend::new();

        let mut first = session( 10, &backend );
        assert_eq!( first.play_range( 0, 4 ).unwrap(), SessionOutcome::LimitReached );
        assert_eq!( first.last_completed_frame(), 4 );

        let mut second = session( 10, &backend );
        let events = recorded( &mut second );
        assert_eq!( second.play_range( 4, UNBOUNDED ).unwrap(), SessionOutcome::EndOfStream );
        assert_eq!( second.last_completed_frame(), 10 );

        assert_eq!( backend.frames_written(), vec![ 4, 6 ] );
        assert_eq!( events.borrow()[ 0 ], SessionEvent::Started { start_frame: 4 } );
        assert_eq!( backend.closes(), 2 );
    }


    #[test]
    fn test_start_past_end_never_opens_device() {
        let backend = MockBackend::new();
        let mut session = session( 3, &backend );
        let events = recorded( &mut session );

        assert_eq!( session.play_range( 7, UNBOUNDED ).unwrap(), SessionOutcome::EndOfStream );
        assert_eq!( session.last_completed_frame(), 3 );
        assert_eq!( backend.opens(), 0 );
        assert_eq!( *events.borrow(), vec![ SessionEvent::Finished { last_frame: 3 } ] );
    }


    #[test]
    fn test_close_requested_before_start() {
        let backend = MockBackend::new();
        let mut session = session( 5, &backend );
        session.request_close();

        assert_eq!( session.play_range( 0, UNBOUNDED ).unwrap(), SessionOutcome::Closed );
        assert_eq!( session.last_completed_frame(), 0 );
        assert_eq!( backend.frames_written(), vec![ 0 ] );
        assert_eq!( backend.opens(), backend.closes() );
    }


    #[test]
    fn test_close_from_other_thread() {
        let backend = MockBackend::with_write_delay( Duration::from_millis( 2 ) );
        let mut session = session( 1000, &backend );
        let close = session.close_handle();

        let watcher = {
            let backend = backend.clone();
            thread::spawn( move || {
                wait_until( Duration::from_secs( 5 ), || {
                    backend.frames_written().first().copied().unwrap_or( 0 ) >= 3
                });
                close.request_close();
            })
        };

        let outcome = session.play_range( 0, UNBOUNDED ).unwrap();
        watcher.join().unwrap();

        assert_eq!( outcome, SessionOutcome::Closed );
        let last = session.last_completed_frame();
        assert!( last >= 3 && last < 1000 );
        assert_eq!( backend.frames_written(), vec![ last as usize ] );
        assert!( !backend.is_open() );
        assert_eq!( backend.flushes(), 1 );
    }


    #[test]
    fn test_device_failure_still_finishes() {
        let backend = MockBackend::failing();
        let mut session = session( 5, &backend );
        let events = recorded( &mut session );

        let result = session.play_range( 2, UNBOUNDED );

        assert!( matches!( result, Err( DecoderError::DeviceUnavailable( _ ) ) ) );
        assert_eq!( *events.borrow(), vec![ SessionEvent::Finished { last_frame: 2 } ] );
    }


    #[test]
    fn test_session_plays_once() {
        let backend = MockBackend::new();
        let mut session = session( 4, &backend );

        session.play_range( 0, 2 ).unwrap();
        assert_eq!( session.play_range( 2, UNBOUNDED ).unwrap(), SessionOutcome::Closed );
        assert_eq!( backend.opens(), 1 );
    }


    #[test]
    fn test_progress_mirrors_frame_counter() {
        let backend = MockBackend::new();
        let progress = Arc::new( AtomicU64::new( 99 ) );
        let mut session = session( 6, &backend ).with_progress( Arc::clone( &progress ) );

        session.play_range( 1, 3 ).unwrap();
        assert_eq!( progress.load( Ordering::Acquire ), 4 );
    }
}
