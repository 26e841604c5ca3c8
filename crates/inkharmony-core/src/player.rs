//! Core player implementation
//!
//! The Player is the single playback surface shared by all front-end
//! collaborators. Operations run through the transition table in
//! [`crate::state`]; audio is produced by one long-lived worker thread that
//! plays [`PlaybackSession`]s back to back and advances the playlist when a
//! track runs out.
//!
//! Create one Player at startup and hand out `Arc<Player>`. All operations
//! take `&self` and are serialized internally, so calling them from several
//! threads is safe, but `play`/`pause`/`stop` and friends block briefly
//! while the worker opens or releases the audio device.

use std::sync::{ Arc, Mutex };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::mpsc::{ self, Receiver, RecvTimeoutError, Sender };
use std::thread::{ self, JoinHandle };
use std::time::{ Duration, Instant };

use thiserror::Error;

use crate::decoder::DecoderError;
use crate::lock;
use crate::output::AudioBackend;
use crate::playlist::{ Playlist, PlaylistError, Track };
use crate::session::{ CloseHandle, PlaybackSession, SessionEvent, SessionOutcome, UNBOUNDED };
use crate::state::{ self, Action, IllegalTransition, Operation, PlaybackState };


/// Errors that can occur during playback.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "Audio device unavailable: {0}" )]
    DeviceUnavailable( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Illegal transition: {0}" )]
    IllegalTransition( #[from] IllegalTransition ),

    #[error( "No tracks loaded" )]
    EmptyPlaylist,

    #[error( "Track index {index} out of range for {len} tracks" )]
    IndexOutOfRange { index: usize, len: usize },

    #[error( "Playback worker did not respond within {0:?}" )]
    WorkerTimeout( Duration ),

    #[error( "Playback worker is not running" )]
    WorkerGone,

    #[error( "Failed to start playback worker: {0}" )]
    Spawn( #[from] std::io::Error ),
}


impl From<DecoderError> for PlayerError {
    fn from( err: DecoderError ) -> Self {
        match err {
            DecoderError::DeviceUnavailable( e ) => PlayerError::DeviceUnavailable( e.to_string() ),
            other => PlayerError::Decode( other.to_string() ),
        }
    }
}


impl From<PlaylistError> for PlayerError {
    fn from( err: PlaylistError ) -> Self {
        match err {
            PlaylistError::EmptyPlaylist => PlayerError::EmptyPlaylist,
            PlaylistError::IndexOutOfRange { index, len } => PlayerError::IndexOutOfRange { index, len },
        }
    }
}


/// Events emitted by the player for UI updates.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum PlayerEvent {
    /// A track started from its beginning and its device is open (play, next,
    /// previous or auto-advance).
    TrackChanged { index: usize },
    /// A session opened its device and began rendering at `start_frame`.
    PlaybackStarted { index: usize, start_frame: u64 },
    StateChanged { state: PlaybackState },
    /// The track at `index` played through to its end.
    TrackEnded { index: usize },
    Error { message: String },
}


/// Player timing configuration.
#[derive( Debug, Clone )]
pub struct PlayerConfig {
    /// How long a start waits for the worker to open the device
    pub start_timeout: Duration,
    /// How long a pause or stop waits for the worker to release the device
    pub join_timeout: Duration,
}


impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs( 5 ),
            join_timeout: Duration::from_secs( 2 ),
        }
    }
}


/// Position within the current track, in frames.
#[derive( Debug, Clone, Copy, Default, PartialEq, Eq )]
pub struct FrameCursor {
    pub current_frame: u64,
    /// Where the next `resume` starts
    pub resume_frame: u64,
}


impl FrameCursor {
    fn at( frame: u64 ) -> Self {
        Self { current_frame: frame, resume_frame: frame }
    }
}


/// Handles for the session the worker is running.
struct ActiveSession {
    generation: u64,
    close: CloseHandle,
    progress: Arc<AtomicU64>,
}


/// State shared between the facade and the worker's completion path.
#[derive( Default )]
struct Context {
    state: PlaybackState,
    playlist: Playlist,
    cursor: FrameCursor,
    active: Option<ActiveSession>,
    /// Generation of the only job allowed to complete; bumped to supersede it
    generation: u64,
}


/// A request to play one track.
struct Job {
    generation: u64,
    index: usize,
    track: Track,
    start_frame: u64,
    /// Emit `TrackChanged` once the device is open
    announce: bool,
    close: CloseHandle,
    progress: Arc<AtomicU64>,
}


impl Job {
    fn new( generation: u64, index: usize, track: Track, start_frame: u64, announce: bool ) -> Self {
        Self {
            generation,
            index,
            track,
            start_frame,
            announce,
            close: CloseHandle::new(),
            progress: Arc::new( AtomicU64::new( start_frame ) ),
        }
    }


    fn handle( &self ) -> ActiveSession {
        ActiveSession {
            generation: self.generation,
            close: self.close.clone(),
            progress: Arc::clone( &self.progress ),
        }
    }
}


enum WorkerCommand {
    Start( Job ),
    Shutdown,
}


/// Worker replies, tagged with the job generation they belong to.
enum WorkerReport {
    Started { generation: u64 },
    Failed { generation: u64, error: DecoderError },
    /// The chain ended and the device is released.
    Idle { generation: u64, last_frame: u64 },
}


struct Control {
    commands: Sender<WorkerCommand>,
    reports: Receiver<WorkerReport>,
    worker: Option<JoinHandle<()>>,
}


type SongChangeCallback = Box<dyn FnMut() + Send>;


/// Core audio player.
pub struct Player {
    context: Arc<Mutex<Context>>,
    /// Held for the duration of every operation
    control: Mutex<Control>,
    events: Mutex<Receiver<PlayerEvent>>,
    event_tx: Sender<PlayerEvent>,
    song_change: Mutex<Option<SongChangeCallback>>,
    config: PlayerConfig,
}


impl Player {
    /// Creates a player with an empty playlist and starts its worker thread.
    pub fn new( backend: Arc<dyn AudioBackend>, config: PlayerConfig ) -> Result<Self, PlayerError> {
        let context = Arc::new( Mutex::new( Context::default() ) );
        let ( command_tx, command_rx ) = mpsc::channel();
        let ( report_tx, report_rx ) = mpsc::channel();
        let ( event_tx, event_rx ) = mpsc::channel();

        let worker = Worker {
            context: Arc::clone( &context ),
            backend,
            reports: report_tx,
            events: event_tx.clone(),
        };

        let handle = thread::Builder::new()
            .name( "inkharmony-playback".into() )
            .spawn( move || worker.run( command_rx ) )?;

        Ok( Self {
            context,
            control: Mutex::new( Control {
                commands: command_tx,
                reports: report_rx,
                worker: Some( handle ),
            }),
            events: Mutex::new( event_rx ),
            event_tx,
            song_change: Mutex::new( None ),
            config,
        })
    }


    /// Creates a player positioned on the first of `tracks`.
    pub fn with_playlist(
        backend: Arc<dyn AudioBackend>,
        config: PlayerConfig,
        tracks: Vec<Track>,
    ) -> Result<Self, PlayerError> {
        let player = Self::new( backend, config )?;
        lock( &player.context ).playlist.replace( tracks );
        Ok( player )
    }


    /// Starts the current track from its first frame.
    pub fn play( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Play )
    }


    /// Stops the session and remembers where it stopped.
    pub fn pause( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Pause )
    }


    /// Continues the current track from the saved frame.
    pub fn resume( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Resume )
    }


    pub fn stop( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Stop )
    }


    /// Plays the next track, wrapping to the first.
    pub fn next( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Next )
    }


    /// Plays the previous track, wrapping to the last.
    pub fn previous( &self ) -> Result<(), PlayerError> {
        self.apply( Operation::Previous )
    }


    /// Stops playback and swaps in a new track list.
    pub fn change_playlist( &self, tracks: Vec<Track> ) -> Result<(), PlayerError> {
        let control = lock( &self.control );
        let closed = self.close_session( &control );

        {
            let mut ctx = lock( &self.context );
            ctx.playlist.replace( tracks );
            ctx.cursor = FrameCursor::default();
            tracing::info!( "Playlist changed: {} tracks", ctx.playlist.len() );
        }
        self.set_state( PlaybackState::Stopped );

        closed.map( |_| () )
    }


    /// Gets the current playback state.
    pub fn state( &self ) -> PlaybackState {
        lock( &self.context ).state
    }


    pub fn is_playing( &self ) -> bool {
        self.state() == PlaybackState::Playing
    }


    pub fn is_paused( &self ) -> bool {
        self.state() == PlaybackState::Paused
    }


    /// Gets the frame position: live while playing, the snapshot otherwise.
    pub fn current_frame( &self ) -> u64 {
        let ctx = lock( &self.context );
        match ( ctx.state, ctx.active.as_ref() ) {
            ( PlaybackState::Playing, Some( active ) ) => active.progress.load( Ordering::Acquire ),
            _ => ctx.cursor.current_frame,
        }
    }


    /// Sets the frame the next `resume` starts from.
    ///
    /// Seeking is `set_current_frame` followed by `resume`. Pause first: a
    /// running session is not affected.
    pub fn set_current_frame( &self, frame: u64 ) {
        lock( &self.context ).cursor = FrameCursor::at( frame );
    }


    /// Gets the frame cursor snapshot.
    pub fn cursor( &self ) -> FrameCursor {
        lock( &self.context ).cursor
    }


    pub fn current_index( &self ) -> usize {
        lock( &self.context ).playlist.current_index()
    }


    /// Moves the playlist position without starting playback.
    ///
    /// Pause or stop first: a running session keeps playing its track.
    pub fn set_current_index( &self, index: usize ) -> Result<(), PlayerError> {
        lock( &self.context ).playlist.jump_to( index )?;
        Ok(())
    }


    pub fn track_count( &self ) -> usize {
        lock( &self.context ).playlist.len()
    }


    /// Gets the track at the current position.
    pub fn current_track( &self ) -> Option<Track> {
        lock( &self.context ).playlist.current().ok().cloned()
    }


    /// Gets all tracks in the playlist.
    pub fn tracks( &self ) -> Vec<Track> {
        lock( &self.context ).playlist.tracks().to_vec()
    }


    /// Registers the callback run by [`dispatch_events`](Self::dispatch_events)
    /// whenever a new track starts.
    pub fn on_song_change( &self, callback: impl FnMut() + Send + 'static ) {
        *lock( &self.song_change ) = Some( Box::new( callback ) );
    }


    /// Drains pending events on the calling thread.
    ///
    /// The song-change callback runs here, once per `TrackChanged`, so UI
    /// code never runs on the decode thread.
    pub fn dispatch_events( &self ) -> Vec<PlayerEvent> {
        let events: Vec<PlayerEvent> = lock( &self.events ).try_iter().collect();

        let changes = events.iter()
            .filter( |e| matches!( e, PlayerEvent::TrackChanged { .. } ) )
            .count();

        if changes > 0 {
            if let Some( callback ) = lock( &self.song_change ).as_mut() {
                for _ in 0..changes {
                    callback();
                }
            }
        }

        events
    }


    /// Runs `operation` through the transition table.
    fn apply( &self, operation: Operation ) -> Result<(), PlayerError> {
        let control = lock( &self.control );
        let ( current, empty ) = {
            let ctx = lock( &self.context );
            ( ctx.state, ctx.playlist.is_empty() )
        };

        let transition = match state::transition( current, operation ) {
            Ok( t ) => t,
            Err( e ) => {
                tracing::warn!( "Ignored: {}", e );
                return Err( e.into() );
            }
        };

        if transition.starts_session() && empty {
            tracing::warn!( "Ignored {}: no tracks loaded", operation );
            return Err( PlayerError::EmptyPlaylist );
        }

        if transition.is_noop() {
            return Ok(());
        }

        tracing::info!( "{}: {} → {}", operation, current, transition.next );

        let mut last_frame = None;
        let mut timeout = None;

        for action in transition.actions {
            match action {
                Action::CloseSession => match self.close_session( &control ) {
                    Ok( frame ) => last_frame = frame,
                    Err( e ) => timeout = Some( e ),
                },
                Action::SnapshotFrame => {
                    if let Some( frame ) = last_frame {
                        lock( &self.context ).cursor = FrameCursor::at( frame );
                    }
                }
                Action::Advance => lock( &self.context ).playlist.advance(),
                Action::Retreat => lock( &self.context ).playlist.retreat(),
                Action::StartFromBeginning => self.start( &control, false )?,
                Action::StartFromResumeFrame => self.start( &control, true )?,
            }
        }

        if !transition.starts_session() {
            self.set_state( transition.next );
        }

        timeout.map_or( Ok(()), Err )
    }


    /// Hands the current track to the worker and waits for its device to open.
    fn start( &self, control: &Control, from_resume: bool ) -> Result<(), PlayerError> {
        let job = {
            let mut ctx = lock( &self.context );
            let track = ctx.playlist.current()?.clone();

            let start_frame = if from_resume {
                ctx.cursor.resume_frame
            } else {
                ctx.cursor = FrameCursor::default();
                0
            };

            ctx.generation += 1;
            let job = Job::new( ctx.generation, ctx.playlist.current_index(), track, start_frame, !from_resume );
            ctx.active = Some( job.handle() );
            job
        };

        let generation = job.generation;
        let index = job.index;
        tracing::debug!( "Starting track {} at frame {} (generation {})", index, job.start_frame, generation );

        self.set_state( PlaybackState::Playing );

        if control.commands.send( WorkerCommand::Start( job ) ).is_err() {
            lock( &self.context ).active = None;
            self.set_state( PlaybackState::Stopped );
            return Err( PlayerError::WorkerGone );
        }

        let started = self.wait_for( control, self.config.start_timeout, |report| match report {
            WorkerReport::Started { generation: g } | WorkerReport::Idle { generation: g, .. }
                if g >= generation => Some( Ok(()) ),
            WorkerReport::Failed { generation: g, error } if g >= generation => Some( Err( error ) ),
            _ => None,
        });

        match started {
            Ok( Ok(()) ) => Ok(()),
            Ok( Err( error ) ) => {
                tracing::error!( "Failed to start track {}: {}", index, error );
                Err( error.into() )
            }
            Err( e ) => {
                tracing::warn!( "Track {} has not started yet: {}", index, e );
                Err( e )
            }
        }
    }


    /// Asks the running session to stop and waits for its device to close.
    ///
    /// Returns the session's last completed frame, or `None` if nothing was
    /// running. On timeout the live progress is recorded instead.
    fn close_session( &self, control: &Control ) -> Result<Option<u64>, PlayerError> {
        let active = {
            let mut ctx = lock( &self.context );
            let Some( active ) = ctx.active.take() else {
                return Ok( None );
            };
            ctx.generation += 1;
            active
        };

        active.close.request_close();

        let closed = self.wait_for( control, self.config.join_timeout, |report| match report {
            WorkerReport::Idle { generation, last_frame } if generation >= active.generation => Some( last_frame ),
            _ => None,
        });

        match closed {
            Ok( frame ) => Ok( Some( frame ) ),
            Err( e ) => {
                let frame = active.progress.load( Ordering::Acquire );
                tracing::warn!( "Session still closing ({}), recording frame {}", e, frame );
                lock( &self.context ).cursor = FrameCursor::at( frame );
                Err( e )
            }
        }
    }


    /// Receives reports until `accept` returns a value or `timeout` passes.
    fn wait_for<T>(
        &self,
        control: &Control,
        timeout: Duration,
        mut accept: impl FnMut( WorkerReport ) -> Option<T>,
    ) -> Result<T, PlayerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since( Instant::now() );
            match control.reports.recv_timeout( remaining ) {
                Ok( report ) => {
                    if let Some( value ) = accept( report ) {
                        return Ok( value );
                    }
                }
                Err( RecvTimeoutError::Timeout ) => return Err( PlayerError::WorkerTimeout( timeout ) ),
                Err( RecvTimeoutError::Disconnected ) => return Err( PlayerError::WorkerGone ),
            }
        }
    }


    fn set_state( &self, state: PlaybackState ) {
        let changed = {
            let mut ctx = lock( &self.context );
            let changed = ctx.state != state;
            ctx.state = state;
            changed
        };
        if changed {
            let _ = self.event_tx.send( PlayerEvent::StateChanged { state } );
        }
    }
}


impl Drop for Player {
    fn drop( &mut self ) {
        let mut control = lock( &self.control );
        let closed = self.close_session( &control );
        let _ = control.commands.send( WorkerCommand::Shutdown );

        if let Some( worker ) = control.worker.take() {
            match closed {
                Ok( _ ) => {
                    if worker.join().is_err() {
                        tracing::error!( "Playback worker panicked" );
                    }
                }
                // Joining a stuck worker would hang; let it finish on its own
                Err( e ) => tracing::warn!( "Detaching playback worker: {}", e ),
            }
        }
    }
}


/// The playback thread: runs jobs and their auto-advance chains.
struct Worker {
    context: Arc<Mutex<Context>>,
    backend: Arc<dyn AudioBackend>,
    reports: Sender<WorkerReport>,
    events: Sender<PlayerEvent>,
}


impl Worker {
    fn run( self, commands: Receiver<WorkerCommand> ) {
        while let Ok( WorkerCommand::Start( job ) ) = commands.recv() {
            self.play_chain( job );
        }
        tracing::debug!( "Playback worker exiting" );
    }


    /// Plays `job`, then whatever the playlist advances to, until superseded,
    /// closed, or failed.
    fn play_chain( &self, mut job: Job ) {
        loop {
            let ( result, last_frame ) = self.play_one( &job );
            let next = self.complete( &job, &result, last_frame );

            if let Err( error ) = result {
                let _ = self.reports.send( WorkerReport::Failed { generation: job.generation, error } );
            }

            match next {
                Some( next ) => job = next,
                None => {
                    let _ = self.reports.send( WorkerReport::Idle { generation: job.generation, last_frame } );
                    return;
                }
            }
        }
    }


    fn play_one( &self, job: &Job ) -> ( Result<SessionOutcome, DecoderError>, u64 ) {
        let session = PlaybackSession::new( &job.track, Arc::clone( &self.backend ) );
        let mut session = match session {
            Ok( s ) => s
                .with_close_handle( job.close.clone() )
                .with_progress( Arc::clone( &job.progress ) ),
            Err( e ) => return ( Err( e ), job.start_frame ),
        };

        let reports = self.reports.clone();
        let events = self.events.clone();
        let generation = job.generation;
        let index = job.index;
        let announce = job.announce;

        session.on_event( move |event| {
            if let SessionEvent::Started { start_frame } = event {
                if announce {
                    let _ = events.send( PlayerEvent::TrackChanged { index } );
                }
                let _ = events.send( PlayerEvent::PlaybackStarted { index, start_frame } );
                let _ = reports.send( WorkerReport::Started { generation } );
            }
        });

        let result = session.play_range( job.start_frame, UNBOUNDED );
        ( result, session.last_completed_frame() )
    }


    /// Completion path: decides what follows a finished session.
    ///
    /// Only the current generation may touch shared state; a superseded job
    /// leaves the transition to the facade.
    fn complete(
        &self,
        job: &Job,
        result: &Result<SessionOutcome, DecoderError>,
        last_frame: u64,
    ) -> Option<Job> {
        let mut ctx = lock( &self.context );
        if ctx.generation != job.generation {
            return None;
        }

        let stop = |ctx: &mut Context| {
            ctx.cursor = FrameCursor::at( last_frame );
            ctx.active = None;
            if ctx.state != PlaybackState::Stopped {
                ctx.state = PlaybackState::Stopped;
                let _ = self.events.send( PlayerEvent::StateChanged { state: PlaybackState::Stopped } );
            }
        };

        match result {
            Ok( outcome ) if outcome.is_completed() => {
                let _ = self.events.send( PlayerEvent::TrackEnded { index: job.index } );
                ctx.playlist.advance();
                ctx.cursor = FrameCursor::default();

                let Ok( track ) = ctx.playlist.current().cloned() else {
                    stop( &mut *ctx );
                    return None;
                };

                ctx.generation += 1;
                let next = Job::new( ctx.generation, ctx.playlist.current_index(), track, 0, true );
                ctx.active = Some( next.handle() );

                tracing::info!( "Track {} finished, advancing to {}", job.index, next.index );
                Some( next )
            }
            Ok( outcome ) => {
                tracing::debug!( "Track {} ended without a request: {:?}", job.index, outcome );
                stop( &mut *ctx );
                None
            }
            Err( e ) => {
                tracing::error!( "Playback of track {} failed: {}", job.index, e );
                let _ = self.events.send( PlayerEvent::Error { message: e.to_string() } );
                stop( &mut *ctx );
                None
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::test_support::{ silent_mp3, silent_track, wait_until, MockBackend };


    const WAIT: Duration = Duration::from_secs( 5 );


    fn player( backend: &MockBackend, tracks: Vec<Track> ) -> Player {
        Player::with_playlist( Arc::new( backend.clone() ), PlayerConfig::default(), tracks ).unwrap()
    }


    fn slow_backend() -> MockBackend {
        MockBackend::with_write_delay( Duration::from_millis( 1 ) )
    }


    fn starts( events: &[PlayerEvent] ) -> Vec<( usize, u64 )> {
        events.iter()
            .filter_map( |e| match e {
                PlayerEvent::PlaybackStarted { index, start_frame } => Some(( *index, *start_frame )),
                _ => None,
            })
            .collect()
    }


    fn frames_in( backend: &MockBackend, device: usize ) -> usize {
        backend.frames_written().get( device ).copied().unwrap_or( 0 )
    }


    /// Counts song-change callbacks seen by `dispatch_events`.
    fn song_changes( player: &Player ) -> Arc<AtomicUsize> {
        let changes = Arc::new( AtomicUsize::new( 0 ) );
        let counter = Arc::clone( &changes );
        player.on_song_change( move || {
            counter.fetch_add( 1, Ordering::SeqCst );
        });
        changes
    }


    #[test]
    fn test_illegal_operations_leave_state_unchanged() {
        let backend = MockBackend::new();
        let player = player( &backend, vec![ silent_track( "a", 10 ) ] );

        assert!( matches!( player.pause(), Err( PlayerError::IllegalTransition( _ ) ) ) );
        assert!( matches!( player.resume(), Err( PlayerError::IllegalTransition( _ ) ) ) );
        assert!( matches!( player.next(), Err( PlayerError::IllegalTransition( _ ) ) ) );
        assert!( matches!( player.previous(), Err( PlayerError::IllegalTransition( _ ) ) ) );
        player.stop().unwrap();

        assert_eq!( player.state(), PlaybackState::Stopped );
        assert_eq!( player.current_index(), 0 );
        assert_eq!( backend.opens(), 0 );
        assert!( player.dispatch_events().is_empty() );
    }


    #[test]
    fn test_play_on_empty_playlist() {
        let backend = MockBackend::new();
        let player = Player::new( Arc::new( backend.clone() ), PlayerConfig::default() ).unwrap();

        assert!( matches!( player.play(), Err( PlayerError::EmptyPlaylist ) ) );
        assert_eq!( player.state(), PlaybackState::Stopped );
        assert_eq!( player.current_track(), None );
        assert_eq!( backend.opens(), 0 );
    }


    #[test]
    fn test_pause_resume_continues_at_exact_frame() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 400 ), silent_track( "b", 400 ) ] );

        player.play().unwrap();
        assert!( wait_until( WAIT, || frames_in( &backend, 0 ) >= 5 ) );

        player.pause().unwrap();
        assert!( player.is_paused() );
        let resume_frame = player.cursor().resume_frame;
        assert_eq!( resume_frame as usize, frames_in( &backend, 0 ) );
        assert_eq!( player.current_frame(), resume_frame );
        assert!( resume_frame < 400 );

        player.resume().unwrap();
        assert!( player.is_playing() );

        // Track a runs out and the player moves on to b by itself
        assert!( wait_until( WAIT, || player.current_index() == 1 ) );
        player.stop().unwrap();

        assert_eq!( frames_in( &backend, 0 ) + frames_in( &backend, 1 ), 400 );

        let events = player.dispatch_events();
        assert_eq!( &starts( &events )[ ..3 ], &[ ( 0, 0 ), ( 0, resume_frame ), ( 1, 0 ) ] );
        assert!( events.contains( &PlayerEvent::TrackEnded { index: 0 } ) );
    }


    #[test]
    fn test_play_while_paused_restarts_track() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 400 ) ] );

        player.play().unwrap();
        assert!( wait_until( WAIT, || frames_in( &backend, 0 ) >= 3 ) );
        player.pause().unwrap();
        assert!( player.cursor().resume_frame > 0 );

        player.play().unwrap();
        assert_eq!( player.cursor(), FrameCursor::default() );
        player.stop().unwrap();

        let events = player.dispatch_events();
        assert_eq!( starts( &events ), vec![ ( 0, 0 ), ( 0, 0 ) ] );
    }


    #[test]
    fn test_pause_and_stop_release_device_before_returning() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ) ] );

        player.play().unwrap();
        assert!( backend.is_open() );

        player.pause().unwrap();
        assert!( !backend.is_open() );
        assert_eq!( backend.opens(), backend.closes() );

        player.resume().unwrap();
        assert!( backend.is_open() );

        player.stop().unwrap();
        assert!( !backend.is_open() );
        assert_eq!( backend.opens(), 2 );
        assert_eq!( backend.closes(), 2 );
        assert_eq!( player.state(), PlaybackState::Stopped );
    }


    #[test]
    fn test_next_starts_following_track_from_zero() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ), silent_track( "b", 1000 ) ] );

        player.play().unwrap();
        assert!( wait_until( WAIT, || frames_in( &backend, 0 ) >= 2 ) );
        player.next().unwrap();

        assert_eq!( player.current_index(), 1 );
        assert!( player.is_playing() );

        let events = player.dispatch_events();
        assert_eq!( starts( &events ), vec![ ( 0, 0 ), ( 1, 0 ) ] );
        assert!( events.contains( &PlayerEvent::TrackChanged { index: 1 } ) );

        player.stop().unwrap();
    }


    #[test]
    fn test_previous_wraps_to_last_track() {
        let backend = slow_backend();
        let tracks = vec![ silent_track( "a", 1000 ), silent_track( "b", 1000 ), silent_track( "c", 1000 ) ];
        let player = player( &backend, tracks );

        player.play().unwrap();
        player.previous().unwrap();
        assert_eq!( player.current_index(), 2 );
        assert_eq!( player.current_track().unwrap().name(), Some( "c" ) );

        player.pause().unwrap();
        player.next().unwrap();
        assert_eq!( player.current_index(), 0 );
        assert!( player.is_playing() );

        player.stop().unwrap();
    }


    #[test]
    fn test_auto_advance_notifies_song_change() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 5 ), silent_track( "b", 1000 ) ] );

        let changes = song_changes( &player );

        player.play().unwrap();
        assert!( wait_until( WAIT, || player.current_index() == 1 ) );
        assert!( player.is_playing() );
        player.stop().unwrap();

        let events = player.dispatch_events();
        assert_eq!( changes.load( Ordering::SeqCst ), 2 );
        assert!( events.contains( &PlayerEvent::TrackChanged { index: 0 } ) );
        assert!( events.contains( &PlayerEvent::TrackChanged { index: 1 } ) );
        assert_eq!( frames_in( &backend, 0 ), 5 );
    }


    #[test]
    fn test_change_playlist_while_playing() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ) ] );

        player.play().unwrap();
        player.change_playlist( Vec::new() ).unwrap();

        assert_eq!( player.state(), PlaybackState::Stopped );
        assert!( !backend.is_open() );
        assert_eq!( player.track_count(), 0 );
        assert!( matches!( player.play(), Err( PlayerError::EmptyPlaylist ) ) );
        assert_eq!( player.state(), PlaybackState::Stopped );
    }


    #[test]
    fn test_change_playlist_resets_position() {
        let backend = MockBackend::new();
        let player = player( &backend, vec![ silent_track( "a", 3 ), silent_track( "b", 3 ) ] );

        player.set_current_index( 1 ).unwrap();
        player.set_current_frame( 2 );
        player.change_playlist( vec![ silent_track( "x", 3 ), silent_track( "y", 3 ) ] ).unwrap();

        assert_eq!( player.current_index(), 0 );
        assert_eq!( player.cursor(), FrameCursor::default() );
        assert_eq!( player.current_track().unwrap().name(), Some( "x" ) );
    }


    #[test]
    fn test_device_unavailable_returns_to_stopped() {
        let backend = MockBackend::failing();
        let player = player( &backend, vec![ silent_track( "a", 10 ) ] );
        let changes = song_changes( &player );

        assert!( matches!( player.play(), Err( PlayerError::DeviceUnavailable( _ ) ) ) );
        assert_eq!( player.state(), PlaybackState::Stopped );

        let events = player.dispatch_events();
        assert!( events.iter().any( |e| matches!( e, PlayerEvent::Error { .. } ) ) );
        assert!( !events.iter().any( |e| matches!( e, PlayerEvent::TrackChanged { .. } ) ) );
        assert_eq!( events.last(), Some( &PlayerEvent::StateChanged { state: PlaybackState::Stopped } ) );
        assert_eq!( changes.load( Ordering::SeqCst ), 0 );
    }


    #[test]
    fn test_truncated_track_stops_instead_of_advancing() {
        let backend = MockBackend::new();
        let mut cut = silent_mp3( 10 );
        cut.truncate( cut.len() - 200 );
        let tracks = vec![ Track::new( cut ).with_name( "cut" ), silent_track( "b", 1000 ) ];
        let player = player( &backend, tracks );

        player.play().unwrap();
        assert!( wait_until( WAIT, || player.state() == PlaybackState::Stopped ) );

        assert_eq!( player.current_index(), 0 );
        assert_eq!( backend.frames_written(), vec![ 9 ] );
        assert!( !backend.is_open() );

        let events = player.dispatch_events();
        assert!( events.iter().any( |e| matches!( e, PlayerEvent::Error { .. } ) ) );
        assert!( !events.contains( &PlayerEvent::TrackEnded { index: 0 } ) );
        assert!( !events.contains( &PlayerEvent::TrackChanged { index: 1 } ) );
    }


    #[test]
    fn test_auto_advance_onto_malformed_track() {
        let backend = MockBackend::new();
        let garbage = Track::new( vec![ 0x42u8; 2048 ] ).with_name( "garbage" );
        let player = player( &backend, vec![ silent_track( "a", 5 ), garbage ] );
        let changes = song_changes( &player );

        player.play().unwrap();
        assert!( wait_until( WAIT, || player.state() == PlaybackState::Stopped ) );
        assert_eq!( player.current_index(), 1 );

        let events = player.dispatch_events();
        assert!( events.contains( &PlayerEvent::TrackEnded { index: 0 } ) );
        assert!( !events.contains( &PlayerEvent::TrackChanged { index: 1 } ) );
        assert!( events.iter().any( |e| matches!( e, PlayerEvent::Error { .. } ) ) );
        assert_eq!( events.last(), Some( &PlayerEvent::StateChanged { state: PlaybackState::Stopped } ) );
        assert_eq!( changes.load( Ordering::SeqCst ), 1 );

        // The bad track fails again up front; the good one still plays
        assert!( matches!( player.play(), Err( PlayerError::Decode( _ ) ) ) );
        assert_eq!( player.state(), PlaybackState::Stopped );
        player.set_current_index( 0 ).unwrap();
        player.play().unwrap();
        player.stop().unwrap();
    }


    #[test]
    fn test_write_failure_mid_track_stops_player() {
        let backend = MockBackend::failing_after( 5 );
        let player = player( &backend, vec![ silent_track( "a", 100 ), silent_track( "b", 100 ) ] );

        player.play().unwrap();
        assert!( wait_until( WAIT, || player.state() == PlaybackState::Stopped ) );

        assert_eq!( player.current_index(), 0 );
        assert_eq!( player.current_frame(), 5 );
        assert_eq!( backend.frames_written(), vec![ 5 ] );
        assert!( !backend.is_open() );

        let events = player.dispatch_events();
        assert!( events.iter().any( |e| matches!( e, PlayerEvent::Error { .. } ) ) );
        assert_eq!( events.last(), Some( &PlayerEvent::StateChanged { state: PlaybackState::Stopped } ) );

        player.play().unwrap();
        assert!( wait_until( WAIT, || player.state() == PlaybackState::Stopped ) );
        assert_eq!( backend.frames_written(), vec![ 5, 5 ] );
    }


    #[test]
    fn test_malformed_track_is_reported() {
        let backend = MockBackend::new();
        let garbage = Track::new( vec![ 0x42u8; 2048 ] ).with_name( "garbage" );
        let player = player( &backend, vec![ garbage ] );

        assert!( matches!( player.play(), Err( PlayerError::Decode( _ ) ) ) );
        assert_eq!( player.state(), PlaybackState::Stopped );
        assert_eq!( backend.opens(), 0 );
    }


    #[test]
    fn test_seek_by_setting_frame_then_resuming() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ) ] );

        player.play().unwrap();
        player.pause().unwrap();
        player.set_current_frame( 10 );
        player.resume().unwrap();
        player.stop().unwrap();

        let events = player.dispatch_events();
        assert_eq!( starts( &events ).last(), Some( &( 0, 10 ) ) );
        assert!( player.cursor().resume_frame >= 10 );
    }


    #[test]
    fn test_set_current_index_bounds() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ), silent_track( "b", 1000 ) ] );

        assert!( matches!(
            player.set_current_index( 5 ),
            Err( PlayerError::IndexOutOfRange { index: 5, len: 2 } )
        ));

        player.set_current_index( 1 ).unwrap();
        player.play().unwrap();
        player.stop().unwrap();

        assert_eq!( starts( &player.dispatch_events() ), vec![ ( 1, 0 ) ] );
    }


    #[test]
    fn test_stop_then_play_starts_over() {
        let backend = slow_backend();
        let player = player( &backend, vec![ silent_track( "a", 1000 ) ] );

        player.play().unwrap();
        assert!( wait_until( WAIT, || frames_in( &backend, 0 ) >= 3 ) );
        player.stop().unwrap();
        assert!( player.current_frame() >= 3 );
        assert!( matches!( player.resume(), Err( PlayerError::IllegalTransition( _ ) ) ) );

        player.play().unwrap();
        player.stop().unwrap();

        assert_eq!( starts( &player.dispatch_events() ), vec![ ( 0, 0 ), ( 0, 0 ) ] );
    }


    #[test]
    fn test_shared_between_threads() {
        let backend = slow_backend();
        let player = Arc::new( player( &backend, vec![ silent_track( "a", 1000 ) ] ) );

        let handles: Vec<_> = ( 0..4 )
            .map( |_| {
                let player = Arc::clone( &player );
                thread::spawn( move || {
                    let _ = player.play();
                    let _ = player.pause();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        player.stop().unwrap();
        assert!( !backend.is_open() );
        assert_eq!( backend.opens(), backend.closes() );
    }
}
