//! Player state machine
//!
//! The transition table is plain data: each (state, operation) pair maps to
//! the next state plus the side effects the player has to run, or to an
//! [`IllegalTransition`] that leaves the state untouched.

use std::fmt;

use thiserror::Error;


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}


impl fmt::Display for PlaybackState {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let name = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        };
        f.write_str( name )
    }
}


/// Operations accepted by every state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Operation {
    Play,
    Pause,
    Resume,
    Stop,
    Next,
    Previous,
}


impl fmt::Display for Operation {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let name = match self {
            Operation::Play => "play",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Stop => "stop",
            Operation::Next => "next",
            Operation::Previous => "previous",
        };
        f.write_str( name )
    }
}


/// Side effects of a transition, run in order.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Action {
    /// Ask the running session to stop and wait for it to release the device
    CloseSession,
    /// Store the last completed frame as the resume point
    SnapshotFrame,
    Advance,
    Retreat,
    /// Start the current track at frame 0
    StartFromBeginning,
    /// Start the current track at the saved resume frame
    StartFromResumeFrame,
}


/// Result of a legal operation.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct Transition {
    pub next: PlaybackState,
    pub actions: &'static [Action],
}


impl Transition {
    /// Returns true if the transition opens a new session.
    pub fn starts_session( &self ) -> bool {
        self.actions.iter().any( |a| {
            matches!( a, Action::StartFromBeginning | Action::StartFromResumeFrame )
        })
    }


    /// Returns true if nothing happens.
    pub fn is_noop( &self ) -> bool {
        self.actions.is_empty()
    }
}


/// An operation that is not valid in the current state.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Error )]
#[error( "cannot {operation} while {state}: {reason}" )]
pub struct IllegalTransition {
    pub state: PlaybackState,
    pub operation: Operation,
    pub reason: &'static str,
}


const NONE: &[Action] = &[];
const START: &[Action] = &[ Action::StartFromBeginning ];
const RESUME: &[Action] = &[ Action::StartFromResumeFrame ];
const HALT: &[Action] = &[ Action::CloseSession, Action::SnapshotFrame ];
const SKIP_FORWARD: &[Action] = &[ Action::CloseSession, Action::Advance, Action::StartFromBeginning ];
const SKIP_BACK: &[Action] = &[ Action::CloseSession, Action::Retreat, Action::StartFromBeginning ];


/// Looks up the transition for `operation` in `state`.
pub fn transition( state: PlaybackState, operation: Operation ) -> Result<Transition, IllegalTransition> {
    use Operation::*;
    use PlaybackState::*;

    let to = |next, actions| Ok( Transition { next, actions } );
    let illegal = |reason| Err( IllegalTransition { state, operation, reason } );

    match ( state, operation ) {
        ( Stopped, Play ) => to( Playing, START ),
        ( Stopped, Pause ) => illegal( "nothing is playing" ),
        ( Stopped, Resume ) => illegal( "there is no paused track" ),
        ( Stopped, Stop ) => to( Stopped, NONE ),
        ( Stopped, Next | Previous ) => illegal( "playback is stopped" ),

        ( Playing, Play ) => illegal( "already playing" ),
        ( Playing, Pause ) => to( Paused, HALT ),
        ( Playing, Resume ) => illegal( "already playing" ),
        ( Playing, Stop ) => to( Stopped, HALT ),
        ( Playing, Next ) => to( Playing, SKIP_FORWARD ),
        ( Playing, Previous ) => to( Playing, SKIP_BACK ),

        // play restarts the track; only resume continues from the saved frame
        ( Paused, Play ) => to( Playing, START ),
        ( Paused, Pause ) => illegal( "already paused" ),
        ( Paused, Resume ) => to( Playing, RESUME ),
        ( Paused, Stop ) => to( Stopped, HALT ),
        ( Paused, Next ) => to( Playing, SKIP_FORWARD ),
        ( Paused, Previous ) => to( Playing, SKIP_BACK ),
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use Operation::*;
    use PlaybackState::*;


    #[test]
    fn test_stopped_row() {
        assert_eq!( transition( Stopped, Play ).unwrap(), Transition { next: Playing, actions: START } );
        assert!( transition( Stopped, Stop ).unwrap().is_noop() );
        assert_eq!( transition( Stopped, Stop ).unwrap().next, Stopped );

        for op in [ Pause, Resume, Next, Previous ] {
            let err = transition( Stopped, op ).unwrap_err();
            assert_eq!( err.state, Stopped );
            assert_eq!( err.operation, op );
        }
    }


    #[test]
    fn test_playing_row() {
        assert!( transition( Playing, Play ).is_err() );
        assert!( transition( Playing, Resume ).is_err() );

        let pause = transition( Playing, Pause ).unwrap();
        assert_eq!( pause.next, Paused );
        assert_eq!( pause.actions, &[ Action::CloseSession, Action::SnapshotFrame ] );
        assert!( !pause.starts_session() );

        assert_eq!( transition( Playing, Stop ).unwrap().next, Stopped );

        let next = transition( Playing, Next ).unwrap();
        assert_eq!( next.next, Playing );
        assert_eq!( next.actions, &[ Action::CloseSession, Action::Advance, Action::StartFromBeginning ] );

        let prev = transition( Playing, Previous ).unwrap();
        assert_eq!( prev.actions, &[ Action::CloseSession, Action::Retreat, Action::StartFromBeginning ] );
    }


    #[test]
    fn test_paused_play_restarts_instead_of_resuming() {
        let play = transition( Paused, Play ).unwrap();
        assert_eq!( play.next, Playing );
        assert_eq!( play.actions, &[ Action::StartFromBeginning ] );

        let resume = transition( Paused, Resume ).unwrap();
        assert_eq!( resume.actions, &[ Action::StartFromResumeFrame ] );
        assert!( resume.starts_session() );
    }


    #[test]
    fn test_paused_row() {
        assert!( transition( Paused, Pause ).is_err() );
        assert_eq!( transition( Paused, Stop ).unwrap().next, Stopped );
        assert_eq!( transition( Paused, Next ).unwrap().next, Playing );
        assert_eq!( transition( Paused, Previous ).unwrap().next, Playing );
    }


    #[test]
    fn test_illegal_transition_message() {
        let err = transition( Stopped, Pause ).unwrap_err();
        assert_eq!( err.to_string(), "cannot pause while stopped: nothing is playing" );
    }
}
