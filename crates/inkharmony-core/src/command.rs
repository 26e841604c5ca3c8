//! Text command parsing.
//!
//! Commands are typed by the user one per line and parsed here; the front end
//! executes them against the player.

use thiserror::Error;


/// Errors that can occur during command parsing.
#[derive( Debug, Clone, PartialEq, Eq, Error )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed command.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Command {
    // Playback commands
    Play,
    Pause,
    Resume,
    Stop,
    Next,
    Prev,
    Seek { frame: u64 },
    Goto { index: usize },

    // Info commands
    List,
    Status,
    Help,
    Quit,
}


impl Command {
    /// Parses one input line. A leading `/` is accepted and ignored.
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let input = input.strip_prefix( '/' ).unwrap_or( input );
        let mut parts = input.splitn( 2, char::is_whitespace );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( str::trim ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            "play" | "p" => Ok( Command::Play ),
            "pause" | "pa" => Ok( Command::Pause ),
            "resume" | "r" => Ok( Command::Resume ),
            "stop" | "st" => Ok( Command::Stop ),
            "next" | "n" => Ok( Command::Next ),
            "prev" | "previous" | "pr" => Ok( Command::Prev ),
            "seek" | "sk" => {
                let frame = parse_number( args, "frame" )?;
                Ok( Command::Seek { frame } )
            }
            "goto" | "go" | "g" => {
                let index = parse_number( args, "track number" )?;
                if index == 0 {
                    return Err( CommandError::InvalidArgument( "track numbers start at 1".into() ) );
                }
                Ok( Command::Goto { index: index as usize - 1 } )
            }

            "list" | "ls" | "l" => Ok( Command::List ),
            "status" | "s" => Ok( Command::Status ),
            "help" | "h" | "?" => Ok( Command::Help ),
            "quit" | "q" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }


    /// Returns a brief description of the command for help text.
    pub fn description( &self ) -> &'static str {
        match self {
            Command::Play => "Play current track from the start",
            Command::Pause => "Pause playback",
            Command::Resume => "Resume paused track",
            Command::Stop => "Stop playback",
            Command::Next => "Next track",
            Command::Prev => "Previous track",
            Command::Seek { .. } => "Continue from a frame",
            Command::Goto { .. } => "Select track by number",
            Command::List => "List tracks",
            Command::Status => "Show playback status",
            Command::Help => "Show help",
            Command::Quit => "Quit application",
        }
    }
}


fn parse_number( args: Option<&str>, what: &str ) -> Result<u64, CommandError> {
    let arg = args.ok_or_else( || CommandError::MissingArgument( what.into() ) )?;
    arg.parse()
        .map_err( |_| CommandError::InvalidArgument( format!( "Invalid {}: {}", what, arg ) ) )
}


/// Returns help text listing all available commands.
pub fn help_text() -> &'static str {
    r#"Playback Commands:
  play            Play current track from the start   [p]
  pause           Pause playback                      [pa]
  resume          Resume where playback paused        [r]
  stop            Stop playback                       [st]
  next            Next track                          [n]
  prev            Previous track                      [pr]
  seek <frame>    Continue from an MPEG frame         [sk]
  goto <number>   Select track by number              [g]

Other Commands:
  list            List tracks                         [ls]
  status          Show playback status                [s]
  help            Show this help                      [?]
  quit            Exit inkharmony                     [q]"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_playback_commands() {
        assert_eq!( Command::parse( "play" ).unwrap(), Command::Play );
        assert_eq!( Command::parse( "  PAUSE " ).unwrap(), Command::Pause );
        assert_eq!( Command::parse( "r" ).unwrap(), Command::Resume );
        assert_eq!( Command::parse( "/stop" ).unwrap(), Command::Stop );
        assert_eq!( Command::parse( "n" ).unwrap(), Command::Next );
        assert_eq!( Command::parse( "previous" ).unwrap(), Command::Prev );
    }


    #[test]
    fn test_parse_seek() {
        assert_eq!( Command::parse( "seek 380" ).unwrap(), Command::Seek { frame: 380 } );
        assert_eq!( Command::parse( "sk   0" ).unwrap(), Command::Seek { frame: 0 } );
    }


    #[test]
    fn test_parse_seek_rejects_bad_frame() {
        assert!( matches!( Command::parse( "seek" ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "seek 1:30" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "seek -4" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_goto_is_one_based() {
        assert_eq!( Command::parse( "goto 1" ).unwrap(), Command::Goto { index: 0 } );
        assert_eq!( Command::parse( "g 12" ).unwrap(), Command::Goto { index: 11 } );
        assert!( matches!( Command::parse( "goto 0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_info_commands() {
        assert_eq!( Command::parse( "ls" ).unwrap(), Command::List );
        assert_eq!( Command::parse( "status" ).unwrap(), Command::Status );
        assert_eq!( Command::parse( "?" ).unwrap(), Command::Help );
        assert_eq!( Command::parse( "exit" ).unwrap(), Command::Quit );
    }


    #[test]
    fn test_parse_unknown() {
        assert_eq!( Command::parse( "foobar" ), Err( CommandError::Unknown( "foobar".into() ) ) );
        assert!( matches!( Command::parse( "   " ), Err( CommandError::Unknown( _ ) ) ) );
    }
}
