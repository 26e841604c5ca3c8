//! Shared fixtures for unit tests: a synthetic MP3 stream and a recording
//! audio backend.

use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::thread;
use std::time::{ Duration, Instant };

use crate::output::{ AudioBackend, AudioDevice, OutputError, StreamSpec };
use crate::playlist::Track;


/// MPEG-1 Layer III, 128 kbps, 44.1 kHz, mono, no CRC, no padding.
const FRAME_HEADER: [u8; 4] = [ 0xFF, 0xFB, 0x90, 0xC4 ];

/// 144 * 128000 / 44100, rounded down.
const FRAME_LEN: usize = 417;

/// Samples produced by one mono layer III frame.
pub const SAMPLES_PER_FRAME: usize = 1152;


/// Builds a stream of `frames` silent frames.
///
/// Side info and main data are all zero, so every frame decodes to silence
/// without touching the bit reservoir.
pub fn silent_mp3( frames: usize ) -> Vec<u8> {
    let mut out = Vec::with_capacity( frames * FRAME_LEN );
    for _ in 0..frames {
        out.extend_from_slice( &FRAME_HEADER );
        out.resize( out.len() + FRAME_LEN - FRAME_HEADER.len(), 0 );
    }
    out
}


/// A named track of `frames` silent frames.
pub fn silent_track( name: &str, frames: usize ) -> Track {
    Track::new( silent_mp3( frames ) ).with_name( name )
}


/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until( timeout: Duration, mut condition: impl FnMut() -> bool ) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep( Duration::from_millis( 2 ) );
    }
    condition()
}


#[derive( Debug, Default )]
struct DeviceLog {
    opens: usize,
    closes: usize,
    flushes: usize,
    open_now: usize,
    /// Frames written per opened device, in open order
    frames: Vec<usize>,
    samples: usize,
    specs: Vec<StreamSpec>,
}


/// Backend whose devices record what happens to them.
#[derive( Clone, Default )]
pub struct MockBackend {
    log: Arc<Mutex<DeviceLog>>,
    fail_open: bool,
    write_delay: Duration,
    /// Writes to each device fail once this many frames went through
    fail_write_after: Option<usize>,
}


impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }


    /// Backend that never manages to open a device.
    pub fn failing() -> Self {
        Self { fail_open: true, ..Self::default() }
    }


    /// Backend whose writes take `delay`, roughly like a real device.
    pub fn with_write_delay( delay: Duration ) -> Self {
        Self { write_delay: delay, ..Self::default() }
    }


    /// Backend whose devices fail on the write after `frames` successful ones.
    pub fn failing_after( frames: usize ) -> Self {
        Self { fail_write_after: Some( frames ), ..Self::default() }
    }


    fn log( &self ) -> MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap_or_else( PoisonError::into_inner )
    }


    pub fn opens( &self ) -> usize {
        self.log().opens
    }


    pub fn closes( &self ) -> usize {
        self.log().closes
    }


    pub fn flushes( &self ) -> usize {
        self.log().flushes
    }


    /// Returns true while any device is open.
    pub fn is_open( &self ) -> bool {
        self.log().open_now > 0
    }


    /// Frames written to each device, in open order.
    pub fn frames_written( &self ) -> Vec<usize> {
        self.log().frames.clone()
    }


    pub fn samples_written( &self ) -> usize {
        self.log().samples
    }


    pub fn specs( &self ) -> Vec<StreamSpec> {
        self.log().specs.clone()
    }
}


impl AudioBackend for MockBackend {
    fn open( &self, spec: StreamSpec ) -> Result<Box<dyn AudioDevice>, OutputError> {
        if self.fail_open {
            return Err( OutputError::NoDevice );
        }

        let mut log = self.log();
        log.opens += 1;
        log.open_now += 1;
        log.frames.push( 0 );
        log.specs.push( spec );
        let slot = log.frames.len() - 1;

        Ok( Box::new( MockDevice {
            log: Arc::clone( &self.log ),
            slot,
            write_delay: self.write_delay,
            fail_write_after: self.fail_write_after,
            closed: false,
        }))
    }
}


struct MockDevice {
    log: Arc<Mutex<DeviceLog>>,
    slot: usize,
    write_delay: Duration,
    fail_write_after: Option<usize>,
    closed: bool,
}


impl MockDevice {
    fn log( &self ) -> MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap_or_else( PoisonError::into_inner )
    }
}


impl AudioDevice for MockDevice {
    fn write( &mut self, samples: &[f32] ) -> Result<(), OutputError> {
        if !self.write_delay.is_zero() {
            thread::sleep( self.write_delay );
        }
        let slot = self.slot;
        let mut log = self.log();
        if self.fail_write_after == Some( log.frames[ slot ] ) {
            return Err( OutputError::Stalled( Duration::from_secs( 0 ) ) );
        }
        log.frames[ slot ] += 1;
        log.samples += samples.len();
        Ok(())
    }


    fn flush( &mut self ) -> Result<(), OutputError> {
        self.log().flushes += 1;
        Ok(())
    }


    fn close( &mut self ) {
        if !self.closed {
            self.closed = true;
            let mut log = self.log();
            log.closes += 1;
            log.open_now -= 1;
        }
    }
}


impl Drop for MockDevice {
    fn drop( &mut self ) {
        self.close();
    }
}
