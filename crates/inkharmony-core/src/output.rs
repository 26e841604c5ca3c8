//! Audio output via cpal
//!
//! Defines the device seam used by the frame decoder and the cpal-backed
//! implementation that sends decoded PCM samples to the system audio device.

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex };
use std::thread;
use std::time::{ Duration, Instant };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use thiserror::Error;

use crate::lock;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Output device not found: {0}" )]
    DeviceNotFound( String ),

    #[error( "Failed to get stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),

    #[error( "Resampler error: {0}" )]
    Resample( String ),

    #[error( "Output stalled: no samples consumed for {0:?}" )]
    Stalled( Duration ),
}


/// Format of the decoded stream a device is opened for.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
}


/// An open audio output.
///
/// Devices are created and dropped on the thread that decodes into them, so
/// implementations need not be `Send`.
pub trait AudioDevice {
    /// Queues one frame worth of interleaved samples.
    ///
    /// Either every sample is accepted or an error is returned.
    fn write( &mut self, samples: &[f32] ) -> Result<(), OutputError>;

    /// Blocks until queued samples have been played.
    fn flush( &mut self ) -> Result<(), OutputError>;

    /// Releases the device. Calling it more than once is a no-op.
    fn close( &mut self );
}


/// Opens audio devices for a given stream format.
pub trait AudioBackend: Send + Sync {
    fn open( &self, spec: StreamSpec ) -> Result<Box<dyn AudioDevice>, OutputError>;
}


/// Output tuning.
#[derive( Debug, Clone )]
pub struct OutputConfig {
    /// Amount of audio queued ahead of the device, in milliseconds
    pub buffer_ms: u32,
    /// Output device name, or the host default when `None`
    pub device_name: Option<String>,
    /// How long a write or flush may wait without the device consuming samples
    pub stall_timeout: Duration,
}


impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 150,
            device_name: None,
            stall_timeout: Duration::from_secs( 2 ),
        }
    }
}


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    if channels.is_empty() || channels[ 0 ].is_empty() {
        return Vec::new();
    }
    let frames = channels[ 0 ].len();
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


/// Shared sample buffer between producer (decoder) and consumer (audio callback).
/// Handles channel conversion between source and output.
pub struct SampleBuffer {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    source_channels: u16,
    output_channels: u16,
}


impl SampleBuffer {
    /// Creates a new sample buffer.
    ///
    /// - `capacity`: Maximum number of source samples to buffer
    /// - `source_channels`: Number of channels pushed by the decoder
    /// - `output_channels`: Number of channels expected by the output device
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            source_channels,
            output_channels,
        }
    }


    /// Pushes samples to the buffer. Returns number of samples actually pushed.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = lock( &self.buffer );
        let available = self.capacity.saturating_sub( buf.len() );
        let to_push = samples.len().min( available );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Pops samples into the output slice, converting channel layout.
    /// Unfilled output is silenced. Returns the number of output samples written.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        let mut buf = lock( &self.buffer );
        let src_ch = self.source_channels.max( 1 ) as usize;
        let out_ch = self.output_channels.max( 1 ) as usize;

        let written = if src_ch == out_ch {
            let to_pop = output.len().min( buf.len() );
            for ( slot, sample ) in output.iter_mut().zip( buf.drain( ..to_pop ) ) {
                *slot = sample;
            }
            to_pop
        } else {
            let frames = ( output.len() / out_ch ).min( buf.len() / src_ch );
            let mut frame = Vec::with_capacity( src_ch );

            for i in 0..frames {
                frame.clear();
                frame.extend( buf.drain( ..src_ch ) );
                let out = &mut output[ i * out_ch..( i + 1 ) * out_ch ];

                if src_ch == 2 && out_ch == 1 {
                    // Stereo to mono: mix down
                    out[ 0 ] = ( frame[ 0 ] + frame[ 1 ] ) * 0.5;
                } else {
                    // Copy matching channels, repeat the last one for extra outputs
                    for ( ch, slot ) in out.iter_mut().enumerate() {
                        *slot = frame[ ch.min( src_ch - 1 ) ];
                    }
                }
            }
            frames * out_ch
        };

        for sample in output[ written.. ].iter_mut() {
            *sample = 0.0;
        }

        written
    }


    /// Returns the number of samples currently in the buffer.
    pub fn len( &self ) -> usize {
        lock( &self.buffer ).len()
    }


    /// Returns true if the buffer is empty.
    pub fn is_empty( &self ) -> bool {
        lock( &self.buffer ).is_empty()
    }


    /// Clears the buffer.
    pub fn clear( &self ) {
        lock( &self.buffer ).clear();
    }
}


/// Backend that opens devices on the system's cpal host.
#[derive( Debug, Clone, Default )]
pub struct CpalBackend {
    config: OutputConfig,
}


impl CpalBackend {
    pub fn new( config: OutputConfig ) -> Self {
        Self { config }
    }


    /// Lists the names of the host's output devices.
    pub fn device_names() -> Vec<String> {
        cpal::default_host()
            .output_devices()
            .map( |devices| devices.filter_map( |d| d.name().ok() ).collect() )
            .unwrap_or_default()
    }
}


impl AudioBackend for CpalBackend {
    fn open( &self, spec: StreamSpec ) -> Result<Box<dyn AudioDevice>, OutputError> {
        Ok( Box::new( CpalDevice::open( spec, &self.config )? ) )
    }
}


/// cpal output stream fed from a [`SampleBuffer`].
/// Note: `cpal::Stream` is not Send, keep this on the thread that opened it.
pub struct CpalDevice {
    stream: Option<cpal::Stream>,
    buffer: Arc<SampleBuffer>,
    resampler: Option<FastFixedOut<f32>>,
    /// Planar samples waiting for a full resampler chunk
    resample_input: Vec<Vec<f32>>,
    channels: usize,
    source_sample_rate: u32,
    stall_timeout: Duration,
}


impl CpalDevice {
    /// Opens an output stream for the given source format.
    pub fn open( spec: StreamSpec, config: &OutputConfig ) -> Result<Self, OutputError> {
        let host = cpal::default_host();

        let device = match config.device_name {
            Some( ref name ) => host
                .output_devices()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
                .find( |d| d.name().map( |n| n == *name ).unwrap_or( false ) )
                .ok_or_else( || OutputError::DeviceNotFound( name.clone() ) )?,
            None => host
                .default_output_device()
                .ok_or( OutputError::NoDevice )?,
        };

        tracing::info!( "Using output device: {:?}", device.name() );

        let source_rate = spec.sample_rate;
        let source_channels = spec.channels;

        // Priority: 1) exact match, 2) same sample rate any channels, 3) default (resampled)
        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_rate && c.max_sample_rate().0 >= source_rate
        };

        let stream_config = if let Some( supported ) = supported_configs
            .iter()
            .find( |c| c.channels() == source_channels && supports_rate( *c ) )
        {
            supported.clone().with_sample_rate( cpal::SampleRate( source_rate ) ).config()
        } else if let Some( supported ) = supported_configs.iter().find( |c| supports_rate( *c ) ) {
            tracing::info!(
                "Channel conversion: stream has {} channels, device using {} channels",
                source_channels,
                supported.channels()
            );
            supported.clone().with_sample_rate( cpal::SampleRate( source_rate ) ).config()
        } else {
            device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
                .config()
        };

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            stream_config.sample_rate.0,
            stream_config.channels
        );

        let capacity = ( source_rate as usize * source_channels as usize * config.buffer_ms as usize / 1000 )
            .max( 4096 );
        let buffer = Arc::new( SampleBuffer::new( capacity, source_channels, stream_config.channels ) );
        let buffer_clone = Arc::clone( &buffer );

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    buffer_clone.pop( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        stream.play().map_err( |e| OutputError::PlayStream( e.to_string() ) )?;

        let device_rate = stream_config.sample_rate.0;
        let resampler = if device_rate != source_rate {
            tracing::info!( "Resampling: {} Hz → {} Hz", source_rate, device_rate );

            let resampler = FastFixedOut::<f32>::new(
                device_rate as f64 / source_rate as f64,
                2.0,  // max relative input/output size ratio
                PolynomialDegree::Cubic,
                1024, // output chunk size
                source_channels as usize,
            ).map_err( |e| OutputError::Resample( e.to_string() ) )?;

            Some( resampler )
        } else {
            None
        };

        Ok( Self {
            stream: Some( stream ),
            buffer,
            resampler,
            resample_input: ( 0..source_channels ).map( |_| Vec::new() ).collect(),
            channels: source_channels as usize,
            source_sample_rate: source_rate,
            stall_timeout: config.stall_timeout,
        })
    }


    /// Pushes every sample into the shared buffer, waiting for room as needed.
    fn enqueue( &self, samples: &[f32] ) -> Result<(), OutputError> {
        let mut offset = 0;
        let mut last_progress = Instant::now();

        while offset < samples.len() {
            let pushed = self.buffer.push( &samples[ offset.. ] );
            offset += pushed;

            if pushed > 0 {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > self.stall_timeout {
                return Err( OutputError::Stalled( self.stall_timeout ) );
            } else {
                // Buffer full, wait a bit
                thread::sleep( Duration::from_millis( 5 ) );
            }
        }

        Ok(())
    }


    /// Runs full resampler chunks, or the remainder when `drain` is set.
    fn resample( &mut self, drain: bool ) -> Result<Vec<f32>, OutputError> {
        let Some( ref mut resampler ) = self.resampler else {
            return Ok( Vec::new() );
        };

        let mut output = Vec::new();
        while self.resample_input[ 0 ].len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self.resample_input
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();

            let resampled = resampler
                .process( &chunk, None )
                .map_err( |e| OutputError::Resample( e.to_string() ) )?;
            output.extend( interleave( &resampled ) );
        }

        if drain && !self.resample_input[ 0 ].is_empty() {
            let resampled = resampler
                .process_partial( Some( self.resample_input.as_slice() ), None )
                .map_err( |e| OutputError::Resample( e.to_string() ) )?;
            output.extend( interleave( &resampled ) );
            for ch in self.resample_input.iter_mut() {
                ch.clear();
            }
        }

        Ok( output )
    }
}


impl AudioDevice for CpalDevice {
    fn write( &mut self, samples: &[f32] ) -> Result<(), OutputError> {
        if self.stream.is_none() {
            return Err( OutputError::PlayStream( "stream closed".into() ) );
        }

        if self.resampler.is_none() {
            return self.enqueue( samples );
        }

        // Convert interleaved to planar for the resampler
        for chunk in samples.chunks( self.channels ) {
            for ( ch, sample ) in chunk.iter().enumerate() {
                self.resample_input[ ch ].push( *sample );
            }
        }

        let resampled = self.resample( false )?;
        self.enqueue( &resampled )
    }


    fn flush( &mut self ) -> Result<(), OutputError> {
        if self.stream.is_none() {
            return Ok(());
        }

        let remainder = self.resample( true )?;
        self.enqueue( &remainder )?;

        // Let the device play out what is queued, bounded by the buffered duration
        let samples_per_sec = ( self.source_sample_rate as usize * self.channels ).max( 1 );
        let queued = Duration::from_secs_f64( self.buffer.len() as f64 / samples_per_sec as f64 );
        let deadline = Instant::now() + queued + self.stall_timeout;

        while !self.buffer.is_empty() {
            if Instant::now() > deadline {
                return Err( OutputError::Stalled( self.stall_timeout ) );
            }
            thread::sleep( Duration::from_millis( 5 ) );
        }

        Ok(())
    }


    fn close( &mut self ) {
        if let Some( stream ) = self.stream.take() {
            if let Err( e ) = stream.pause() {
                tracing::debug!( "Failed to pause stream on close: {}", e );
            }
            self.buffer.clear();
            tracing::debug!( "Output stream closed" );
        }
    }
}


impl Drop for CpalDevice {
    fn drop( &mut self ) {
        self.close();
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_push_respects_capacity() {
        let buffer = SampleBuffer::new( 4, 1, 1 );
        assert_eq!( buffer.push( &[ 0.1, 0.2, 0.3, 0.4, 0.5, 0.6 ] ), 4 );
        assert_eq!( buffer.len(), 4 );
        assert_eq!( buffer.push( &[ 0.7 ] ), 0 );
    }


    #[test]
    fn test_pop_same_channels_pads_with_silence() {
        let buffer = SampleBuffer::new( 16, 2, 2 );
        buffer.push( &[ 0.1, 0.2 ] );

        let mut out = [ 1.0; 4 ];
        assert_eq!( buffer.pop( &mut out ), 2 );
        assert_eq!( out, [ 0.1, 0.2, 0.0, 0.0 ] );
        assert!( buffer.is_empty() );
    }


    #[test]
    fn test_pop_mono_to_stereo_duplicates() {
        let buffer = SampleBuffer::new( 16, 1, 2 );
        buffer.push( &[ 0.25, 0.5 ] );

        let mut out = [ 0.0; 4 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.25, 0.25, 0.5, 0.5 ] );
    }


    #[test]
    fn test_pop_stereo_to_mono_mixes() {
        let buffer = SampleBuffer::new( 16, 2, 1 );
        buffer.push( &[ 0.2, 0.4, 1.0, 0.0 ] );

        let mut out = [ 0.0; 2 ];
        assert_eq!( buffer.pop( &mut out ), 2 );
        assert!( ( out[ 0 ] - 0.3 ).abs() < f32::EPSILON );
        assert!( ( out[ 1 ] - 0.5 ).abs() < f32::EPSILON );
    }


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ -1.0, -2.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, -1.0, 2.0, -2.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }
}
