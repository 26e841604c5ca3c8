//! Frame-at-a-time MPEG audio decoding via Symphonia
//!
//! Each demuxed packet of an MPEG audio stream is one frame. The decoder
//! counts frames as they pass so playback can later restart at an exact
//! frame, and renders decoded samples to an [`AudioDevice`].

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, Packet };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::output::{ AudioBackend, AudioDevice, OutputError, StreamSpec };
use crate::playlist::Track;


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Unsupported format" )]
    UnsupportedFormat,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Decode error at frame {frame}: {message}" )]
    Decode { frame: u64, message: String },

    #[error( "Audio device unavailable: {0}" )]
    DeviceUnavailable( OutputError ),

    #[error( "Audio output error: {0}" )]
    Output( OutputError ),

    #[error( "No audio device open" )]
    DeviceNotOpen,
}


/// Demuxer and codec for one track; dropped on close.
struct Stream {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
}


/// Decodes one frame at a time and renders it to an audio device.
pub struct FrameDecoder {
    stream: Option<Stream>,
    device: Option<Box<dyn AudioDevice>>,
    spec: StreamSpec,
    sample_buf: Option<SampleBuffer<f32>>,
    frame_index: u64,
    /// The last frame in the source is cut short
    truncated_tail: bool,
}


impl FrameDecoder {
    /// Opens an in-memory track for decoding.
    pub fn open( source: &Track ) -> Result<Self, DecoderError> {
        let cursor = Cursor::new( source.data() );
        let mss = MediaSourceStream::new( Box::new( cursor ), MediaSourceStreamOptions::default() );

        let mut hint = Hint::new();
        hint.with_extension( "mp3" );

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| DecoderError::UnsupportedFormat )?;

        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let spec = StreamSpec {
            sample_rate: codec_params.sample_rate.unwrap_or( 44100 ),
            channels: codec_params.channels.map( |c| c.count() as u16 ).unwrap_or( 2 ),
        };

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        tracing::debug!(
            "Opened stream: {} Hz, {} channels, {} bytes",
            spec.sample_rate,
            spec.channels,
            source.len()
        );

        Ok( Self {
            stream: Some( Stream { format_reader, decoder, track_id } ),
            device: None,
            spec,
            sample_buf: None,
            frame_index: 0,
            truncated_tail: has_truncated_tail( source.bytes() ),
        })
    }


    /// Returns the stream format.
    pub fn spec( &self ) -> StreamSpec {
        self.spec
    }


    /// Returns the number of frames decoded or skipped so far.
    pub fn frame_index( &self ) -> u64 {
        self.frame_index
    }


    /// Returns true if an output device is open.
    pub fn has_device( &self ) -> bool {
        self.device.is_some()
    }


    /// Opens an output device sized to the stream.
    pub fn open_device( &mut self, backend: &dyn AudioBackend ) -> Result<(), DecoderError> {
        if self.device.is_none() {
            let device = backend.open( self.spec ).map_err( DecoderError::DeviceUnavailable )?;
            self.device = Some( device );
        }
        Ok(())
    }


    /// Decodes the next frame and writes it to the device.
    ///
    /// Returns `false` at end of stream or after [`close`](Self::close).
    pub fn decode_next_frame( &mut self ) -> Result<bool, DecoderError> {
        if self.stream.is_none() {
            return Ok( false );
        }
        if self.device.is_none() {
            return Err( DecoderError::DeviceNotOpen );
        }

        let Some( packet ) = self.next_packet()? else {
            return Ok( false );
        };

        let frame = self.frame_index;
        self.decode_packet( &packet )
            .map_err( |e| DecoderError::Decode { frame, message: e.to_string() } )?;

        if let ( Some( device ), Some( buf ) ) = ( self.device.as_mut(), self.sample_buf.as_ref() ) {
            device.write( buf.samples() ).map_err( DecoderError::Output )?;
        }

        self.frame_index += 1;
        Ok( true )
    }


    /// Consumes the next frame without rendering it.
    ///
    /// The frame still goes through the codec so the layer III bit reservoir
    /// is primed when audible decoding starts. Returns `false` at end of stream.
    pub fn skip_next_frame( &mut self ) -> Result<bool, DecoderError> {
        let Some( packet ) = self.next_packet()? else {
            return Ok( false );
        };

        if let Err( e ) = self.decode_packet( &packet ) {
            tracing::debug!( "Ignoring decode error while skipping frame {}: {}", self.frame_index, e );
        }

        self.frame_index += 1;
        Ok( true )
    }


    /// Flushes and closes the device and drops the input stream.
    ///
    /// Safe to call more than once.
    pub fn close( &mut self ) {
        if let Some( mut device ) = self.device.take() {
            if let Err( e ) = device.flush() {
                tracing::warn!( "Failed to flush audio device: {}", e );
            }
            device.close();
        }
        if self.stream.take().is_some() {
            tracing::debug!( "Decoder closed at frame {}", self.frame_index );
        }
    }


    /// Reads the next packet of our track. `None` at end of stream.
    fn next_packet( &mut self ) -> Result<Option<Packet>, DecoderError> {
        let Some( stream ) = self.stream.as_mut() else {
            return Ok( None );
        };

        loop {
            let packet = match stream.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    if self.truncated_tail {
                        return Err( DecoderError::Decode {
                            frame: self.frame_index,
                            message: "truncated frame at end of stream".into(),
                        });
                    }
                    return Ok( None );
                }
                Err( e ) => {
                    return Err( DecoderError::Decode { frame: self.frame_index, message: e.to_string() } );
                }
            };

            // Skip packets not for our track
            if packet.track_id() == stream.track_id {
                return Ok( Some( packet ) );
            }
        }
    }


    /// Runs a packet through the codec into the sample buffer.
    fn decode_packet( &mut self, packet: &Packet ) -> Result<(), SymphoniaError> {
        let Some( stream ) = self.stream.as_mut() else {
            return Ok(());
        };

        let decoded = stream.decoder.decode( packet )?;
        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();

        // Create or grow the sample buffer
        if self.sample_buf.as_ref().map_or( true, |buf| buf.capacity() < needed ) {
            self.sample_buf = Some( SampleBuffer::new( decoded.capacity() as u64, spec ) );
        }
        if let Some( buf ) = self.sample_buf.as_mut() {
            buf.copy_interleaved_ref( decoded );
        }

        Ok(())
    }
}


/// Bitrates in kbps by [MPEG-1 L1, L2, L3, MPEG-2/2.5 L1, L2 and L3], index 1..=14.
const BITRATES: [[u32; 14]; 5] = [
    [ 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448 ],
    [ 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384 ],
    [ 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320 ],
    [ 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256 ],
    [ 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160 ],
];

const SAMPLE_RATES: [u32; 3] = [ 44100, 48000, 32000 ];


/// Length in bytes of the MPEG audio frame starting with `header`.
///
/// `None` for anything that is not a valid header, including free-format
/// frames whose length cannot be read from the header.
fn mpeg_frame_len( header: [u8; 4] ) -> Option<usize> {
    if header[ 0 ] != 0xFF || header[ 1 ] & 0xE0 != 0xE0 {
        return None;
    }

    let version = ( header[ 1 ] >> 3 ) & 0x03;
    let layer = ( header[ 1 ] >> 1 ) & 0x03;
    let bitrate_index = ( header[ 2 ] >> 4 ) as usize;
    let rate_index = ( ( header[ 2 ] >> 2 ) & 0x03 ) as usize;
    let padding = ( ( header[ 2 ] >> 1 ) & 0x01 ) as u32;

    if version == 1 || layer == 0 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }

    let mpeg1 = version == 3;
    let table = match ( mpeg1, layer ) {
        ( true, 3 ) => 0,
        ( true, 2 ) => 1,
        ( true, _ ) => 2,
        ( false, 3 ) => 3,
        ( false, _ ) => 4,
    };
    let bitrate = BITRATES[ table ][ bitrate_index - 1 ] * 1000;

    let sample_rate = match version {
        3 => SAMPLE_RATES[ rate_index ],
        2 => SAMPLE_RATES[ rate_index ] / 2,
        _ => SAMPLE_RATES[ rate_index ] / 4,
    };

    let len = match layer {
        3 => ( 12 * bitrate / sample_rate + padding ) * 4,
        1 if !mpeg1 => 72 * bitrate / sample_rate + padding,
        _ => 144 * bitrate / sample_rate + padding,
    };
    Some( len as usize )
}


/// Size of a leading ID3v2 tag, or 0.
fn id3v2_len( data: &[u8] ) -> usize {
    if data.len() < 10 || &data[ ..3 ] != b"ID3" {
        return 0;
    }
    let size = data[ 6..10 ].iter().fold( 0usize, |acc, b| ( acc << 7 ) | ( *b & 0x7F ) as usize );
    let footer = if data[ 5 ] & 0x10 != 0 { 10 } else { 0 };
    10 + size + footer
}


/// Walks the chain of frame headers and reports whether the last chained
/// frame runs past the end of the data.
///
/// A header only counts when it directly follows a complete frame, so stray
/// sync bytes in trailing junk are not mistaken for a cut-off frame.
fn has_truncated_tail( data: &[u8] ) -> bool {
    let mut end = data.len();
    if end >= 128 && &data[ end - 128..end - 125 ] == b"TAG" {
        end -= 128;
    }
    let data = &data[ ..end ];

    let mut pos = id3v2_len( data );
    let mut chained = false;

    while pos + 4 <= data.len() {
        let header = [ data[ pos ], data[ pos + 1 ], data[ pos + 2 ], data[ pos + 3 ] ];
        match mpeg_frame_len( header ) {
            Some( len ) if pos + len <= data.len() => {
                pos += len;
                chained = true;
            }
            Some( _ ) if chained => return true,
            _ => {
                pos += 1;
                chained = false;
            }
        }
    }

    // A header cut off after its first bytes
    chained && pos < data.len() && data[ pos ] == 0xFF
}


impl Drop for FrameDecoder {
    fn drop( &mut self ) {
        self.close();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::test_support::{ silent_mp3, MockBackend, SAMPLES_PER_FRAME };


    fn track( frames: usize ) -> Track {
        Track::new( silent_mp3( frames ) )
    }


    #[test]
    fn test_open_reads_stream_format() {
        let decoder = FrameDecoder::open( &track( 3 ) ).unwrap();
        assert_eq!( decoder.spec(), StreamSpec { sample_rate: 44100, channels: 1 } );
        assert_eq!( decoder.frame_index(), 0 );
        assert!( !decoder.has_device() );
    }


    #[test]
    fn test_open_rejects_garbage() {
        let garbage = Track::new( b"definitely not an mpeg stream".to_vec() );
        assert!( matches!( FrameDecoder::open( &garbage ), Err( DecoderError::UnsupportedFormat ) ) );
    }


    #[test]
    fn test_decode_writes_each_frame_then_reports_end() {
        let backend = MockBackend::new();
        let mut decoder = FrameDecoder::open( &track( 5 ) ).unwrap();
        decoder.open_device( &backend ).unwrap();

        let mut frames = 0;
        while decoder.decode_next_frame().unwrap() {
            frames += 1;
        }

        assert_eq!( frames, 5 );
        assert_eq!( decoder.frame_index(), 5 );
        assert_eq!( backend.frames_written(), vec![ 5 ] );
        assert_eq!( backend.samples_written(), 5 * SAMPLES_PER_FRAME );
        assert_eq!( backend.specs(), vec![ StreamSpec { sample_rate: 44100, channels: 1 } ] );
        assert!( !decoder.decode_next_frame().unwrap() );
    }


    #[test]
    fn test_truncated_last_frame_is_a_decode_error() {
        let mut data = silent_mp3( 10 );
        data.truncate( data.len() - 200 );

        let backend = MockBackend::new();
        let mut decoder = FrameDecoder::open( &Track::new( data ) ).unwrap();
        decoder.open_device( &backend ).unwrap();

        let mut frames = 0;
        let err = loop {
            match decoder.decode_next_frame() {
                Ok( true ) => frames += 1,
                Ok( false ) => panic!( "truncated stream ended cleanly after {} frames", frames ),
                Err( e ) => break e,
            }
        };

        assert_eq!( frames, 9 );
        assert!( matches!( err, DecoderError::Decode { frame: 9, .. } ) );
    }


    #[test]
    fn test_truncated_tail_detection() {
        let whole = silent_mp3( 4 );
        assert!( !has_truncated_tail( &whole ) );
        assert!( has_truncated_tail( &whole[ ..whole.len() - 1 ] ) );
        assert!( has_truncated_tail( &whole[ ..whole.len() - 415 ] ) );
        assert!( !has_truncated_tail( b"definitely not an mpeg stream" ) );

        // ID3v2 tag in front, ID3v1 tag behind
        let mut tagged = b"ID3\x04\x00\x00\x00\x00\x00\x05hello".to_vec();
        tagged.extend_from_slice( &whole );
        let mut v1 = b"TAG".to_vec();
        v1.resize( 128, 0xFF );
        tagged.extend_from_slice( &v1 );
        assert!( !has_truncated_tail( &tagged ) );
    }


    #[test]
    fn test_frame_len_from_header() {
        assert_eq!( mpeg_frame_len( [ 0xFF, 0xFB, 0x90, 0xC4 ] ), Some( 417 ) );
        assert_eq!( mpeg_frame_len( [ 0xFF, 0xFB, 0x92, 0xC4 ] ), Some( 418 ) );
        assert_eq!( mpeg_frame_len( [ 0xFF, 0xFB, 0x00, 0xC4 ] ), None );
        assert_eq!( mpeg_frame_len( [ 0x00, 0xFB, 0x90, 0xC4 ] ), None );
    }


    #[test]
    fn test_skip_does_not_render() {
        let backend = MockBackend::new();
        let mut decoder = FrameDecoder::open( &track( 4 ) ).unwrap();
        decoder.open_device( &backend ).unwrap();

        assert!( decoder.skip_next_frame().unwrap() );
        assert!( decoder.skip_next_frame().unwrap() );
        assert!( decoder.decode_next_frame().unwrap() );

        assert_eq!( decoder.frame_index(), 3 );
        assert_eq!( backend.frames_written(), vec![ 1 ] );
    }


    #[test]
    fn test_decode_without_device_fails() {
        let mut decoder = FrameDecoder::open( &track( 2 ) ).unwrap();
        assert!( matches!( decoder.decode_next_frame(), Err( DecoderError::DeviceNotOpen ) ) );
        assert_eq!( decoder.frame_index(), 0 );
    }


    #[test]
    fn test_open_device_failure() {
        let backend = MockBackend::failing();
        let mut decoder = FrameDecoder::open( &track( 2 ) ).unwrap();
        assert!( matches!( decoder.open_device( &backend ), Err( DecoderError::DeviceUnavailable( _ ) ) ) );
        assert!( !decoder.has_device() );
    }


    #[test]
    fn test_close_is_idempotent() {
        let backend = MockBackend::new();
        let mut decoder = FrameDecoder::open( &track( 3 ) ).unwrap();
        decoder.open_device( &backend ).unwrap();
        decoder.decode_next_frame().unwrap();

        decoder.close();
        decoder.close();
        drop( decoder );

        assert_eq!( backend.opens(), 1 );
        assert_eq!( backend.closes(), 1 );
        assert_eq!( backend.flushes(), 1 );
        assert!( !backend.is_open() );
    }


    #[test]
    fn test_closed_decoder_reports_end_of_stream() {
        let backend = MockBackend::new();
        let mut decoder = FrameDecoder::open( &track( 3 ) ).unwrap();
        decoder.open_device( &backend ).unwrap();
        decoder.close();

        assert!( !decoder.decode_next_frame().unwrap() );
        assert!( !decoder.skip_next_frame().unwrap() );
    }
}
