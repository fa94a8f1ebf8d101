//! PCM decoding for analysis

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{WorkerError, WorkerResult};

/// Mono PCM at the source sample rate
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples.len() as f32 / self.sample_rate as f32
        }
    }
}

/// Decode up to `max_secs` seconds of `path`, downmixed to mono
pub fn decode_mono(path: &Path, max_secs: u32) -> WorkerResult<DecodedAudio> {
    let path_str = path.display().to_string();
    let fail = |reason: String| WorkerError::audio_decoding(path_str.clone(), reason);

    let file = File::open(path).map_err(|e| fail(format!("open: {}", e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut format = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| fail(format!("probe: {}", e)))?
        .format;

    let track = format
        .default_track()
        .ok_or_else(|| fail("no default audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| fail("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| fail(format!("decoder: {}", e)))?;

    let limit = sample_rate as usize * max_secs.max(1) as usize;
    let mut samples = Vec::with_capacity(limit.min(sample_rate as usize * 30));

    while samples.len() < limit {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(fail(format!("read packet: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt packets are skipped
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::trace!(path = %path_str, error = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(fail(format!("decode: {}", e))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        samples.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    samples.truncate(limit);
    if samples.is_empty() {
        return Err(fail("no audio frames decoded".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}
