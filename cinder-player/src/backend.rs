//! Live audio output: a render thread feeding a cpal stream.
//!
//! The audio callback never touches the player; it drains a lock-free ring
//! buffer with a batch `pop_slice` and silence-fills any shortfall. A
//! dedicated render thread keeps the ring topped up, locking the shared
//! [`Player`] once per chunk, and sleeps on a condvar that the callback
//! signals after consuming data. UI threads hold the same [`SharedPlayer`]
//! and take the lock for edits and transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use thiserror::Error;
use tracing::{debug, error};

use crate::player::lock_player;
use crate::{BitDepth, MixerConfig, Player, SharedPlayer};

/// Ring capacity in f32 samples (~100 ms of stereo at 44.1 kHz).
const RING_CAPACITY: usize = 8820;

/// Frames the render thread produces per pass.
const RENDER_CHUNK: usize = 512;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("no audio output device available")]
    NoDevice,

    #[error("querying default stream config failed: {0}")]
    StreamConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("building audio stream failed: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("starting audio stream failed: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported device sample format {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("spawning the render thread failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A player wired to the default audio device.
pub struct LivePlayer {
    player: SharedPlayer,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    render_thread: Option<JoinHandle<()>>,
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl LivePlayer {
    /// Open the default output device and start playback. The player is
    /// reconfigured to the device rate (16-bit stereo internally).
    pub fn new(mut player: Player) -> Result<Self, LiveError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(LiveError::NoDevice)?;
        let device_config = device.default_output_config()?;
        let sample_rate = device_config.sample_rate().0;

        let base = *player.config();
        player.configure(MixerConfig {
            sample_rate,
            bit_depth: BitDepth::Bits16,
            channels: 2,
            ..base
        });
        let player = Arc::new(Mutex::new(player));

        let ring = HeapRb::<f32>::new(RING_CAPACITY);
        let (producer, mut consumer) = ring.split();

        let wake = Arc::new((Mutex::new(false), Condvar::new()));
        let callback_wake = Arc::clone(&wake);
        let notify = move || {
            let (flag, condvar) = &*callback_wake;
            if let Ok(mut ready) = flag.lock() {
                *ready = true;
            }
            condvar.notify_one();
        };

        let err_fn = |err| error!("audio stream error: {err}");
        let stream = match device_config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &device_config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let popped = consumer.pop_slice(data);
                    data[popped..].fill(0.0);
                    notify();
                },
                err_fn,
                None,
            )?,
            cpal::SampleFormat::I16 => {
                let mut scratch = vec![0.0f32; 4096];
                device.build_output_stream(
                    &device_config.into(),
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if scratch.len() < data.len() {
                            scratch.resize(data.len(), 0.0);
                        }
                        let popped = consumer.pop_slice(&mut scratch[..data.len()]);
                        for (dst, &src) in data.iter_mut().zip(&scratch[..popped]) {
                            *dst = (src * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                        data[popped..].fill(0);
                        notify();
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(LiveError::UnsupportedFormat(other)),
        };

        stream.play()?;
        debug!(sample_rate, "audio stream started");

        let shutdown = Arc::new(AtomicBool::new(false));
        let render_thread = Some(spawn_render_thread(
            Arc::clone(&player),
            producer,
            Arc::clone(&shutdown),
            Arc::clone(&wake),
        )?);

        Ok(Self {
            player,
            shutdown,
            wake,
            render_thread,
            _stream: stream,
            sample_rate,
        })
    }

    /// The shared player handle, for transport and edits from other
    /// threads.
    pub fn player(&self) -> SharedPlayer {
        Arc::clone(&self.player)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for LivePlayer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let (flag, condvar) = &*self.wake;
        if let Ok(mut ready) = flag.lock() {
            *ready = true;
        }
        condvar.notify_all();
        if let Some(handle) = self.render_thread.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_render_thread(
    player: SharedPlayer,
    mut producer: ringbuf::HeapProd<f32>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cinder-render".into())
        .spawn(move || {
            let mut pcm = vec![0u8; RENDER_CHUNK * 4]; // 16-bit stereo
            let mut samples = vec![0.0f32; RENDER_CHUNK * 2];

            while !shutdown.load(Ordering::Acquire) {
                // Top the ring up one chunk at a time; the lock covers one
                // render call, never the callback.
                while producer.vacant_len() >= RENDER_CHUNK * 2 {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let frames = {
                        let mut player = lock_player(&player);
                        player.render(&mut pcm)
                    };

                    // End of song: push what we got, then idle until the
                    // transport restarts us.
                    for (dst, src) in samples.iter_mut().zip(pcm.chunks_exact(2)) {
                        let v = i16::from_le_bytes([src[0], src[1]]);
                        *dst = v as f32 / 32768.0;
                    }
                    let produced = frames * 2;
                    producer.push_slice(&samples[..produced]);
                    if frames < RENDER_CHUNK {
                        break;
                    }
                }

                let (flag, condvar) = &*wake;
                let Ok(guard) = flag.lock() else { return };
                let result = condvar.wait_timeout_while(
                    guard,
                    Duration::from_millis(100),
                    |ready| !*ready,
                );
                if let Ok((mut guard, _)) = result {
                    *guard = false;
                }
            }
        })
}
