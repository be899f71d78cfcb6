use crate::device::DeviceManager;
use crate::source_trait::{AudioSource, ChunkRead};
use asrlink_core::RecognitionError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── CaptureSource ─────────────────────────────────────────────

/// Live microphone source producing PCM s16le bytes.
///
/// The cpal stream lives on a dedicated `audio-capture` thread and pushes
/// samples into a ring buffer; `read_chunk` drains it on a poll interval.
pub struct CaptureSource {
    device_name: String,
    sample_rate: u32,
    channels: u16,
    max_duration: Option<Duration>,
    running: Option<Running>,
    closed: AtomicBool,
}

struct Running {
    consumer: Mutex<HeapCons<i16>>,
    stream_failed: Arc<AtomicBool>,
    started: Instant,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(device_name: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            device_name: device_name.to_string(),
            sample_rate,
            channels,
            max_duration: None,
            running: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Report end-of-data after `duration` of recording.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn build_stream(
    device_name: &str,
    sample_rate: u32,
    channels: u16,
    mut producer: HeapProd<i16>,
    failed: Arc<AtomicBool>,
) -> Result<Stream, RecognitionError> {
    let device = DeviceManager::new().get_input_device(device_name)?;
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_callback = move |err: cpal::StreamError| {
        tracing::error!("capture stream error: {}", err);
        failed.store(true, Ordering::Relaxed);
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    // Overflow is dropped; the reader drains every poll interval
                    let _ = producer.try_push(to_pcm16(sample));
                }
            },
            err_callback,
            None,
        )
        .map_err(|e| RecognitionError::AudioDevice(format!("failed to build stream: {e}")))?;
    stream
        .play()
        .map_err(|e| RecognitionError::AudioDevice(format!("failed to start stream: {e}")))?;
    Ok(stream)
}

#[async_trait]
impl AudioSource for CaptureSource {
    fn name(&self) -> &str {
        "capture"
    }

    async fn open(&mut self) -> Result<(), RecognitionError> {
        if self.running.is_some() {
            return Err(RecognitionError::AudioDevice("source already opened".to_string()));
        }

        // ~2 seconds of audio
        let capacity = (self.sample_rate as usize) * (self.channels as usize) * 2;
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let stream_failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let device_name = self.device_name.clone();
        let (sample_rate, channels) = (self.sample_rate, self.channels);
        let failed_flag = Arc::clone(&stream_failed);
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream =
                    match build_stream(&device_name, sample_rate, channels, producer, failed_flag) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));
                // Park until close(); a dropped sender also wakes us
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                RecognitionError::AudioDevice(format!("failed to spawn capture thread: {e}"))
            })?;

        let ready = ready_rx.await.map_err(|_| {
            RecognitionError::AudioDevice("capture thread exited during setup".to_string())
        })?;
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        tracing::info!(
            device = %self.device_name,
            sample_rate = self.sample_rate,
            channels = self.channels,
            "capture started"
        );
        self.running = Some(Running {
            consumer: Mutex::new(consumer),
            stream_failed,
            started: Instant::now(),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        });
        Ok(())
    }

    async fn read_chunk(&self, max_bytes: usize) -> Result<ChunkRead, RecognitionError> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| RecognitionError::AudioDevice("source not opened".to_string()))?;
        let wanted = (max_bytes / 2).max(1);
        let mut samples = Vec::with_capacity(wanted);
        let mut scratch = vec![0i16; wanted];

        loop {
            if self.is_closed() {
                return Err(RecognitionError::AudioDevice("capture closed".to_string()));
            }
            if running.stream_failed.load(Ordering::Relaxed) {
                return Err(RecognitionError::AudioDevice("capture stream failed".to_string()));
            }
            {
                let mut consumer = running.consumer.lock().map_err(|_| {
                    RecognitionError::AudioDevice("capture buffer poisoned".to_string())
                })?;
                let n = consumer.pop_slice(&mut scratch[..wanted - samples.len()]);
                samples.extend_from_slice(&scratch[..n]);
            }

            let expired = self
                .max_duration
                .is_some_and(|limit| running.started.elapsed() >= limit);
            if expired || samples.len() == wanted {
                return Ok(ChunkRead {
                    bytes: pcm16_bytes(&samples),
                    is_last: expired,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(running) = &self.running else {
            return;
        };
        if let Ok(mut stop) = running.stop_tx.lock() {
            stop.take();
        }
        if let Ok(mut thread) = running.thread.lock() {
            if let Some(handle) = thread.take() {
                if handle.join().is_err() {
                    tracing::warn!("capture thread panicked");
                }
            }
        }
        tracing::info!(device = %self.device_name, "capture stopped");
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
