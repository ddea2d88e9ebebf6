//! Audio devices: microphone capture with CPAL and playback with Rodio.
//!
//! CPAL streams and Rodio output streams are not `Send`, so each lives on a
//! dedicated OS thread and is driven through channels. The engine only sees the
//! [`AudioBackend`] seam: [`SystemAudio`] for real devices, [`ManualAudio`] for
//! headless runs and tests.

use crate::capture::CaptureFrame;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What the input side reports to the engine.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Frame(CaptureFrame),
    /// The device failed mid-session. Fatal.
    Failed(String),
}

/// Requested capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub sample_rate: u32,
    /// Samples per delivered frame.
    pub frame_samples: usize,
}

pub trait AudioInput: Send {
    /// Stop delivering frames and release the device. Idempotent.
    fn stop(&mut self);
}

pub trait AudioOutput: Send {
    /// Queue mono f32 samples right after whatever is already queued.
    fn play(&mut self, samples: Vec<f32>) -> VoiceResult<()>;
    /// Drop everything queued or playing.
    fn stop_all(&mut self);
    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Opens the input and output devices for one session.
pub trait AudioBackend: Send + 'static {
    fn start_input(
        &mut self,
        spec: InputSpec,
        frames: mpsc::UnboundedSender<InputEvent>,
    ) -> VoiceResult<Box<dyn AudioInput>>;

    fn start_output(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>>;
}

/// Default host devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAudio;

impl SystemAudio {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl AudioBackend for SystemAudio {
    fn start_input(
        &mut self,
        spec: InputSpec,
        frames: mpsc::UnboundedSender<InputEvent>,
    ) -> VoiceResult<Box<dyn AudioInput>> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("tutor-voice-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(spec, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Parked until the handle is stopped or dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("capture thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(SystemInput {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::AudioDevice(
                "capture thread exited during start".to_string(),
            )),
        }
    }

    fn start_output(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<OutputCommand>();

        let thread = thread::Builder::new()
            .name("tutor-voice-playback".to_string())
            .spawn(move || run_playback_thread(sample_rate, cmd_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(SystemOutput {
                cmd_tx: Some(cmd_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::Playback(
                "playback thread exited during start".to_string(),
            )),
        }
    }
}

fn build_input_stream(
    spec: InputSpec,
    frames: mpsc::UnboundedSender<InputEvent>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate = spec.sample_rate,
        "opening input device"
    );

    let default_config = device.default_input_config()?;
    debug!(?default_config, "default input config");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_samples = spec.frame_samples.max(1);
    let mut pending = Vec::with_capacity(frame_samples);
    let error_tx = frames.clone();

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() >= frame_samples {
                    let frame = CaptureFrame::new(std::mem::replace(
                        &mut pending,
                        Vec::with_capacity(frame_samples),
                    ));
                    if frames.send(InputEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
        },
        move |err| {
            error!("Audio input stream error: {}", err);
            let _ = error_tx.send(InputEvent::Failed(err.to_string()));
        },
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

struct SystemInput {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioInput for SystemInput {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("audio capture stopped");
        }
    }
}

impl Drop for SystemInput {
    fn drop(&mut self) {
        self.stop();
    }
}

enum OutputCommand {
    Play(Vec<f32>),
    StopAll,
}

fn run_playback_thread(
    sample_rate: u32,
    commands: std_mpsc::Receiver<OutputCommand>,
    ready: std_mpsc::SyncSender<VoiceResult<()>>,
) {
    let opened = rodio::OutputStream::try_default()
        .map_err(|e| VoiceError::Playback(e.to_string()))
        .and_then(|(stream, handle)| {
            let sink =
                rodio::Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
            Ok((stream, handle, sink))
        });
    let (_stream, handle, mut sink) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(sample_rate, "audio playback ready");

    while let Ok(command) = commands.recv() {
        match command {
            OutputCommand::Play(samples) => {
                sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
            }
            OutputCommand::StopAll => {
                sink.stop();
                // A stopped sink stays stopped; start the next response on a fresh one.
                match rodio::Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(e) => {
                        error!("Failed to recreate playback sink: {}", e);
                        return;
                    }
                }
                debug!("playback stopped");
            }
        }
    }
    sink.stop();
    debug!("playback thread exiting");
}

struct SystemOutput {
    cmd_tx: Option<std_mpsc::Sender<OutputCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioOutput for SystemOutput {
    fn play(&mut self, samples: Vec<f32>) -> VoiceResult<()> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| VoiceError::Playback("output closed".to_string()))?;
        tx.send(OutputCommand::Play(samples))
            .map_err(|_| VoiceError::Playback("playback thread is gone".to_string()))
    }

    fn stop_all(&mut self) {
        if let Some(tx) = &self.cmd_tx {
            if tx.send(OutputCommand::StopAll).is_err() {
                warn!("stop requested but playback thread is gone");
            }
        }
    }

    fn close(&mut self) {
        // Dropping the sender ends the thread's command loop.
        self.cmd_tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("audio playback closed");
        }
    }
}

impl Drop for SystemOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Default)]
struct ManualState {
    frames: Option<mpsc::UnboundedSender<InputEvent>>,
    input_spec: Option<InputSpec>,
    input_stops: usize,
    output_open: bool,
    played: Vec<Vec<f32>>,
    output_stops: usize,
    fail_input: Option<String>,
    fail_output: Option<String>,
}

/// Backend driven by hand: frames are pushed by the caller and played
/// samples are recorded instead of reaching a device.
#[derive(Debug, Clone, Default)]
pub struct ManualAudio {
    state: Arc<Mutex<ManualState>>,
}

impl ManualAudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// `start_input` fails with `AudioDevice(message)`.
    pub fn with_failing_input(message: impl Into<String>) -> Self {
        let audio = Self::new();
        audio.lock().fail_input = Some(message.into());
        audio
    }

    /// `play` fails with `Playback(message)` from now on.
    pub fn fail_output(&self, message: impl Into<String>) {
        self.lock().fail_output = Some(message.into());
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver one frame as if the microphone produced it. False if input is not running.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        match &self.lock().frames {
            Some(tx) => tx.send(InputEvent::Frame(CaptureFrame::new(samples))).is_ok(),
            None => false,
        }
    }

    /// Report a device failure on the input stream.
    pub fn fail_input(&self, message: impl Into<String>) -> bool {
        match &self.lock().frames {
            Some(tx) => tx.send(InputEvent::Failed(message.into())).is_ok(),
            None => false,
        }
    }

    pub fn input_running(&self) -> bool {
        self.lock().frames.is_some()
    }

    pub fn input_spec(&self) -> Option<InputSpec> {
        self.lock().input_spec
    }

    pub fn input_stops(&self) -> usize {
        self.lock().input_stops
    }

    pub fn output_open(&self) -> bool {
        self.lock().output_open
    }

    /// Every buffer handed to the output, in order.
    pub fn played(&self) -> Vec<Vec<f32>> {
        self.lock().played.clone()
    }

    pub fn output_stops(&self) -> usize {
        self.lock().output_stops
    }
}

impl AudioBackend for ManualAudio {
    fn start_input(
        &mut self,
        spec: InputSpec,
        frames: mpsc::UnboundedSender<InputEvent>,
    ) -> VoiceResult<Box<dyn AudioInput>> {
        let mut state = self.lock();
        if let Some(message) = state.fail_input.clone() {
            return Err(VoiceError::AudioDevice(message));
        }
        state.frames = Some(frames);
        state.input_spec = Some(spec);
        Ok(Box::new(ManualInput {
            state: Arc::clone(&self.state),
        }))
    }

    fn start_output(&mut self, _sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>> {
        self.lock().output_open = true;
        Ok(Box::new(ManualOutput {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ManualInput {
    state: Arc<Mutex<ManualState>>,
}

impl AudioInput for ManualInput {
    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.frames.take().is_some() {
            state.input_stops += 1;
        }
    }
}

struct ManualOutput {
    state: Arc<Mutex<ManualState>>,
}

impl ManualOutput {
    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AudioOutput for ManualOutput {
    fn play(&mut self, samples: Vec<f32>) -> VoiceResult<()> {
        let mut state = self.lock();
        if let Some(message) = state.fail_output.clone() {
            return Err(VoiceError::Playback(message));
        }
        if !state.output_open {
            return Err(VoiceError::Playback("output closed".to_string()));
        }
        state.played.push(samples);
        Ok(())
    }

    fn stop_all(&mut self) {
        self.lock().output_stops += 1;
    }

    fn close(&mut self) {
        self.lock().output_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_input_delivers_frames_until_stopped() {
        let mut audio = ManualAudio::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = InputSpec {
            sample_rate: 24_000,
            frame_samples: 4096,
        };
        let mut input = audio.start_input(spec, tx).unwrap();

        assert!(audio.push_frame(vec![0.2; 4]));
        assert!(matches!(rx.try_recv(), Ok(InputEvent::Frame(f)) if f.samples.len() == 4));

        input.stop();
        input.stop();
        assert!(!audio.push_frame(vec![0.2; 4]));
        assert_eq!(audio.input_stops(), 1);
        assert_eq!(audio.input_spec(), Some(spec));
    }

    #[test]
    fn manual_output_records_and_closes() {
        let mut audio = ManualAudio::new();
        let mut output = audio.start_output(24_000).unwrap();
        output.play(vec![0.1, 0.2]).unwrap();
        output.stop_all();
        output.close();

        assert_eq!(audio.played(), vec![vec![0.1, 0.2]]);
        assert_eq!(audio.output_stops(), 1);
        assert!(output.play(vec![0.3]).is_err());
    }

    #[test]
    fn failing_input_is_a_device_error() {
        let mut audio = ManualAudio::with_failing_input("no microphone");
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = audio.start_input(
            InputSpec {
                sample_rate: 24_000,
                frame_samples: 4096,
            },
            tx,
        );
        assert!(matches!(result, Err(VoiceError::AudioDevice(m)) if m == "no microphone"));
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn list_system_input_devices() {
        let devices = SystemAudio::list_input_devices().unwrap();
        println!("Available input devices: {:?}", devices);
    }
}
