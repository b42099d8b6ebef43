use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::pcm::f32_to_i16;
use crate::ring_buffer::RingBuffer;

// --- Playout engine ------------------------------------------------------------
//
// Two clock domains meet here:
//   - network side: payloads arrive whenever the session delivers them and are
//     pushed into the channel's ring
//   - render side: a dedicated thread pulls exactly one block per period from
//     every connected ring, applies gain and pan, and sums into a stereo mix
//
// The rings are the only shared data. Gain, pan and the connected flag are
// plain atomics so the render thread never takes a lock. Underrun is silence;
// overrun evicts the oldest samples.

/// Per-channel path: ring -> gain -> pan -> mix bus.
#[derive(Debug)]
pub struct ChannelStrip {
    ring: RingBuffer,
    gain: AtomicU32,
    pan: AtomicU32,
    connected: AtomicBool,
}

impl ChannelStrip {
    fn new(ring_capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_capacity),
            gain: AtomicU32::new(0f32.to_bits()),
            pan: AtomicU32::new(0f32.to_bits()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

#[derive(Debug)]
pub struct PlayoutEngine {
    strips: Box<[ChannelStrip]>,
}

impl PlayoutEngine {
    pub fn new(channels: usize, ring_capacity: usize) -> Self {
        Self {
            strips: (0..channels).map(|_| ChannelStrip::new(ring_capacity)).collect(),
        }
    }

    pub fn channels(&self) -> usize {
        self.strips.len()
    }

    pub fn strip(&self, channel: usize) -> Option<&ChannelStrip> {
        self.strips.get(channel)
    }

    /// Feed decoded samples. Dropped (returns false) while the channel's path
    /// is disconnected: there is nothing to feed.
    pub fn push(&self, channel: usize, samples: &[f32]) -> bool {
        match self.strips.get(channel) {
            Some(s) if s.connected.load(Ordering::Acquire) => {
                s.ring.write(samples);
                true
            }
            _ => false,
        }
    }

    /// Bring the channel's path up with an empty ring. No audio from a
    /// previous activation survives.
    pub fn connect(&self, channel: usize) {
        if let Some(s) = self.strips.get(channel) {
            s.ring.clear();
            s.connected.store(true, Ordering::Release);
        }
    }

    pub fn disconnect(&self, channel: usize) {
        if let Some(s) = self.strips.get(channel) {
            s.connected.store(false, Ordering::Release);
            s.ring.clear();
        }
    }

    pub fn is_connected(&self, channel: usize) -> bool {
        self.strips
            .get(channel)
            .is_some_and(|s| s.connected.load(Ordering::Acquire))
    }

    pub fn set_gain(&self, channel: usize, gain: f32) {
        if let Some(s) = self.strips.get(channel) {
            s.gain.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
        }
    }

    pub fn set_pan(&self, channel: usize, pan: f32) {
        if let Some(s) = self.strips.get(channel) {
            s.pan.store(pan.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
        }
    }

    pub fn gain(&self, channel: usize) -> f32 {
        self.strips
            .get(channel)
            .map_or(0.0, |s| f32::from_bits(s.gain.load(Ordering::Relaxed)))
    }

    pub fn pan(&self, channel: usize) -> f32 {
        self.strips
            .get(channel)
            .map_or(0.0, |s| f32::from_bits(s.pan.load(Ordering::Relaxed)))
    }

    /// Render one block into `out` (interleaved stereo, `2 * frames` long).
    ///
    /// `scratch` must hold at least `frames` samples. Every connected ring is
    /// drained by `frames` samples, even at zero gain, so a muted channel keeps
    /// its timing and resumes in step when unmuted.
    pub fn render(&self, scratch: &mut [f32], out: &mut [f32]) {
        let frames = out.len() / 2;
        let scratch = &mut scratch[..frames];
        out.fill(0.0);

        for s in self.strips.iter() {
            if !s.connected.load(Ordering::Acquire) {
                continue;
            }
            s.ring.read_into(scratch);

            let gain = f32::from_bits(s.gain.load(Ordering::Relaxed));
            if gain == 0.0 {
                continue;
            }
            let (l, r) = pan_gains(f32::from_bits(s.pan.load(Ordering::Relaxed)));
            let (gl, gr) = (gain * l, gain * r);
            for (frame, x) in out.chunks_exact_mut(2).zip(scratch.iter()) {
                frame[0] += x * gl;
                frame[1] += x * gr;
            }
        }

        for x in out.iter_mut() {
            *x = x.clamp(-1.0, 1.0);
        }
    }
}

/// Linear pan law. Centre passes both sides at unity; full left/right
/// silences the opposite side.
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

// --- Output sinks ----------------------------------------------------------------

/// Destination for rendered blocks. Called on the render thread.
pub trait OutputSink: Send + 'static {
    fn write_block(&mut self, interleaved: &[f32]) -> std::io::Result<()>;
}

/// Renders and discards. Keeps the rings draining at real-time pace.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_block(&mut self, _interleaved: &[f32]) -> std::io::Result<()> {
        Ok(())
    }
}

/// Interleaved s16le stereo into any writer (stdout piped to a player,
/// a file, ...).
pub struct PcmWriterSink<W: Write + Send + 'static> {
    writer: W,
    bytes: Vec<u8>,
}

impl<W: Write + Send + 'static> PcmWriterSink<W> {
    pub fn new(writer: W, block_frames: usize) -> Self {
        Self { writer, bytes: Vec::with_capacity(block_frames * 2 * 2) }
    }
}

impl<W: Write + Send + 'static> OutputSink for PcmWriterSink<W> {
    fn write_block(&mut self, interleaved: &[f32]) -> std::io::Result<()> {
        self.bytes.clear();
        for s in interleaved {
            self.bytes.extend_from_slice(&f32_to_i16(*s).to_le_bytes());
        }
        self.writer.write_all(&self.bytes)?;
        self.writer.flush()
    }
}

// --- Render thread ---------------------------------------------------------------

/// If we fall this many blocks behind (suspended process, overloaded box) we
/// stop trying to catch up and re-anchor the clock.
const MAX_LATE_BLOCKS: u32 = 8;

pub struct RenderThread {
    running: Arc<AtomicBool>,
    blocks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    pub fn spawn(
        engine: Arc<PlayoutEngine>,
        mut sink: Box<dyn OutputSink>,
        block_frames: usize,
        sample_rate: u32,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let blocks = Arc::new(AtomicU64::new(0));
        let period = Duration::from_secs_f64(block_frames as f64 / sample_rate as f64);

        let handle = {
            let running = running.clone();
            let blocks = blocks.clone();
            std::thread::Builder::new()
                .name("channelmix-render".into())
                .spawn(move || {
                    info!(
                        "render: {block_frames} frames @ {sample_rate} Hz ({:.2} ms/block)",
                        period.as_secs_f64() * 1000.0
                    );

                    // Allocated once; the loop below never allocates.
                    let mut scratch = vec![0.0f32; block_frames];
                    let mut out = vec![0.0f32; block_frames * 2];
                    let mut next = Instant::now();

                    while running.load(Ordering::Relaxed) {
                        let now = Instant::now();
                        if next > now {
                            std::thread::sleep(next - now);
                        } else if now - next > period * MAX_LATE_BLOCKS {
                            debug!("render: fell behind by {:?}, re-anchoring", now - next);
                            next = now;
                        }
                        next += period;

                        engine.render(&mut scratch, &mut out);
                        if let Err(e) = sink.write_block(&out) {
                            warn!("render: output sink failed, stopping: {e}");
                            break;
                        }
                        blocks.fetch_add(1, Ordering::Relaxed);
                    }
                })?
        };

        Ok(Self { running, blocks, handle: Some(handle) })
    }

    pub fn blocks_rendered(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn render_block(engine: &PlayoutEngine, frames: usize) -> Vec<f32> {
        let mut scratch = vec![0.0; frames];
        let mut out = vec![0.0; frames * 2];
        engine.render(&mut scratch, &mut out);
        out
    }

    #[test]
    fn disconnected_channel_ignores_pushes() {
        let e = PlayoutEngine::new(2, 16);
        assert!(!e.push(0, &[0.5; 4]));
        e.set_gain(0, 1.0);
        assert!(render_block(&e, 4).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn gain_and_centre_pan() {
        let e = PlayoutEngine::new(1, 16);
        e.connect(0);
        e.set_gain(0, 0.4);
        assert!(e.push(0, &[0.5, 0.5]));
        let out = render_block(&e, 3);
        assert!((out[0] - 0.2).abs() < 1e-6 && (out[1] - 0.2).abs() < 1e-6);
        assert!((out[2] - 0.2).abs() < 1e-6 && (out[3] - 0.2).abs() < 1e-6);
        // Underrun slot.
        assert_eq!(&out[4..], &[0.0, 0.0]);
    }

    #[test]
    fn hard_pan_silences_other_side() {
        let e = PlayoutEngine::new(2, 16);
        for ch in 0..2 {
            e.connect(ch);
            e.set_gain(ch, 1.0);
        }
        e.set_pan(0, -1.0);
        e.set_pan(1, 1.0);
        e.push(0, &[0.25]);
        e.push(1, &[0.5]);
        let out = render_block(&e, 1);
        assert_eq!(out, vec![0.25, 0.5]);
        assert_eq!(pan_gains(0.5), (0.5, 1.0));
    }

    #[test]
    fn mix_is_clamped() {
        let e = PlayoutEngine::new(3, 16);
        for ch in 0..3 {
            e.connect(ch);
            e.set_gain(ch, 1.0);
            e.push(ch, &[0.9]);
        }
        assert_eq!(render_block(&e, 1), vec![1.0, 1.0]);
    }

    #[test]
    fn muted_channel_still_drains() {
        let e = PlayoutEngine::new(1, 16);
        e.connect(0);
        e.push(0, &[0.1, 0.2, 0.3, 0.4]);
        // gain 0 == muted
        render_block(&e, 2);
        e.set_gain(0, 1.0);
        let out = render_block(&e, 2);
        assert!((out[0] - 0.3).abs() < 1e-6 && (out[2] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn reconnect_starts_with_fresh_ring() {
        let e = PlayoutEngine::new(1, 16);
        e.connect(0);
        e.push(0, &[0.5; 8]);
        e.disconnect(0);
        e.connect(0);
        assert_eq!(e.strip(0).unwrap().ring().available(), 0);
    }

    #[test]
    fn pcm_sink_writes_s16le() {
        let mut sink = PcmWriterSink::new(Vec::new(), 1);
        sink.write_block(&[0.5, -1.0]).unwrap();
        assert_eq!(sink.writer, vec![0x00, 0x40, 0x00, 0x80]);
    }

    struct CaptureSink(Arc<Mutex<Vec<f32>>>);

    impl OutputSink for CaptureSink {
        fn write_block(&mut self, interleaved: &[f32]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(interleaved);
            Ok(())
        }
    }

    #[test]
    fn render_thread_drains_at_block_cadence() {
        let engine = Arc::new(PlayoutEngine::new(1, 4096));
        engine.connect(0);
        engine.set_gain(0, 1.0);
        engine.push(0, &[0.25; 256]);

        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut rt = RenderThread::spawn(
            engine.clone(),
            Box::new(CaptureSink(captured.clone())),
            128,
            48_000,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while rt.blocks_rendered() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        rt.stop();

        let got = captured.lock().unwrap();
        assert!(got.len() >= 4 * 256);
        // First two blocks carry the pushed audio, then silence.
        assert!(got[..512].iter().all(|s| (*s - 0.25).abs() < 1e-6));
        assert!(got[512..1024].iter().all(|s| *s == 0.0));
        assert_eq!(engine.strip(0).unwrap().ring().available(), 0);
    }
}
