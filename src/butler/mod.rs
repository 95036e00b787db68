// ABOUTME: The Butler: a readahead buffer that keeps the player fed from one background thread
// ABOUTME: Grounded on butler.cc's summon/pending_seek/pass() cycle and its change-notification glitch avoidance

mod queue;

use crate::error::ProgrammingError;
use crate::types::{Frame, FramePayload};
use queue::ReadaheadQueue;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Below this many buffered video frames the butler always keeps fetching.
pub const MIN_VIDEO_READAHEAD: usize = 10;
/// Above this many buffered video frames the butler stops fetching and
/// waits to be summoned again by a consumer.
pub const MAX_VIDEO_READAHEAD: usize = 48;

const AUDIO_SAMPLE_RATE: usize = 48_000;
const VIDEO_FRAME_RATE: usize = 24;

/// Audio readahead bounds, derived the same way the original derives them
/// from the video readahead bounds: a fixed number of frames' worth of
/// 48kHz audio samples.
pub const MIN_AUDIO_READAHEAD: usize = AUDIO_SAMPLE_RATE * MIN_VIDEO_READAHEAD / VIDEO_FRAME_RATE;
pub const MAX_AUDIO_READAHEAD: usize = AUDIO_SAMPLE_RATE * MAX_VIDEO_READAHEAD / VIDEO_FRAME_RATE;

#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub presentation_time: Duration,
    pub samples: Arc<Vec<f32>>,
}

/// Whether the butler should bother filling the audio queue at all; mirrors
/// the original's `_disable_audio` flag for projects with no audio mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audio {
    Enabled,
    Disabled,
}

/// A change notification pushed in by whatever owns the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// A minor update (e.g. a still frame's duration); no buffered content
    /// is invalidated.
    Frequent,
    /// The crop/framing changed; already-buffered frames have their
    /// prepared-image metadata invalidated in place, not dropped.
    Crop,
    /// A structural change is coming; stop filling until `Done` arrives so
    /// pre- and post-change frames never land in the same buffer.
    Pending,
    /// The structural change announced by `Pending` has completed.
    Done,
    /// Playback was cancelled; the butler thread should exit.
    Cancelled,
}

/// Producer side: whoever owns the playlist/decoders. The butler thread
/// calls back into this on its own thread to pull the next unit of each
/// media type, and to perform the repositioning a seek requests.
pub trait Player: Send + Sync {
    fn produce_video(&self) -> Option<Frame>;
    fn produce_audio(&self) -> Option<AudioChunk>;
    fn produce_text(&self) -> Option<String>;

    /// Reposition playback. `accurate` distinguishes a precise seek (land
    /// exactly on `to`) from an approximate one (land on the nearest
    /// keyframe-equivalent, faster but imprecise) the way scrubbing versus a
    /// deliberate timecode entry would.
    fn seek(&self, to: Duration, accurate: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButlerState {
    Running,
    Cancelled,
    Finished,
}

/// Stands in for the original's per-frame image preparation (format
/// conversion, alignment, fast-decode warm-up); real J2K decoding isn't in
/// scope here, so this just touches the buffer to keep the prepare pool
/// doing real, observable work.
fn prepare_frame(frame: &Frame) {
    if let FramePayload::Raw(image) = &frame.payload {
        let _ = crate::socket::fletcher32(&image.data);
    }
}

fn prepare_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

pub struct Butler {
    player: Arc<dyn Player>,
    video: ReadaheadQueue<Frame>,
    audio: ReadaheadQueue<AudioChunk>,
    text: ReadaheadQueue<String>,
    disable_audio: bool,
    state: Mutex<ButlerState>,
    summon: Condvar,
    summon_lock: Mutex<()>,
    pending_seek: Mutex<Option<(Duration, bool)>>,
    /// Count of overlapping `Pending` notifications not yet matched by a
    /// `Done`; filling only resumes once it drops back to zero.
    suspended: AtomicI64,
    /// The position of the most recent `player_change`-driven seek, used to
    /// avoid seeking backwards if buffers haven't refilled since the last one.
    awaiting: Mutex<Option<Duration>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    prepare_queue: Arc<ReadaheadQueue<Frame>>,
    prepare_stop: Arc<AtomicBool>,
    prepare_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Butler {
    pub fn new(player: Arc<dyn Player>, audio: Audio) -> Arc<Self> {
        Arc::new(Self {
            player,
            video: ReadaheadQueue::new(),
            audio: ReadaheadQueue::new(),
            text: ReadaheadQueue::new(),
            disable_audio: audio == Audio::Disabled,
            state: Mutex::new(ButlerState::Running),
            summon: Condvar::new(),
            summon_lock: Mutex::new(()),
            pending_seek: Mutex::new(None),
            suspended: AtomicI64::new(0),
            awaiting: Mutex::new(None),
            thread: Mutex::new(None),
            prepare_queue: Arc::new(ReadaheadQueue::new()),
            prepare_stop: Arc::new(AtomicBool::new(false)),
            prepare_threads: Mutex::new(Vec::new()),
        })
    }

    /// Starts the background fetch thread, plus a pool of prepare threads
    /// that warm up newly-buffered video frames. Matches the original's
    /// construction-time thread spawn; callers own the returned `Arc` and
    /// must call [`Butler::cancel`] before dropping it if the threads are
    /// still meant to be running.
    pub fn start(self: &Arc<Self>) {
        let butler = self.clone();
        let handle = std::thread::spawn(move || butler.run());
        *self.thread.lock().unwrap() = Some(handle);

        let mut prepare_threads = self.prepare_threads.lock().unwrap();
        for _ in 0..prepare_pool_size() {
            let queue = self.prepare_queue.clone();
            let stop = self.prepare_stop.clone();
            prepare_threads.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(frame) = queue.pop_blocking(Duration::from_millis(200)) {
                        prepare_frame(&frame);
                    }
                }
            }));
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            if matches!(*self.state.lock().unwrap(), ButlerState::Cancelled) {
                break;
            }

            if let Some((seek_time, accurate)) = self.pending_seek.lock().unwrap().take() {
                self.seek_unlocked(seek_time, accurate);
            }

            match self.should_run() {
                Ok(true) => self.pass(),
                Ok(false) => self.wait_to_be_summoned(),
                Err(e) => {
                    warn!(error = %e, "butler invariant violated, stopping");
                    *self.state.lock().unwrap() = ButlerState::Cancelled;
                    break;
                }
            }
        }
        debug!("butler thread exiting");
    }

    fn audio_sample_count(&self) -> usize {
        self.audio.sum_by(|chunk| chunk.samples.len())
    }

    /// Whether the fetch loop should keep pulling more content right now.
    /// Grounded on `butler.cc`'s `should_run()`: a hard abort if either
    /// buffer has grown to ten times its max readahead (a producer/consumer
    /// accounting bug), definitely run if either buffer is below its
    /// minimum, otherwise keep going until both are full.
    fn should_run(&self) -> Result<bool, ProgrammingError> {
        let video_len = self.video.len();
        let audio_len = self.audio_sample_count();

        if video_len > MAX_VIDEO_READAHEAD * 10 {
            return Err(ProgrammingError::new(
                file!(),
                line!(),
                format!("video queue reached {video_len} frames (audio is {audio_len})"),
            ));
        }
        if !self.disable_audio && audio_len > MAX_AUDIO_READAHEAD * 10 {
            return Err(ProgrammingError::new(
                file!(),
                line!(),
                format!("audio queue reached {audio_len} samples (video is {video_len})"),
            ));
        }

        let state = *self.state.lock().unwrap();
        if matches!(state, ButlerState::Cancelled | ButlerState::Finished)
            || self.suspended.load(Ordering::SeqCst) != 0
        {
            return Ok(false);
        }

        if video_len < MIN_VIDEO_READAHEAD || (!self.disable_audio && audio_len < MIN_AUDIO_READAHEAD) {
            return Ok(true);
        }

        Ok(video_len < MAX_VIDEO_READAHEAD && (self.disable_audio || audio_len < MAX_AUDIO_READAHEAD))
    }

    fn pass(&self) {
        if let Some(frame) = self.player.produce_video() {
            self.prepare_queue.push(frame.clone());
            self.video.push(frame);
        } else {
            *self.state.lock().unwrap() = ButlerState::Finished;
        }
        if !self.disable_audio {
            if let Some(audio) = self.player.produce_audio() {
                self.audio.push(audio);
            }
        }
        if let Some(text) = self.player.produce_text() {
            self.text.push(text);
        }
    }

    fn wait_to_be_summoned(&self) {
        let guard = self.summon_lock.lock().unwrap();
        let _ = self
            .summon
            .wait_timeout(guard, Duration::from_millis(200))
            .unwrap();
    }

    fn summon_now(&self) {
        self.summon.notify_all();
    }

    pub fn get_video(&self, blocking: bool) -> Option<Frame> {
        let frame = if blocking {
            self.video.pop_blocking(Duration::from_millis(500))
        } else {
            self.video.pop_nonblocking()
        };
        if frame.is_some() {
            self.summon_now();
        }
        frame
    }

    pub fn get_audio(&self, blocking: bool) -> Option<AudioChunk> {
        let chunk = if blocking {
            self.audio.pop_blocking(Duration::from_millis(500))
        } else {
            self.audio.pop_nonblocking()
        };
        if chunk.is_some() {
            self.summon_now();
        }
        chunk
    }

    pub fn get_closed_caption(&self) -> Option<String> {
        let text = self.text.pop_nonblocking();
        if text.is_some() {
            self.summon_now();
        }
        text
    }

    /// Requests a seek. The actual repositioning happens on the butler
    /// thread at the top of its next loop iteration, not inline here, since
    /// only that thread is allowed to call into the player. `accurate`
    /// is passed straight through to [`Player::seek`].
    pub fn seek(&self, to: Duration, accurate: bool) {
        *self.awaiting.lock().unwrap() = None;
        *self.pending_seek.lock().unwrap() = Some((to, accurate));
        self.video.clear();
        self.audio.clear();
        self.text.clear();
        self.summon_now();
    }

    fn seek_unlocked(&self, to: Duration, accurate: bool) {
        debug!(?to, accurate, "butler performing deferred seek");
        *self.state.lock().unwrap() = ButlerState::Running;
        self.player.seek(to, accurate);
        self.video.clear();
        self.audio.clear();
        self.text.clear();
    }

    /// Handles a structural-change notification from the playlist owner.
    /// `Crop` resets buffered frames' prepared-image metadata in place so
    /// they get re-prepared against the new crop without losing their place
    /// in the queue. `Pending`/`Done` nest via a counter, since two
    /// overlapping structural changes can be announced before either
    /// finishes; filling only resumes once the count returns to zero, at
    /// which point `Done` reseeks to wherever the video queue's next frame
    /// sits so pre- and post-change frames never land in the buffer
    /// together.
    pub fn player_change(&self, change: ChangeType) {
        match change {
            ChangeType::Frequent => {}
            ChangeType::Crop => {
                self.video.for_each_mut(|frame| frame.needs_reprepare = true);
                self.summon_now();
            }
            ChangeType::Pending => {
                self.suspended.fetch_add(1, Ordering::SeqCst);
            }
            ChangeType::Done => {
                let still_suspended = self.suspended.fetch_sub(1, Ordering::SeqCst) - 1 > 0;
                if still_suspended
                    || matches!(*self.state.lock().unwrap(), ButlerState::Cancelled)
                    || self.pending_seek.lock().unwrap().is_some()
                {
                    self.summon_now();
                    return;
                }

                let next = self
                    .video
                    .peek()
                    .map(|f| f.presentation_time)
                    .unwrap_or_default();
                let mut awaiting = self.awaiting.lock().unwrap();
                let seek_to = match *awaiting {
                    Some(previous) if previous > next => previous,
                    _ => next,
                };
                drop(awaiting);

                self.seek_unlocked(seek_to, true);
                *self.awaiting.lock().unwrap() = Some(seek_to);
                self.summon_now();
            }
            ChangeType::Cancelled => {
                self.suspended.fetch_sub(1, Ordering::SeqCst);
                *self.state.lock().unwrap() = ButlerState::Cancelled;
                self.summon_now();
            }
        }
    }

    pub fn cancel(&self) {
        *self.state.lock().unwrap() = ButlerState::Cancelled;
        self.prepare_stop.store(true, Ordering::SeqCst);
        self.summon_now();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        for handle in self.prepare_threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }

    pub fn video_readahead(&self) -> usize {
        self.video.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Eye, PixelFormat, RawImage};
    use std::sync::atomic::AtomicU64;

    struct CountingPlayer {
        produced: AtomicU64,
        limit: u64,
    }

    impl Player for CountingPlayer {
        fn produce_video(&self) -> Option<Frame> {
            let index = self.produced.fetch_add(1, Ordering::SeqCst);
            if index >= self.limit {
                return None;
            }
            Some(Frame {
                index,
                eye: Eye::Both,
                presentation_time: Duration::from_secs(index),
                payload: FramePayload::Raw(RawImage::new(4, 4, PixelFormat::Rgb24, vec![0u8; 48])),
                needs_reprepare: false,
            })
        }
        fn produce_audio(&self) -> Option<AudioChunk> {
            None
        }
        fn produce_text(&self) -> Option<String> {
            None
        }
        fn seek(&self, _to: Duration, _accurate: bool) {}
    }

    #[test]
    fn should_run_stops_filling_once_readahead_is_satisfied() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1000,
        });
        let butler = Butler::new(player, Audio::Disabled);
        for _ in 0..(MIN_VIDEO_READAHEAD * 2) {
            butler.pass();
        }
        assert!(!butler.should_run().unwrap());
    }

    #[test]
    fn should_run_waits_on_audio_too_when_enabled() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1000,
        });
        let butler = Butler::new(player, Audio::Enabled);
        for _ in 0..(MIN_VIDEO_READAHEAD * 2) {
            butler.pass();
        }
        // Video is full but CountingPlayer never produces audio, so with
        // audio enabled the butler should still want to keep running.
        assert!(butler.should_run().unwrap());
    }

    #[test]
    fn pending_change_pauses_filling_until_done() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1000,
        });
        let butler = Butler::new(player, Audio::Disabled);
        butler.player_change(ChangeType::Pending);
        assert!(!butler.should_run().unwrap());
        butler.player_change(ChangeType::Done);
        assert!(butler.should_run().unwrap());
    }

    #[test]
    fn overlapping_pending_notifications_need_matching_done_calls() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1000,
        });
        let butler = Butler::new(player, Audio::Disabled);
        butler.player_change(ChangeType::Pending);
        butler.player_change(ChangeType::Pending);
        butler.player_change(ChangeType::Done);
        assert!(!butler.should_run().unwrap(), "one Pending is still outstanding");
        butler.player_change(ChangeType::Done);
        assert!(butler.should_run().unwrap());
    }

    #[test]
    fn crop_change_marks_frames_for_reprepare_without_dropping_them() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1000,
        });
        let butler = Butler::new(player, Audio::Disabled);
        butler.pass();
        butler.pass();
        assert_eq!(butler.video_readahead(), 2);
        butler.player_change(ChangeType::Crop);
        assert_eq!(butler.video_readahead(), 2);
        let frame = butler.get_video(false).unwrap();
        assert!(frame.needs_reprepare);
    }

    #[test]
    fn cancel_stops_the_background_thread() {
        let player = Arc::new(CountingPlayer {
            produced: AtomicU64::new(0),
            limit: 1_000_000,
        });
        let butler = Butler::new(player, Audio::Disabled);
        butler.start();
        std::thread::sleep(Duration::from_millis(50));
        butler.cancel();
        assert!(matches!(*butler.state.lock().unwrap(), ButlerState::Cancelled));
    }
}
