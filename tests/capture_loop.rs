use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shmcam::capture::{Frame, FrameSource, PixelFormat, SensorReadings};
use shmcam::convert::{argb_size, i420_size};
use shmcam::error::{ConversionError, GrabError, PipelineError, ShmError};
use shmcam::pipeline::{CancellationToken, CaptureLoop, LoopOptions, LoopState, Segments};
use shmcam::shm::SharedSegment;
use shmcam::telemetry::{ChannelSink, TelemetryKind};

fn unique_names(tag: &str) -> (String, String) {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let base = format!(
        "shmcam-loop-{}-{}-{}",
        std::process::id(),
        tag,
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    shmcam::shm::default_names(&base)
}

/// Replays a fixed script, then cancels and keeps timing out
struct ScriptedSource {
    script: VecDeque<Result<Frame, GrabError>>,
    cancel: CancellationToken,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Frame, GrabError>>, cancel: &CancellationToken) -> Self {
        Self {
            script: script.into(),
            cancel: cancel.clone(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError> {
        match self.script.pop_front() {
            Some(next) => next,
            None => {
                self.cancel.cancel();
                Err(GrabError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Never produces a frame
struct SilentSource;

impl FrameSource for SilentSource {
    fn grab(&mut self, timeout: Duration) -> Result<Frame, GrabError> {
        thread::sleep(timeout);
        Err(GrabError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

fn options(width: u32, height: u32) -> LoopOptions {
    LoopOptions {
        width,
        height,
        grab_timeout: Duration::from_millis(5),
        skip_argb: false,
    }
}

fn timeout() -> Result<Frame, GrabError> {
    Err(GrabError::Timeout { timeout_ms: 5 })
}

#[test]
fn mono_frame_reaches_both_segments() {
    let (i420_name, argb_name) = unique_names("mono");
    let segments = Segments::create(&i420_name, &argb_name, 4, 2).unwrap();
    let i420_reader = SharedSegment::open(&i420_name).unwrap();
    let argb_reader = SharedSegment::open(&argb_name).unwrap();

    let stamp = UNIX_EPOCH + Duration::from_secs(1_650_000_000);
    let frame = Frame::new(4, 2, PixelFormat::Mono8, vec![10u8; 8], stamp);

    let cancel = CancellationToken::new();
    let source = ScriptedSource::new(vec![Ok(frame)], &cancel);
    let mut capture = CaptureLoop::new(source, segments, options(4, 2)).unwrap();
    assert_eq!(capture.state(), LoopState::Idle);

    let stats = capture.run(&cancel).unwrap();
    assert_eq!(capture.state(), LoopState::Terminated);
    assert_eq!(stats.frames_grabbed, 1);
    assert_eq!(stats.published_i420, 1);
    assert_eq!(stats.published_argb, 1);

    let (i420, i420_stamp) = i420_reader.snapshot().unwrap();
    assert_eq!(i420, vec![10, 10, 10, 10, 10, 10, 10, 10, 128, 128, 128, 128]);
    assert_eq!(i420_stamp, Some(stamp));

    let (argb, argb_stamp) = argb_reader.snapshot().unwrap();
    assert_eq!(argb.len(), argb_size(4, 2));
    assert!(argb.chunks_exact(4).all(|px| px == [10, 10, 10, 255]));
    assert_eq!(argb_stamp, Some(stamp));
}

#[test]
fn timeouts_keep_the_loop_alive_without_publishing() {
    let (i420_name, argb_name) = unique_names("timeouts");
    let segments = Segments::create(&i420_name, &argb_name, 4, 2).unwrap();
    let reader = SharedSegment::open(&i420_name).unwrap();

    let cancel = CancellationToken::new();
    let source = ScriptedSource::new((0..5).map(|_| timeout()).collect(), &cancel);
    let mut capture = CaptureLoop::new(source, segments, options(4, 2)).unwrap();

    let stats = capture.run(&cancel).unwrap();
    // Five scripted timeouts plus the one that carries the cancellation
    assert_eq!(stats.grab_timeouts, 6);
    assert_eq!(stats.frames_grabbed, 0);
    assert_eq!(stats.published_i420, 0);
    assert_eq!(reader.lock().unwrap().sequence(), 0);
}

#[test]
fn silent_source_runs_until_cancelled() {
    let (i420_name, argb_name) = unique_names("silent");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();
    let cancel = CancellationToken::new();
    let mut capture = CaptureLoop::new(SilentSource, segments, options(2, 2)).unwrap();
    let counters = capture.counters();

    let stopper = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };

    let stats = capture.run(&cancel).unwrap();
    stopper.join().unwrap();

    assert!(stats.grab_timeouts > 1);
    assert_eq!(stats.published_i420 + stats.published_argb, 0);
    assert_eq!(counters.snapshot(), stats);
}

#[test]
fn timeout_between_frames_keeps_last_frame() {
    let (i420_name, argb_name) = unique_names("keep");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();
    let reader = SharedSegment::open(&i420_name).unwrap();

    let first = UNIX_EPOCH + Duration::from_secs(100);
    let cancel = CancellationToken::new();
    let source = ScriptedSource::new(
        vec![
            Ok(Frame::new(2, 2, PixelFormat::Mono8, vec![50u8; 4], first)),
            timeout(),
            timeout(),
        ],
        &cancel,
    );
    CaptureLoop::new(source, segments, options(2, 2))
        .unwrap()
        .run(&cancel)
        .unwrap();

    let guard = reader.lock().unwrap();
    assert_eq!(guard.sequence(), 1);
    assert_eq!(guard.timestamp(), Some(first));
    assert_eq!(&guard.data()[..4], &[50, 50, 50, 50]);
}

#[test]
fn fatal_grab_terminates_and_releases_segments() {
    let (i420_name, argb_name) = unique_names("fatal");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();

    let cancel = CancellationToken::new();
    let source = ScriptedSource::new(
        vec![timeout(), Err(GrabError::fatal("sensor unplugged"))],
        &cancel,
    );
    let mut capture = CaptureLoop::new(source, segments, options(2, 2)).unwrap();

    let err = capture.run(&cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Grab(GrabError::Fatal(_))));
    assert_eq!(capture.state(), LoopState::Terminated);
    assert!(!cancel.is_cancelled());
    assert!(SharedSegment::open(&i420_name).is_err());
    assert!(SharedSegment::open(&argb_name).is_err());
}

#[test]
fn truncated_raw_frame_is_fatal_and_never_published() {
    let (i420_name, argb_name) = unique_names("short");
    let segments = Segments::create(&i420_name, &argb_name, 4, 2).unwrap();
    let reader = SharedSegment::open(&i420_name).unwrap();

    let cancel = CancellationToken::new();
    let frame = Frame::new(4, 2, PixelFormat::Yuyv422, vec![0u8; 15], SystemTime::now());
    let source = ScriptedSource::new(vec![Ok(frame)], &cancel);
    let mut capture = CaptureLoop::new(source, segments, options(4, 2)).unwrap();

    let err = capture.run(&cancel).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Conversion(ConversionError::SizeMismatch {
            expected: 16,
            actual: 15,
            ..
        })
    ));
    assert_eq!(reader.lock().unwrap().sequence(), 0);
}

#[test]
fn skip_argb_publishes_only_i420() {
    let (i420_name, argb_name) = unique_names("skip");
    let segments = Segments::create(&i420_name, &argb_name, 4, 2).unwrap();
    let argb_reader = SharedSegment::open(&argb_name).unwrap();
    let i420_reader = SharedSegment::open(&i420_name).unwrap();

    let cancel = CancellationToken::new();
    let yuyv = vec![
        16, 90, 32, 160, 48, 90, 64, 160, //
        80, 90, 96, 160, 112, 90, 128, 160,
    ];
    let frame = Frame::new(4, 2, PixelFormat::Yuyv422, yuyv, SystemTime::now());
    let source = ScriptedSource::new(vec![Ok(frame)], &cancel);
    let mut opts = options(4, 2);
    opts.skip_argb = true;

    let stats = CaptureLoop::new(source, segments, opts)
        .unwrap()
        .run(&cancel)
        .unwrap();
    assert_eq!(stats.published_i420, 1);
    assert_eq!(stats.published_argb, 0);

    let (i420, _) = i420_reader.snapshot().unwrap();
    assert_eq!(i420.len(), i420_size(4, 2));
    assert_eq!(&i420[..8], &[16, 32, 48, 64, 80, 96, 112, 128]);
    assert_eq!(&i420[8..], &[90, 90, 160, 160]);
    assert_eq!(argb_reader.lock().unwrap().sequence(), 0);
}

#[test]
fn telemetry_carries_frame_timestamp_and_sender() {
    let (i420_name, argb_name) = unique_names("telemetry");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();
    let (tx, rx) = flume::unbounded();

    let stamp = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let readings = SensorReadings {
        exposure_time_us: 8000.0,
        gain: 2.0,
        temperature_c: 38.5,
    };
    let frames = vec![
        Ok(Frame::new(2, 2, PixelFormat::Mono8, vec![0u8; 4], stamp).with_readings(readings)),
        // Frames without readings produce no telemetry
        Ok(Frame::new(2, 2, PixelFormat::Mono8, vec![0u8; 4], stamp)),
    ];

    let cancel = CancellationToken::new();
    let source = ScriptedSource::new(frames, &cancel);
    let stats = CaptureLoop::new(source, segments, options(2, 2))
        .unwrap()
        .with_telemetry(Box::new(ChannelSink::new(11, tx)))
        .run(&cancel)
        .unwrap();
    assert_eq!(stats.telemetry_published, 1);

    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].kind, TelemetryKind::ExposureTime(8000.0));
    assert_eq!(messages[1].kind, TelemetryKind::Temperature(38.5));
    assert!(messages.iter().all(|m| m.sender_id == 11 && m.timestamp == stamp));
}

#[test]
fn dropped_telemetry_receiver_does_not_stop_capture() {
    let (i420_name, argb_name) = unique_names("telemetry-gone");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();
    let (tx, rx) = flume::unbounded();
    drop(rx);

    let readings = SensorReadings {
        exposure_time_us: 1.0,
        gain: 1.0,
        temperature_c: 1.0,
    };
    let frame = || {
        Ok(Frame::new(2, 2, PixelFormat::Mono8, vec![0u8; 4], SystemTime::now())
            .with_readings(readings))
    };

    let cancel = CancellationToken::new();
    let source = ScriptedSource::new(vec![frame(), frame()], &cancel);
    let stats = CaptureLoop::new(source, segments, options(2, 2))
        .unwrap()
        .with_telemetry(Box::new(ChannelSink::new(1, tx)))
        .run(&cancel)
        .unwrap();
    assert_eq!(stats.published_i420, 2);
    assert_eq!(stats.telemetry_published, 0);
}

#[test]
fn abandoned_segment_lock_is_fatal() {
    let (i420_name, argb_name) = unique_names("abandoned");
    let segments = Segments::create(&i420_name, &argb_name, 2, 2).unwrap();

    // A reader dies while holding the I420 lock
    let reader = SharedSegment::open(&i420_name).unwrap();
    thread::spawn(move || mem::forget(reader.lock().unwrap()))
        .join()
        .unwrap();

    let cancel = CancellationToken::new();
    let frame = Frame::new(2, 2, PixelFormat::Mono8, vec![9u8; 4], SystemTime::now());
    let source = ScriptedSource::new(vec![Ok(frame)], &cancel);
    let mut capture = CaptureLoop::new(source, segments, options(2, 2)).unwrap();

    let err = capture.run(&cancel).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Publish(ShmError::Abandoned(ref name)) if *name == i420_name
    ));
    assert_eq!(capture.state(), LoopState::Terminated);
    assert_eq!(capture.counters().snapshot().published_i420, 0);
    assert!(SharedSegment::open(&i420_name).is_err());
    assert!(SharedSegment::open(&argb_name).is_err());
}
