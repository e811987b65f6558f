//! Controller sessions against a buffer process running on a worker thread.
//!
//! Thread mode shares the sink factory with the test, so the null sink's
//! counters and the channel sink's events are visible here.

use xferbuf::{
    AudioFormat, BufferConfig, BufferController, BufferError, ChannelSinkFactory, Encoding,
    ErrorCode, NullSinkFactory, PlaybackState, SinkEvent, SpawnMode,
};

fn threaded(buffer_bytes: usize, output_burst: usize) -> BufferConfig {
    BufferConfig {
        buffer_bytes,
        output_burst,
        spawn_mode: SpawnMode::Thread,
        ..BufferConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

const STEREO_S16: AudioFormat = AudioFormat::new(44_100, 2, Encoding::SIGNED_16);

#[test]
fn every_byte_reaches_the_sink_in_order() {
    let (factory, events) = ChannelSinkFactory::new();
    let mut ctl = BufferController::launch(threaded(4096, 1024), factory).unwrap();
    assert_eq!(ctl.capacity(), 4096);

    let opened = ctl.open(None, None).unwrap();
    assert_eq!(opened.driver.as_deref(), Some("channel"));
    let mono = AudioFormat::new(8_000, 1, Encoding::SIGNED_16);
    ctl.start(mono).unwrap();
    assert_eq!(ctl.state(), PlaybackState::Live);

    // Several times the ring, so the writer has to wait on the player.
    let input = pattern(20_000);
    assert_eq!(ctl.write(&input).unwrap(), input.len());
    ctl.drain().unwrap();
    assert_eq!(ctl.fill(), 0);

    let mut played = Vec::new();
    let mut opened_with = None;
    for event in events.try_iter() {
        match event {
            SinkEvent::Opened(format) => opened_with = Some(format),
            SinkEvent::Data(bytes) => {
                assert_eq!(bytes.len() % 2, 0, "sink saw a partial frame");
                assert!(bytes.len() <= 1024, "write larger than one burst");
                played.extend_from_slice(&bytes);
            }
            _ => {}
        }
    }
    assert_eq!(opened_with, Some(mono));
    assert_eq!(played, input);

    ctl.stop().unwrap();
    assert_eq!(ctl.state(), PlaybackState::Stopped);
    ctl.shutdown().unwrap();
}

#[test]
fn drop_frees_the_whole_ring_at_once() {
    let factory = NullSinkFactory::new();
    let mut ctl = BufferController::launch(threaded(65_536, 1024), factory).unwrap();
    ctl.open(None, None).unwrap();
    ctl.start(STEREO_S16).unwrap();

    // Below the preload target, so nothing is played yet.
    assert_eq!(ctl.write(&[0u8; 8000]).unwrap(), 8000);
    assert_eq!(ctl.fill(), 8000);

    ctl.drop_audio().unwrap();
    assert_eq!(ctl.fill(), 0);

    let room = 65_535 / 4 * 4;
    let silence = vec![0u8; room];
    assert_eq!(ctl.write(&silence).unwrap(), room);
    ctl.shutdown().unwrap();
}

#[test]
fn pause_resume_and_auto_resume_on_write() {
    let factory = NullSinkFactory::new();
    let mut ctl = BufferController::launch(threaded(16_384, 1024), factory).unwrap();
    ctl.open(None, None).unwrap();
    ctl.start(STEREO_S16).unwrap();

    ctl.pause().unwrap();
    assert_eq!(ctl.state(), PlaybackState::Paused);
    ctl.resume().unwrap();
    assert_eq!(ctl.state(), PlaybackState::Live);

    ctl.pause().unwrap();
    assert_eq!(ctl.write(&[0u8; 4096]).unwrap(), 4096);
    assert_eq!(ctl.state(), PlaybackState::Live);

    ctl.drain().unwrap();
    assert_eq!(ctl.fill(), 0);
    ctl.shutdown().unwrap();
}

#[test]
fn bounded_drain_leaves_the_device_alone() {
    let factory = NullSinkFactory::new();
    let stats = factory.clone();
    let mut ctl = BufferController::launch(threaded(65_536, 1024), factory).unwrap();
    ctl.open(None, None).unwrap();
    ctl.start(STEREO_S16).unwrap();

    // Below the preload target: everything stays queued until asked for.
    assert_eq!(ctl.write(&[0u8; 12_000]).unwrap(), 12_000);
    ctl.ndrain(4000).unwrap();
    assert!(ctl.fill() <= 8000, "fill {} after ndrain", ctl.fill());
    assert_eq!(stats.stats().drains, 0);

    ctl.drain().unwrap();
    assert_eq!(ctl.fill(), 0);
    assert_eq!(stats.stats().drains, 1);
    ctl.shutdown().unwrap();
}

#[test]
fn queries_report_what_the_sink_supports() {
    let factory = NullSinkFactory::new();
    let mut ctl = BufferController::launch(threaded(8192, 1024), factory).unwrap();
    ctl.open(None, None).unwrap();

    assert_eq!(
        ctl.query_encodings(48_000, 2).unwrap(),
        Encoding::SIGNED_16 | Encoding::FLOAT_32
    );

    let formats = ctl.query_formats(&[44_100, 48_000], 1, 2).unwrap();
    assert_eq!(formats.len(), 5);
    assert_eq!(formats[0], STEREO_S16);
    assert_eq!(
        formats[4],
        AudioFormat::new(48_000, 2, Encoding::SIGNED_16 | Encoding::FLOAT_32)
    );

    let err = ctl.query_formats(&[44_100], 2, 1).unwrap_err();
    assert!(matches!(err, BufferError::InvalidArgument(_)));
    assert_eq!(ctl.last_error(), ErrorCode::ArgError);
    ctl.shutdown().unwrap();
}

#[test]
fn unknown_driver_is_reported_and_the_session_survives() {
    let factory = NullSinkFactory::new();
    let mut ctl = BufferController::launch(threaded(8192, 1024), factory).unwrap();

    let err = ctl.open(Some("alsa"), None).unwrap_err();
    assert!(matches!(err, BufferError::Remote(ErrorCode::BadDriver)));
    assert_eq!(ctl.state(), PlaybackState::Dead);

    // A driver list falls through to the first one that loads.
    let opened = ctl.open(Some("alsa,null"), Some("probe")).unwrap();
    assert_eq!(opened.driver.as_deref(), Some("null"));
    assert_eq!(opened.device.as_deref(), Some("probe"));
    assert_eq!(opened.real_name.as_deref(), Some("null output"));
    ctl.shutdown().unwrap();
}

#[test]
fn close_releases_the_sink() {
    let factory = NullSinkFactory::new();
    let stats = factory.clone();
    let mut ctl = BufferController::launch(threaded(8192, 1024), factory).unwrap();
    ctl.open(None, None).unwrap();
    ctl.start(STEREO_S16).unwrap();
    assert_eq!(ctl.write(&[0u8; 2048]).unwrap(), 2048);

    ctl.close().unwrap();
    assert_eq!(ctl.state(), PlaybackState::Dead);
    assert_eq!(ctl.fill(), 0);
    let seen = stats.stats();
    assert_eq!(seen.bytes_written, 2048);
    assert_eq!(seen.opens, seen.closes);
    ctl.shutdown().unwrap();
}
