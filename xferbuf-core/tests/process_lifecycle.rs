//! End to end through a forked buffer process.
//!
//! Kept to a single test so the fork happens while the harness runs only
//! this one thread.

use xferbuf::{
    AudioFormat, BufferConfig, BufferController, Encoding, NullSinkFactory, PlaybackState,
    SpawnMode,
};

#[test]
fn forked_buffer_plays_drains_stops_and_exits_cleanly() {
    let config = BufferConfig {
        buffer_bytes: 65_536,
        spawn_mode: SpawnMode::Process,
        ..BufferConfig::default()
    };
    let mut ctl = BufferController::launch(config, NullSinkFactory::new()).unwrap();
    assert!(ctl.is_running());
    assert_eq!(ctl.capacity(), 65_536);

    ctl.open(None, None).unwrap();
    ctl.start(AudioFormat::new(44_100, 2, Encoding::SIGNED_16))
        .unwrap();
    assert_eq!(ctl.state(), PlaybackState::Live);

    let silence = vec![0u8; 32_768];
    assert_eq!(ctl.write(&silence).unwrap(), 32_768);

    ctl.drain().unwrap();
    assert_eq!(ctl.fill(), 0);

    ctl.stop().unwrap();
    assert_eq!(ctl.state(), PlaybackState::Stopped);

    // Waits for the child and fails unless it exited with status 0.
    ctl.shutdown().unwrap();
    assert!(!ctl.is_running());
}
