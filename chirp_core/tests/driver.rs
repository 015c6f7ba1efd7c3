//! End-to-end checks driving the public playback API with a synthesized
//! in-memory GBS image.

use chirp_core::gbs::GbsError;
use chirp_core::player::Player;

/// Builds a minimal valid GBS image: one song, INIT and PLAY both a
/// single RET, timers left at the vertical-sync default.
fn silent_image() -> Vec<u8> {
    let mut data = vec![0u8; 0x70];
    data[0..3].copy_from_slice(b"GBS");
    data[3] = 1; // version
    data[4] = 1; // song count
    data[5] = 1; // start song, 1-based
    data[6..8].copy_from_slice(&0x0400u16.to_le_bytes()); // load addr
    data[8..10].copy_from_slice(&0x0400u16.to_le_bytes()); // init addr
    data[10..12].copy_from_slice(&0x0410u16.to_le_bytes()); // play addr
    data[12..14].copy_from_slice(&0xE000u16.to_le_bytes()); // initial sp
    data[14] = 0; // tma
    data[15] = 0; // tac
    data[16..20].copy_from_slice(b"Test");

    let mut body = vec![0u8; 0x20];
    body[0x00] = 0xC9; // 0x0400: RET
    body[0x10] = 0xC9; // 0x0410: RET
    data.extend_from_slice(&body);
    data
}

#[test]
fn loads_and_selects_songs() {
    let data = silent_image();
    let mut player = Player::power_on(&data, 48_000).unwrap();
    assert_eq!(player.header().title, "Test");
    assert_eq!(player.header().start_song, 0);
    player.run_init(0).unwrap();
    assert!(matches!(
        player.run_init(1),
        Err(GbsError::SongOutOfRange { .. })
    ));
}

#[test]
fn rejects_malformed_files() {
    let mut data = silent_image();
    data[0] = b'X';
    assert!(matches!(
        Player::power_on(&data, 48_000),
        Err(GbsError::BadIdentifier)
    ));

    let mut data = silent_image();
    data[3] = 3;
    assert!(matches!(
        Player::power_on(&data, 48_000),
        Err(GbsError::UnsupportedVersion(3))
    ));

    let data = vec![0u8; 0x20];
    assert!(matches!(
        Player::power_on(&data, 48_000),
        Err(GbsError::Truncated)
    ));
}

#[test]
fn vertical_sync_frame_size() {
    // With TAC bit 2 clear the driver runs at the ~59.7 Hz vertical
    // sync rate: floor(48000 / 59.7275) stereo pairs per frame
    let player = Player::power_on(&silent_image(), 48_000).unwrap();
    assert_eq!(player.frame_samples(), 803 * 2);
}

#[test]
fn silent_driver_fills_with_silence() {
    let data = silent_image();
    let mut player = Player::power_on(&data, 48_000).unwrap();
    player.run_init(0).unwrap();

    // Three full frames plus a partial one, pulled the way the audio
    // backend would pull them
    let frame = player.frame_samples();
    let mut buf = vec![1.0f32; frame * 3 + 100];
    player.fill(&mut buf);
    assert!(buf.iter().all(|&s| s == 0.0));
}

#[test]
fn fill_returns_exact_lengths_across_frame_boundaries() {
    let data = silent_image();
    let mut player = Player::power_on(&data, 48_000).unwrap();
    player.run_init(0).unwrap();

    // Odd-sized pulls must still come back complete
    for len in [1usize, 7, 803, 1606, 4096] {
        let mut buf = vec![f32::NAN; len];
        player.fill(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.0), "pull of {} samples", len);
    }
}
