//! Temp-directory socket fixtures.
//!
//! Channel sockets in tests live in a fresh temporary directory so that
//! concurrently running tests never collide on socket or lock paths.

use ferrule_config::ChannelConfig;
use tempfile::TempDir;

/// A [`ChannelConfig`] whose socket directory is a fresh temp dir.
///
/// Keep the returned [`TempDir`] alive for the duration of the test;
/// dropping it deletes the directory.
pub fn test_channel_config() -> (TempDir, ChannelConfig) {
    let dir = tempfile::tempdir().expect("failed to create temp socket dir");
    let config = ChannelConfig {
        socket_dir: dir.path().to_string_lossy().into_owned(),
        ..ChannelConfig::default()
    };
    (dir, config)
}
