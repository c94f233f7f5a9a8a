//! Channel fixtures.
//!
//! [`open_test_channel`] boots a real, unregistered channel on a
//! temp-directory socket so integration tests can connect clients to it.

use std::sync::Arc;

use ferrule_config::ChannelConfig;
use ferrule_core::Channel;
use tempfile::TempDir;

use crate::socket::test_channel_config;

/// Open a channel on a fresh temp-dir socket with default config.
///
/// Keep the [`TempDir`] alive for the test's duration. Must be called
/// from within a tokio runtime.
pub fn open_test_channel(name: &str) -> (TempDir, Arc<Channel>) {
    let (dir, config) = test_channel_config();
    let channel = Channel::open(name, config).expect("failed to open test channel");
    (dir, channel)
}

/// Open a channel with a caller-tweaked config on a fresh temp dir.
pub fn open_test_channel_with(
    name: &str,
    tweak: impl FnOnce(&mut ChannelConfig),
) -> (TempDir, Arc<Channel>) {
    let (dir, mut config) = test_channel_config();
    tweak(&mut config);
    let channel = Channel::open(name, config).expect("failed to open test channel");
    (dir, channel)
}
