//! The process-channel slot state machine.
//!
//! `Channel::init` registers the one process-wide channel; this whole
//! sequence must live in a single test because the slot is global to
//! the test binary.

use ferrule_core::{Channel, ChannelError};
use ferrule_test_utils::socket::test_channel_config;
use ferrule_test_utils::tracing_setup::init_test_tracing;

#[tokio::test]
async fn test_process_channel_lifecycle() {
    init_test_tracing();
    let (_dir, config) = test_channel_config();

    assert!(Channel::current().is_none());
    let channel = Channel::init("proc", config.clone(), None).unwrap();
    assert!(Channel::current().is_some());

    // A second init is refused without touching the running channel.
    let err = Channel::init("other", config.clone(), None).unwrap_err();
    assert!(matches!(err, ChannelError::AlreadyInitialized));
    assert_eq!(Channel::current().unwrap().name(), "proc");
    assert!(channel.socket_path().exists());

    channel.fini().await.unwrap();
    assert!(Channel::current().is_none());
    assert!(!channel.socket_path().exists());

    // The exit hook is safe to call with no active channel.
    Channel::cleanup();

    // The slot never reopens after the process channel is finished.
    let err = Channel::init("again", config, None).unwrap_err();
    assert!(matches!(err, ChannelError::ShutDown));
}
