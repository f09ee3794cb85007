//! Integration tests against a real `vagrant` installation.
//!
//! These tests drive a real working directory and are gated behind the
//! `vagrant-integration-tests` feature because they need vagrant on `PATH`
//! and a prepared Vagrantfile.
//!
//! # Running
//!
//! ```bash
//! export HOSTLER_TEST_WORKDIR=/path/to/dir-with-Vagrantfile
//! cargo test --features vagrant-integration-tests --test vagrant_integration
//! ```
//!
//! The destroy test disposes of whatever host lives in that directory — point
//! it at a throwaway workspace.

#![cfg(feature = "vagrant-integration-tests")]

use std::path::PathBuf;

use hostler::config::CleanupPolicy;
use hostler::host::cleanup::run_cleanup;
use hostler::host::probe::probe_host_state;
use hostler::host::{HostState, keys};
use hostler::runner::{HostContext, ProcessRunner};

fn test_workdir() -> PathBuf {
    std::env::var("HOSTLER_TEST_WORKDIR")
        .map(PathBuf::from)
        .expect("set HOSTLER_TEST_WORKDIR to a directory containing a Vagrantfile")
}

#[tokio::test]
async fn probe_reports_a_state_for_the_test_host() {
    let ctx = HostContext::new(test_workdir());
    let state = probe_host_state(&ProcessRunner, &ctx)
        .await
        .expect("vagrant status output should resolve to a single state");
    assert!(!state.as_str().is_empty());
}

#[tokio::test]
async fn destroy_policy_leaves_the_host_not_created() {
    let workdir = test_workdir();
    let ctx = HostContext::new(&workdir);

    run_cleanup(&ProcessRunner, &ctx, &CleanupPolicy::Destroy, false)
        .await
        .expect("destroy cleanup should succeed");

    let state = probe_host_state(&ProcessRunner, &ctx)
        .await
        .expect("status after destroy");
    assert_eq!(state, HostState::NotCreated);
    assert!(!keys::private_key_path(&workdir).exists());
    assert!(!keys::public_key_path(&workdir).exists());
}
